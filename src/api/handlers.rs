use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::websocket::ServerMessage;
use crate::AppState;

/// Health check endpoint handler
/// Returns the health report; degraded reports are served as 503
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let report = state.monitor.health().await;

    if report.is_healthy() {
        HttpResponse::Ok().json(report)
    } else {
        HttpResponse::ServiceUnavailable().json(report)
    }
}

pub async fn stats(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.monitor.statistics().await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyRequest {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Restrict delivery to these sessions; everyone when absent.
    #[serde(default)]
    pub session_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Serialize)]
pub struct NotifyResponse {
    pub delivered: usize,
}

pub async fn notify(
    req: web::Json<NotifyRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let req = req.into_inner();
    if req.event.trim().is_empty() {
        return Err(AppError::ValidationError("event must not be empty".into()));
    }

    let msg = ServerMessage::notification(req.event.clone(), req.data);
    let delivered = match &req.session_ids {
        Some(ids) => {
            state
                .broadcaster
                .broadcast(&msg, |session| ids.contains(&session.id))
                .await
        }
        None => state.broadcaster.broadcast_all(&msg).await,
    };

    info!("Notification '{}' delivered to {} sessions", req.event, delivered);
    Ok(HttpResponse::Ok().json(NotifyResponse { delivered }))
}
