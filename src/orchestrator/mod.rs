//! Analysis orchestrator seam
//!
//! Decoded frames are handed to an [`Orchestrator`], which performs the
//! actual analysis out of process (or summarises the frame locally when no
//! endpoint is configured).

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error};
use url::Url;

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::frame::FrameRecord;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Analyse one frame. `requested_at` is when the gateway forwarded it.
    async fn analyze(
        &self,
        frame: &FrameRecord,
        requested_at: DateTime<Utc>,
    ) -> Result<Value, OrchestratorError>;
}

/// Forwards frames to a remote analysis endpoint as JSON.
pub struct HttpOrchestrator {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpOrchestrator {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, OrchestratorError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| OrchestratorError::InvalidConfig(format!("{}: {}", endpoint, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn analyze(
        &self,
        frame: &FrameRecord,
        requested_at: DateTime<Utc>,
    ) -> Result<Value, OrchestratorError> {
        let body = json!({
            "format": frame.format,
            "size": frame.size,
            "width": frame.width,
            "height": frame.height,
            "capturedAt": frame.timestamp,
            "requestedAt": requested_at,
            "data": BASE64.encode(&frame.data),
        });

        let res = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            error!("Orchestrator returned {}: {}", status, text);
            return Err(OrchestratorError::ResponseError(format!("status {}", status)));
        }

        let result: Value = res.json().await?;
        debug!("Orchestrator analysed {} frame of {} bytes", frame.format, frame.size);
        Ok(result)
    }
}

/// Describes the frame without analysing it, for standalone deployments.
#[derive(Debug, Default)]
pub struct PassthroughOrchestrator;

#[async_trait]
impl Orchestrator for PassthroughOrchestrator {
    async fn analyze(
        &self,
        frame: &FrameRecord,
        requested_at: DateTime<Utc>,
    ) -> Result<Value, OrchestratorError> {
        Ok(json!({
            "analyzed": false,
            "format": frame.format,
            "size": frame.size,
            "latencyMs": (requested_at - frame.timestamp).num_milliseconds().max(0),
        }))
    }
}

/// Build the orchestrator described by `config`.
pub fn from_config(config: &OrchestratorConfig) -> Result<Box<dyn Orchestrator>, OrchestratorError> {
    match &config.url {
        Some(url) => Ok(Box::new(HttpOrchestrator::new(
            url,
            Duration::from_millis(config.timeout_ms),
        )?)),
        None => Ok(Box::new(PassthroughOrchestrator)),
    }
}
