use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use frame_gateway::websocket::WebSocketServer;
use frame_gateway::{api, AppState, Settings};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new().context("failed to load configuration")?;
    info!("Configuration loaded successfully ({})", config.environment);

    // Initialize application state
    let state = AppState::new(config.clone()).context("failed to initialise application state")?;

    // Evict idle sessions independently of message traffic
    let reaper = state.reaper().spawn();

    // Accept websocket connections
    let ws_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&ws_addr)
        .await
        .with_context(|| format!("failed to bind websocket listener on {}", ws_addr))?;
    let ws_server = Arc::new(WebSocketServer::new(state.clone()));
    let ws_task = tokio::spawn(ws_server.clone().run(listener));
    info!("WebSocket server ready to accept connections at ws://{}", ws_addr);

    // Start HTTP server
    let http_state = web::Data::new(state.clone());
    let cors_config = config.cors.clone();
    let http_addr = (config.server.host.clone(), config.server.http_port);
    info!("HTTP endpoints listening on http://{}:{}", http_addr.0, http_addr.1);

    let result = HttpServer::new(move || {
        let cors = if cors_config.enabled && cors_config.allow_any_origin {
            Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(cors_config.max_age as usize)
        } else {
            // CORS disabled - use most restrictive settings
            Cors::default()
        };

        App::new()
            .wrap(cors)
            .app_data(http_state.clone())
            .configure(api::configure)
    })
    .bind(http_addr)
    .context("failed to bind HTTP listener")?
    .workers(config.server.workers as usize)
    .run()
    .await;

    if let Err(e) = &result {
        error!("HTTP server error: {}", e);
    }

    // Drain sessions once the server stops (SIGINT/SIGTERM)
    info!("Shutting down");
    reaper.abort();
    ws_task.abort();
    state.shutdown().await?;
    if !ws_server.wait_for_connections().await {
        warn!(
            "{} connections still open after drain",
            ws_server.active_connections()
        );
    }

    result.context("HTTP server failed")
}
