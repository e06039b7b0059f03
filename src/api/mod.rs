//! HTTP side-channel for the gateway
//!
//! Health, statistics and notification endpoints served next to the
//! websocket listener.

pub mod handlers;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health_check))
        .route("/stats", web::get().to(handlers::stats))
        .route("/notify", web::post().to(handlers::notify));
}
