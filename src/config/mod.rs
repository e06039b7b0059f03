use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::frame::FrameFormat;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Port of the websocket listener.
    pub port: u16,
    /// Port of the HTTP health/stats/notify endpoints.
    pub http_port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub timeout_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl SessionConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrameConfig {
    pub max_frame_size: usize,
    pub supported_formats: Vec<FrameFormat>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// Endpoint of the analysis orchestrator. Frames are summarised
    /// in-process when unset.
    #[serde(default)]
    pub url: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub frames: FrameConfig,
    pub cache: CacheConfig,
    pub orchestrator: OrchestratorConfig,
    pub cors: CorsConfig,
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
    environment: &str,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("environment", environment)?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("server.http_port", 8081)?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("session.max_sessions", 100)?
        .set_default("session.timeout_ms", 300_000)?
        .set_default("session.cleanup_interval_ms", 60_000)?
        .set_default("frames.max_frame_size", 10 * 1024 * 1024)?
        .set_default("frames.supported_formats", vec!["jpeg", "png", "webp"])?
        .set_default("cache.enabled", true)?
        .set_default("cache.size", 50)?
        .set_default("orchestrator.timeout_ms", 30_000)?
        .set_default("cors.enabled", true)?
        .set_default("cors.allow_any_origin", true)?
        .set_default("cors.max_age", 3600)
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = with_defaults(Config::builder(), "development")?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))

            // Add in settings from environment variables (with prefix "APP_")
            // E.g., `APP_SESSION__MAX_SESSIONS=200` would set `Settings.session.max_sessions`
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        s.try_deserialize()
    }

    /// Defaults only, without files or environment overrides.
    pub fn new_for_test() -> Result<Self, ConfigError> {
        with_defaults(Config::builder(), "test")?
            .build()?
            .try_deserialize()
    }
}
