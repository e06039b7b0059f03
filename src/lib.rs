pub mod api;
pub mod config;
pub mod error;
pub mod frame;
pub mod monitor;
pub mod orchestrator;
pub mod session;
pub mod websocket;

use std::sync::Arc;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;
pub use api::handlers::health_check;

use frame::{FrameCache, FrameDecoder};
use monitor::HealthMonitor;
use orchestrator::Orchestrator;
use session::{CloseReason, SessionReaper, SessionRegistry};
use websocket::Broadcaster;

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub registry: Arc<SessionRegistry>,
    pub cache: Arc<FrameCache>,
    pub decoder: Arc<FrameDecoder>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub broadcaster: Broadcaster,
    pub monitor: HealthMonitor,
}

impl AppState {
    /// Build the state with the orchestrator described in `config`.
    pub fn new(config: Settings) -> Result<Self> {
        let orchestrator = orchestrator::from_config(&config.orchestrator)?;
        Ok(Self::with_orchestrator(config, Arc::from(orchestrator)))
    }

    pub fn with_orchestrator(config: Settings, orchestrator: Arc<dyn Orchestrator>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session.max_sessions));
        let cache = Arc::new(FrameCache::new(&config.cache));
        let decoder = Arc::new(FrameDecoder::new(&config.frames));

        Self {
            broadcaster: Broadcaster::new(registry.clone()),
            monitor: HealthMonitor::new(registry.clone(), cache.clone(), decoder.clone()),
            config: Arc::new(config),
            registry,
            cache,
            decoder,
            orchestrator,
        }
    }

    pub fn reaper(&self) -> SessionReaper {
        SessionReaper::new(self.registry.clone(), &self.config.session)
    }

    /// Close every session with the shutdown code.
    pub async fn shutdown(&self) -> Result<()> {
        let drained = self.registry.drain(CloseReason::Shutdown).await;
        tracing::info!("Shutdown closed {} sessions", drained);
        self.cache.clear().await;
        Ok(())
    }
}
