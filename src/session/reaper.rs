use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::SessionRegistry;
use crate::config::SessionConfig;

/// Periodic sweep evicting sessions idle for longer than the session timeout.
pub struct SessionReaper {
    registry: Arc<SessionRegistry>,
    timeout: chrono::Duration,
    interval: Duration,
}

impl SessionReaper {
    pub fn new(registry: Arc<SessionRegistry>, config: &SessionConfig) -> Self {
        Self {
            registry,
            timeout: chrono::Duration::milliseconds(config.timeout_ms as i64),
            interval: config.cleanup_interval(),
        }
    }

    /// Evict every session idle at `now`; returns how many were reaped.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut reaped = 0;
        for session in self.registry.snapshot().await {
            if now - session.last_activity <= self.timeout {
                continue;
            }
            if self.registry.evict_idle(&session.id, now, self.timeout).await {
                reaped += 1;
            }
        }

        if reaped > 0 {
            info!("Reaped {} idle sessions", reaped);
        } else {
            debug!("Reaper sweep found no idle sessions");
        }
        reaped
    }

    /// Run the sweep on its own timer until the returned task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.sweep(Utc::now()).await;
            }
        })
    }
}
