//! Statistics and health monitoring
//!
//! Aggregates registry, cache and decoder counters into a statistics
//! snapshot and a healthy/degraded verdict.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::frame::{CacheStats, DecoderStats, FrameCache, FrameDecoder};
use crate::session::{Session, SessionRegistry, SessionStatus};

/// Load above which the service reports itself degraded.
const LOAD_THRESHOLD: f64 = 0.9;
/// Error rate above which the service reports itself degraded.
const ERROR_RATE_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub active_connections: usize,
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub average_session_age_ms: i64,
    pub total_messages: u64,
    pub total_frames: u64,
    pub total_errors: u64,
    pub processing_ratio: f64,
    pub uptime_ms: i64,
    pub cache: CacheStats,
    pub decoder: DecoderStats,
    pub timestamp: DateTime<Utc>,
}

impl Statistics {
    /// Derive session figures from `sessions` as of `now`.
    ///
    /// Uptime is measured from the oldest session still held, so it resets
    /// whenever the registry empties.
    pub fn from_sessions(
        sessions: &[Session],
        max_sessions: usize,
        cache: CacheStats,
        decoder: DecoderStats,
        now: DateTime<Utc>,
    ) -> Self {
        let total_sessions = sessions.len();
        let active_connections = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Active)
            .count();
        let processing = sessions.iter().filter(|s| s.is_processing).count();

        let ages: Vec<i64> = sessions
            .iter()
            .map(|s| (now - s.created_at).num_milliseconds().max(0))
            .collect();
        let average_session_age_ms = if ages.is_empty() {
            0
        } else {
            ages.iter().sum::<i64>() / ages.len() as i64
        };

        Self {
            active_connections,
            total_sessions,
            max_sessions,
            average_session_age_ms,
            total_messages: sessions.iter().map(|s| s.message_count).sum(),
            total_frames: sessions.iter().map(|s| s.frame_count).sum(),
            total_errors: sessions.iter().map(|s| u64::from(s.error_count)).sum(),
            processing_ratio: if total_sessions == 0 {
                0.0
            } else {
                processing as f64 / total_sessions as f64
            },
            uptime_ms: ages.iter().copied().max().unwrap_or(0),
            cache,
            decoder,
            timestamp: now,
        }
    }

    pub fn error_rate(&self) -> f64 {
        let attempts = (self.total_frames + self.total_messages).max(1);
        self.total_errors as f64 / attempts as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "condition", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HealthIssue {
    HighLoad {
        active_connections: usize,
        max_sessions: usize,
    },
    HighErrorRate {
        error_rate: f64,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
    pub stats: Statistics,
}

impl HealthReport {
    pub fn evaluate(stats: Statistics) -> Self {
        let mut issues = Vec::new();

        let load_limit = LOAD_THRESHOLD * stats.max_sessions as f64;
        if stats.active_connections as f64 >= load_limit {
            issues.push(HealthIssue::HighLoad {
                active_connections: stats.active_connections,
                max_sessions: stats.max_sessions,
            });
        }

        let error_rate = stats.error_rate();
        if error_rate >= ERROR_RATE_THRESHOLD {
            issues.push(HealthIssue::HighErrorRate { error_rate });
        }

        let status = if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        Self { status, issues, stats }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Reads the shared components on demand; holds no state of its own.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<SessionRegistry>,
    cache: Arc<FrameCache>,
    decoder: Arc<FrameDecoder>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        cache: Arc<FrameCache>,
        decoder: Arc<FrameDecoder>,
    ) -> Self {
        Self {
            registry,
            cache,
            decoder,
        }
    }

    pub async fn statistics(&self) -> Statistics {
        let sessions = self.registry.snapshot().await;
        Statistics::from_sessions(
            &sessions,
            self.registry.max_sessions(),
            self.cache.stats().await,
            self.decoder.stats(),
            Utc::now(),
        )
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport::evaluate(self.statistics().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionHandle;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn session(messages: u64, frames: u64, errors: u32) -> Session {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new(ConnectionHandle::new(tx), HashMap::new());
        session.message_count = messages;
        session.frame_count = frames;
        session.error_count = errors;
        session
    }

    fn stats(sessions: &[Session], max_sessions: usize) -> Statistics {
        Statistics::from_sessions(
            sessions,
            max_sessions,
            CacheStats::default(),
            DecoderStats::default(),
            Utc::now(),
        )
    }

    #[test]
    fn test_aggregates() {
        let mut a = session(10, 4, 1);
        a.is_processing = true;
        a.created_at = Utc::now() - chrono::Duration::seconds(10);
        let b = session(5, 1, 0);

        let stats = stats(&[a, b], 10);
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.total_messages, 15);
        assert_eq!(stats.total_frames, 5);
        assert_eq!(stats.total_errors, 1);
        assert!((stats.processing_ratio - 0.5).abs() < f64::EPSILON);
        assert!(stats.uptime_ms >= 10_000);
        assert!(stats.average_session_age_ms >= 5_000);
        assert!(stats.average_session_age_ms < stats.uptime_ms);
    }

    #[test]
    fn test_empty_registry_is_healthy() {
        let report = HealthReport::evaluate(stats(&[], 100));
        assert!(report.is_healthy());
        assert!(report.issues.is_empty());
        assert_eq!(report.stats.uptime_ms, 0);
        assert_eq!(report.stats.processing_ratio, 0.0);
    }

    #[test]
    fn test_degraded_at_ninety_percent_load() {
        let sessions: Vec<Session> = (0..9).map(|_| session(1, 0, 0)).collect();
        let report = HealthReport::evaluate(stats(&sessions, 10));
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(
            report.issues,
            vec![HealthIssue::HighLoad {
                active_connections: 9,
                max_sessions: 10
            }]
        );

        let report = HealthReport::evaluate(stats(&sessions[..8], 10));
        assert!(report.is_healthy());
    }

    #[test]
    fn test_degraded_at_ten_percent_errors() {
        let report = HealthReport::evaluate(stats(&[session(8, 2, 1)], 100));
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(matches!(
            report.issues.as_slice(),
            [HealthIssue::HighErrorRate { error_rate }] if (*error_rate - 0.1).abs() < 1e-9
        ));

        let report = HealthReport::evaluate(stats(&[session(9, 2, 1)], 100));
        assert!(report.is_healthy());
    }

    #[test]
    fn test_both_conditions_reported() {
        let report = HealthReport::evaluate(stats(&[session(0, 0, 3)], 1));
        assert_eq!(report.issues.len(), 2);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "degraded");
        assert_eq!(value["issues"][0]["condition"], "high_load");
        assert_eq!(value["issues"][1]["condition"], "high_error_rate");
    }
}
