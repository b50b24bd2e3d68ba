use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Point-in-time view of the service health.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    pub degraded: bool,
    pub consecutive_pass_failures: u32,
    pub consecutive_fetch_failures: u32,
    pub last_pass_success: Option<DateTime<Utc>>,
    pub last_sample: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Tracks failure streaks across the service loops.
///
/// Only aggregation passes, which is where storage is reached, can flip the service to
/// degraded. Fetch failures are reported but never degrade on their own.
#[derive(Debug)]
pub struct HealthMonitor {
    degraded_after: u32,
    state: RwLock<HealthSnapshot>,
}

impl HealthMonitor {
    pub fn new(degraded_after: u32) -> Self {
        Self {
            degraded_after: degraded_after.max(1),
            state: RwLock::new(HealthSnapshot::default()),
        }
    }

    pub async fn record_pass_success(&self, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if state.degraded {
            tracing::info!("Storage recovered after {} failed passes", state.consecutive_pass_failures);
        }
        state.consecutive_pass_failures = 0;
        state.degraded = false;
        state.last_pass_success = Some(at);
    }

    pub async fn record_pass_failure(&self, error: impl Into<String>) {
        let mut state = self.state.write().await;
        state.consecutive_pass_failures = state.consecutive_pass_failures.saturating_add(1);
        state.last_error = Some(error.into());

        if !state.degraded && state.consecutive_pass_failures >= self.degraded_after {
            state.degraded = true;
            tracing::error!(
                "Health degraded: {} consecutive aggregation passes failed (last: {})",
                state.consecutive_pass_failures,
                state.last_error.as_deref().unwrap_or("unknown")
            );
        }
    }

    pub async fn record_fetch_success(&self, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.consecutive_fetch_failures = 0;
        state.last_sample = Some(at);
    }

    pub async fn record_fetch_failure(&self) -> u32 {
        let mut state = self.state.write().await;
        state.consecutive_fetch_failures = state.consecutive_fetch_failures.saturating_add(1);
        state.consecutive_fetch_failures
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        self.state.read().await.clone()
    }

    pub async fn is_degraded(&self) -> bool {
        self.state.read().await.degraded
    }
}
