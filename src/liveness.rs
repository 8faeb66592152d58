//! Liveness monitor
//!
//! A fixed-interval sweep over the registry that evicts sessions with
//! stale heartbeats. The sweep runs on its own timer task, so one
//! stuck connection can never delay detection of others, and eviction
//! goes through the registry's serialized mutation path (the same one
//! connect and disconnect use), so it cannot race a reconnect.

use crate::config::LivenessConfig;
use crate::registry::{ConnectionRegistry, EvictionReason};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Periodic stale-session sweeper
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    config: LivenessConfig,
    handle: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    /// Create a monitor over the given registry
    pub fn new(registry: Arc<ConnectionRegistry>, config: LivenessConfig) -> Self {
        Self {
            registry,
            config,
            handle: None,
        }
    }

    /// Spawn the sweep task. Idempotent; a second call is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);
        let timeout_ms = (self.config.heartbeat_timeout_secs * 1000) as i64;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a session
            // created just before start() isn't swept at age zero.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                Self::sweep(&registry, timeout_ms).await;
            }
        });
        self.handle = Some(handle);
        tracing::info!(
            sweep_interval_secs = self.config.sweep_interval_secs,
            heartbeat_timeout_secs = self.config.heartbeat_timeout_secs,
            "Liveness monitor started"
        );
    }

    /// One sweep pass: evict every session whose heartbeat is older
    /// than the timeout.
    pub async fn sweep(registry: &ConnectionRegistry, timeout_ms: i64) -> usize {
        let stale = registry.stale_sessions(timeout_ms).await;
        let count = stale.len();
        for session_id in stale {
            registry
                .evict(&session_id, EvictionReason::HeartbeatTimeout)
                .await;
        }
        if count > 0 {
            tracing::info!(evicted = count, "Liveness sweep evicted stale sessions");
        }
        count
    }

    /// Stop the sweep task
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::info!("Liveness monitor stopped");
        }
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
