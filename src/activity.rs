//! Request activity recording and risk scoring
//!
//! Every inbound request, not just commands, is observed here. A
//! deterministic additive rule engine turns request metadata into a
//! 0-100 risk score; records are written by a background worker off
//! the request's critical path, and suspicious ones additionally raise
//! an alert on the system topic.
//!
//! This pipeline is best-effort telemetry: a full queue or a failing
//! store is logged and swallowed, never surfaced to the request.

use crate::config::RiskConfig;
use crate::error::Result;
use crate::protocol::ServerMessage;
use crate::registry::ConnectionRegistry;
use chrono::{TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Topic suspicious-activity alerts are published on
pub const ALERT_TOPIC: &str = "system";

/// One observed request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    /// Record identifier (act-<uuid>)
    pub id: String,
    /// Principal that made the request
    pub principal_id: String,
    /// Action identifier (e.g., "subscribe", "ban_user")
    pub action: String,
    /// Affected resource reference, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Free-form request metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Additive risk score, capped at 100
    pub risk_score: u8,
    /// `risk_score > suspicion_threshold`
    pub suspicious: bool,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

/// Activity store collaborator: append-only, best-effort
#[async_trait::async_trait]
pub trait ActivityStore: Send + Sync {
    async fn append(&self, record: ActivityRecord) -> Result<()>;
}

/// In-memory activity store
#[derive(Default)]
pub struct MemoryActivityStore {
    records: RwLock<Vec<ActivityRecord>>,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent records, newest first
    pub async fn recent(&self, limit: usize) -> Vec<ActivityRecord> {
        self.records
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Records for one principal, oldest first
    pub async fn by_principal(&self, principal_id: &str) -> Vec<ActivityRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.principal_id == principal_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn append(&self, record: ActivityRecord) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }
}

/// Deterministic additive risk scorer.
///
/// Pure given its inputs: identical (action, timestamp, window count)
/// always yields the identical score. All weights and thresholds come
/// from `RiskConfig`.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    config: RiskConfig,
}

impl RiskScorer {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Score a request: base 0, plus configured weights for sensitive
    /// actions, burst rates, and off-hours timing, capped at 100.
    pub fn score(&self, action: &str, timestamp_ms: i64, window_count: usize) -> u8 {
        let mut score: u32 = 0;

        if self.config.sensitive_actions.iter().any(|a| a == action) {
            score += self.config.sensitive_weight as u32;
        }
        if window_count > self.config.burst_threshold {
            score += self.config.burst_weight as u32;
        }
        if self.is_off_hours(timestamp_ms) {
            score += self.config.off_hours_weight as u32;
        }

        score.min(100) as u8
    }

    /// Whether a score crosses the configured suspicion threshold
    pub fn is_suspicious(&self, score: u8) -> bool {
        score > self.config.suspicion_threshold
    }

    fn is_off_hours(&self, timestamp_ms: i64) -> bool {
        let hour = match Utc.timestamp_millis_opt(timestamp_ms).single() {
            Some(dt) => dt.hour(),
            None => return false,
        };
        let (start, end) = (self.config.off_hours_start, self.config.off_hours_end);
        if start <= end {
            hour >= start && hour < end
        } else {
            // Window wraps midnight (e.g., 22-6)
            hour >= start || hour < end
        }
    }
}

/// Per-principal sliding window of request timestamps
struct RequestWindow {
    window_ms: i64,
    timestamps: HashMap<String, Vec<i64>>,
}

impl RequestWindow {
    fn new(window_secs: u64) -> Self {
        Self {
            window_ms: (window_secs * 1000) as i64,
            timestamps: HashMap::new(),
        }
    }

    /// Record one request and return the count within the window,
    /// including this one. Expired entries are pruned on the way.
    fn observe(&mut self, principal_id: &str, timestamp_ms: i64) -> usize {
        let cutoff = timestamp_ms - self.window_ms;
        let entry = self
            .timestamps
            .entry(principal_id.to_string())
            .or_default();
        entry.retain(|&t| t > cutoff);
        entry.push(timestamp_ms);
        entry.len()
    }
}

/// One queued observation awaiting scoring
#[derive(Debug)]
struct ActivitySample {
    principal_id: String,
    action: String,
    resource: Option<String>,
    metadata: serde_json::Value,
    timestamp: i64,
}

/// Background activity recorder.
///
/// `record` pushes onto a bounded queue and returns immediately; a
/// worker task scores each sample, appends the record, and publishes
/// an alert for suspicious ones. Nothing here can fail or delay the
/// request that triggered the observation.
pub struct ActivityRecorder {
    tx: Option<mpsc::Sender<ActivitySample>>,
    handle: Option<JoinHandle<()>>,
}

impl ActivityRecorder {
    /// Create the recorder and spawn its worker task
    pub fn spawn(
        config: RiskConfig,
        store: Arc<dyn ActivityStore>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<ActivitySample>(config.queue_capacity);
        let scorer = RiskScorer::new(config.clone());
        let mut window = RequestWindow::new(config.window_secs);

        let handle = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                let count = window.observe(&sample.principal_id, sample.timestamp);
                let score = scorer.score(&sample.action, sample.timestamp, count);
                let suspicious = scorer.is_suspicious(score);

                let record = ActivityRecord {
                    id: format!("act-{}", uuid::Uuid::new_v4()),
                    principal_id: sample.principal_id,
                    action: sample.action,
                    resource: sample.resource,
                    metadata: sample.metadata,
                    risk_score: score,
                    suspicious,
                    timestamp: sample.timestamp,
                };

                if let Err(e) = store.append(record.clone()).await {
                    tracing::warn!(error = %e, "Activity store append failed, dropping record");
                }

                if suspicious {
                    tracing::warn!(
                        principal_id = %record.principal_id,
                        action = %record.action,
                        risk_score = record.risk_score,
                        "Suspicious activity flagged"
                    );
                    let alert = ServerMessage::SystemAlert {
                        alert: serde_json::json!({
                            "kind": "suspicious_activity",
                            "principalId": record.principal_id,
                            "action": record.action,
                            "riskScore": record.risk_score,
                            "timestamp": record.timestamp,
                        }),
                    };
                    registry.publish(ALERT_TOPIC, alert).await;
                }
            }
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue one observation. Never blocks; a full queue drops the
    /// sample with a warning.
    pub fn record(
        &self,
        principal_id: &str,
        action: &str,
        resource: Option<String>,
        metadata: serde_json::Value,
    ) {
        let sample = ActivitySample {
            principal_id: principal_id.to_string(),
            action: action.to_string(),
            resource,
            metadata,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(sample) {
            tracing::warn!(error = %e, "Activity queue full, dropping sample");
        }
    }

    /// Close the queue and wait for the worker to drain it
    pub async fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ActivityRecorder {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
