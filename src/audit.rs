//! Append-only audit trail for privileged actions
//!
//! Every completed or failed command produces exactly one
//! `AuditRecord`. The ledger's public contract is `append` plus read
//! accessors: no update or delete exists, and re-appending an id that
//! is already present is rejected, so records are write-once by
//! construction. Audit completeness is the compliance guarantee the
//! rest of the control plane is built around: a command whose record
//! cannot be persisted is never reported as successful.

use crate::error::{ControlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// The privileged action a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    BanUser,
    UnbanUser,
    ForceLogout,
    OverrideOrder,
    RefundOrder,
    ToggleMaintenance,
    EmergencyShutdown,
    PlatformStats,
    /// Command name outside the registered set (rejected attempts)
    Unknown,
}

impl AuditAction {
    /// Map a wire command name to its audit action
    pub fn from_command(name: &str) -> AuditAction {
        match name {
            "ban_user" => AuditAction::BanUser,
            "unban_user" => AuditAction::UnbanUser,
            "force_logout" => AuditAction::ForceLogout,
            "override_order" => AuditAction::OverrideOrder,
            "refund_order" => AuditAction::RefundOrder,
            "toggle_maintenance" => AuditAction::ToggleMaintenance,
            "emergency_shutdown" => AuditAction::EmergencyShutdown,
            "platform_stats" => AuditAction::PlatformStats,
            _ => AuditAction::Unknown,
        }
    }
}

/// One immutable privileged-action record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Record identifier (aud-<uuid>)
    pub id: String,
    /// What was done
    pub action: AuditAction,
    /// Kind of the affected resource (e.g., "user", "order", "system")
    pub target_type: String,
    /// Identifier of the affected resource
    pub target_id: String,
    /// Principal that requested the action
    pub principal_id: String,
    /// State snapshot before execution
    pub before_state: serde_json::Value,
    /// State snapshot after execution (equals `before_state` on failure)
    pub after_state: serde_json::Value,
    /// Whether a verified step-up confirmation gated this action
    pub confirmed_by_step_up: bool,
    /// Flagged for manual compliance review
    pub requires_review: bool,
    /// Whether execution succeeded
    pub success: bool,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl AuditRecord {
    /// Create a record with a fresh id and current timestamp
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        action: AuditAction,
        target_type: impl Into<String>,
        target_id: impl Into<String>,
        principal_id: impl Into<String>,
        before_state: serde_json::Value,
        after_state: serde_json::Value,
        confirmed_by_step_up: bool,
        success: bool,
    ) -> Self {
        Self {
            id: format!("aud-{}", uuid::Uuid::new_v4()),
            action,
            target_type: target_type.into(),
            target_id: target_id.into(),
            principal_id: principal_id.into(),
            before_state,
            after_state,
            confirmed_by_step_up,
            requires_review: false,
            success,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Flag the record for manual review
    pub fn with_review(mut self) -> Self {
        self.requires_review = true;
        self
    }
}

/// Append-only ledger collaborator.
///
/// There is deliberately no update or delete; implementations must
/// reject any write to an id that already exists.
#[async_trait::async_trait]
pub trait AuditLedger: Send + Sync {
    /// Append a record, returning its id
    async fn append(&self, record: AuditRecord) -> Result<String>;

    /// Most recent records, newest first
    async fn recent(&self, limit: usize) -> Vec<AuditRecord>;
}

/// In-memory write-once ledger
#[derive(Default)]
pub struct MemoryAuditLedger {
    records: RwLock<Vec<AuditRecord>>,
    ids: RwLock<HashSet<String>>,
}

impl MemoryAuditLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Records matching an action, newest first
    pub async fn by_action(&self, action: AuditAction) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.action == action)
            .cloned()
            .collect()
    }

    /// Total number of records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the ledger is empty
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl AuditLedger for MemoryAuditLedger {
    async fn append(&self, record: AuditRecord) -> Result<String> {
        {
            let mut ids = self.ids.write().await;
            if !ids.insert(record.id.clone()) {
                return Err(ControlError::AuditPersistence(format!(
                    "record {} already exists (records are write-once)",
                    record.id
                )));
            }
        }
        let id = record.id.clone();
        tracing::info!(
            record_id = %id,
            action = ?record.action,
            target = %record.target_id,
            success = record.success,
            "Audit record appended"
        );
        self.records.write().await.push(record);
        Ok(id)
    }

    async fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

/// JSONL file-backed ledger
///
/// Appends one JSON line per record and never rewrites existing lines.
pub struct FileAuditLedger {
    path: PathBuf,
    ids: RwLock<HashSet<String>>,
}

impl FileAuditLedger {
    /// Create a ledger writing to the given JSONL file, creating the
    /// parent directory if needed.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Seed the id set from any existing file so write-once holds
        // across restarts.
        let ids = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content
                .lines()
                .filter_map(|line| serde_json::from_str::<AuditRecord>(line).ok())
                .map(|r| r.id)
                .collect(),
            Err(_) => HashSet::new(),
        };
        Ok(Self {
            path,
            ids: RwLock::new(ids),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every persisted record in append order
    pub async fn load_all(&self) -> Vec<AuditRecord> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl AuditLedger for FileAuditLedger {
    async fn append(&self, record: AuditRecord) -> Result<String> {
        {
            let mut ids = self.ids.write().await;
            if !ids.insert(record.id.clone()) {
                return Err(ControlError::AuditPersistence(format!(
                    "record {} already exists (records are write-once)",
                    record.id
                )));
            }
        }
        let mut line = serde_json::to_string(&record)
            .map_err(|e| ControlError::AuditPersistence(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                ControlError::AuditPersistence(format!(
                    "failed to open {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        file.write_all(line.as_bytes()).await.map_err(|e| {
            ControlError::AuditPersistence(format!("failed to write record: {}", e))
        })?;
        Ok(record.id)
    }

    async fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let mut all = self.load_all().await;
        all.reverse();
        all.truncate(limit);
        all
    }
}
