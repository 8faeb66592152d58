//! Control-plane session state
//!
//! A `Session` is one authenticated live connection: identity, the
//! outbound transport handle, the subscribed topic set, and liveness
//! timestamps. Sessions are owned exclusively by the
//! `ConnectionRegistry` and all mutation happens under its lock.

use crate::auth::Role;
use crate::protocol::ServerMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;

/// One authenticated real-time connection
#[derive(Debug)]
pub struct Session {
    /// Session identifier (sess-<uuid>)
    pub id: String,

    /// Principal that authenticated this connection
    pub principal_id: String,

    /// Verified role
    pub role: Role,

    /// Outbound transport handle. Bounded; a full buffer marks the
    /// session unresponsive. Dropping it closes the transport.
    pub sender: mpsc::Sender<ServerMessage>,

    /// Topics this session is subscribed to
    pub subscriptions: HashSet<String>,

    /// Connection timestamp (milliseconds since epoch)
    pub connected_at: i64,

    /// Last heartbeat timestamp (milliseconds since epoch)
    pub last_heartbeat: i64,
}

impl Session {
    /// Create a new session with a fresh id and current timestamps
    pub fn new(principal_id: String, role: Role, sender: mpsc::Sender<ServerMessage>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("sess-{}", uuid::Uuid::new_v4()),
            principal_id,
            role,
            sender,
            subscriptions: HashSet::new(),
            connected_at: now,
            last_heartbeat: now,
        }
    }

    /// Heartbeat age in milliseconds relative to `now`
    pub fn heartbeat_age_ms(&self, now: i64) -> i64 {
        now - self.last_heartbeat
    }

    /// Point-in-time view of this session for queries and logging
    pub fn snapshot(&self) -> SessionInfo {
        let mut subscriptions: Vec<String> = self.subscriptions.iter().cloned().collect();
        subscriptions.sort();
        SessionInfo {
            id: self.id.clone(),
            principal_id: self.principal_id.clone(),
            subscriptions,
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Serializable point-in-time view of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub principal_id: String,
    pub subscriptions: Vec<String>,
    pub connected_at: i64,
    pub last_heartbeat: i64,
}
