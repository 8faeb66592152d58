//! Connection registry and topic broadcaster
//!
//! Tracks live control-plane sessions keyed by principal identity and
//! owns every topic's subscriber set. One `RwLock` around the session
//! and topic maps is the single serialization point for all mutation
//! (connect, disconnect, subscribe, unsubscribe, evict, heartbeat);
//! slow work (credential checks, command execution, per-subscriber
//! delivery) happens outside it.
//!
//! Fan-out is isolated per subscriber: delivery uses the session's
//! bounded channel with `try_send`, and a session whose buffer is full
//! is evicted like a heartbeat timeout instead of stalling the rest.

use crate::auth::Principal;
use crate::config::RegistryConfig;
use crate::error::{ControlError, Result};
use crate::protocol::ServerMessage;
use crate::session::{Session, SessionInfo};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};

/// Why a session was removed from the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// A newer connection for the same principal superseded it
    Superseded,
    /// Heartbeat age exceeded the liveness timeout
    HeartbeatTimeout,
    /// Outbound buffer stayed full: the subscriber could not accept
    /// messages within its budget
    Unresponsive,
    /// Control plane is shutting down
    Shutdown,
}

struct RegistryInner {
    /// session id → session
    sessions: HashMap<String, Session>,
    /// principal id → session id (single-session-per-principal)
    principals: HashMap<String, String>,
    /// topic name → subscriber session ids
    topics: HashMap<String, HashSet<String>>,
}

impl RegistryInner {
    /// Remove a session from all three maps, keeping them consistent.
    /// Empty topics are garbage-collected here so the topic map never
    /// grows unboundedly.
    fn remove(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        self.principals.remove(&session.principal_id);
        for topic in &session.subscriptions {
            if let Some(subscribers) = self.topics.get_mut(topic) {
                subscribers.remove(session_id);
                if subscribers.is_empty() {
                    self.topics.remove(topic);
                }
            }
        }
        Some(session)
    }
}

/// Registry of live sessions plus topic fan-out
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                principals: HashMap::new(),
                topics: HashMap::new(),
            }),
            config,
        }
    }

    /// Register a session for an authenticated principal.
    ///
    /// If the principal already has a live session it is superseded:
    /// the old transport receives `force_logout` and is closed before
    /// the new session is visible. Returns the new session id and the
    /// receiving half of its outbound channel.
    pub async fn register(
        &self,
        principal: &Principal,
    ) -> (String, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer);
        let session = Session::new(principal.id.clone(), principal.role, tx);
        let session_id = session.id.clone();

        let superseded = {
            let mut inner = self.inner.write().await;
            let old = inner
                .principals
                .get(&principal.id)
                .cloned()
                .and_then(|old_id| inner.remove(&old_id));
            inner
                .principals
                .insert(principal.id.clone(), session_id.clone());
            inner.sessions.insert(session_id.clone(), session);
            old
        };

        if let Some(old) = superseded {
            // Best-effort notice; dropping the sender closes the transport
            let _ = old.sender.try_send(ServerMessage::ForceLogout {
                user_id: old.principal_id.clone(),
            });
            tracing::info!(
                principal_id = %principal.id,
                old_session = %old.id,
                new_session = %session_id,
                "Superseded previous session"
            );
        }

        tracing::info!(
            session_id = %session_id,
            principal_id = %principal.id,
            "Session registered"
        );
        (session_id, rx)
    }

    /// Remove a session after its transport closed
    pub async fn disconnect(&self, session_id: &str) {
        let removed = self.inner.write().await.remove(session_id);
        if removed.is_some() {
            tracing::info!(session_id = %session_id, "Session disconnected");
        }
    }

    /// Evict a session through the serialized mutation path.
    ///
    /// Used by the liveness monitor, the unresponsive-subscriber path,
    /// and shutdown. The session disappears from the registry and from
    /// every topic's subscriber set atomically with respect to
    /// concurrent publishes.
    pub async fn evict(&self, session_id: &str, reason: EvictionReason) {
        let removed = self.inner.write().await.remove(session_id);
        if let Some(session) = removed {
            if reason != EvictionReason::Shutdown {
                let _ = session.sender.try_send(ServerMessage::ForceLogout {
                    user_id: session.principal_id.clone(),
                });
            }
            tracing::warn!(
                session_id = %session_id,
                principal_id = %session.principal_id,
                reason = ?reason,
                "Session evicted"
            );
        }
    }

    /// Subscribe a session to topics, returning its full topic set.
    /// Topics are created lazily on first subscribe.
    pub async fn subscribe(&self, session_id: &str, topics: &[String]) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(session_id) {
            return Err(ControlError::SessionNotFound(session_id.to_string()));
        }
        for topic in topics {
            inner
                .topics
                .entry(topic.clone())
                .or_default()
                .insert(session_id.to_string());
        }
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ControlError::SessionNotFound(session_id.to_string()))?;
        for topic in topics {
            session.subscriptions.insert(topic.clone());
        }
        let mut channels: Vec<String> = session.subscriptions.iter().cloned().collect();
        channels.sort();
        Ok(channels)
    }

    /// Unsubscribe a session from topics, returning its remaining set.
    /// Once this returns, the session receives no further events on
    /// the removed topics.
    pub async fn unsubscribe(&self, session_id: &str, topics: &[String]) -> Result<Vec<String>> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(session_id) {
            return Err(ControlError::SessionNotFound(session_id.to_string()));
        }
        for topic in topics {
            if let Some(subscribers) = inner.topics.get_mut(topic) {
                subscribers.remove(session_id);
                if subscribers.is_empty() {
                    inner.topics.remove(topic);
                }
            }
        }
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ControlError::SessionNotFound(session_id.to_string()))?;
        for topic in topics {
            session.subscriptions.remove(topic);
        }
        let mut channels: Vec<String> = session.subscriptions.iter().cloned().collect();
        channels.sort();
        Ok(channels)
    }

    /// Record a heartbeat for a session
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ControlError::SessionNotFound(session_id.to_string()))?;
        session.last_heartbeat = chrono::Utc::now().timestamp_millis();
        Ok(())
    }

    /// Publish a message to every subscriber of a topic.
    ///
    /// Delivers to exactly the subscriber set recorded at the moment
    /// of publish. Returns the number of sessions the message was
    /// handed to.
    pub async fn publish(&self, topic: &str, message: ServerMessage) -> usize {
        self.publish_excluding(topic, message, None).await
    }

    /// Publish to a topic, skipping one session (used so a command's
    /// initiator is not notified twice).
    pub async fn publish_excluding(
        &self,
        topic: &str,
        message: ServerMessage,
        exclude: Option<&str>,
    ) -> usize {
        // Snapshot the subscriber senders under the read lock, then
        // deliver outside it so no subscriber can block the maps.
        let targets: Vec<(String, mpsc::Sender<ServerMessage>)> = {
            let inner = self.inner.read().await;
            match inner.topics.get(topic) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|id| exclude != Some(id.as_str()))
                    .filter_map(|id| {
                        inner
                            .sessions
                            .get(id)
                            .map(|s| (id.clone(), s.sender.clone()))
                    })
                    .collect(),
                None => return 0,
            }
        };

        self.deliver(targets, message).await
    }

    /// Send a message to a single session
    pub async fn send_to(&self, session_id: &str, message: ServerMessage) -> Result<()> {
        let sender = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .get(session_id)
                .map(|s| s.sender.clone())
                .ok_or_else(|| ControlError::SessionNotFound(session_id.to_string()))?
        };
        if sender.try_send(message).is_err() {
            self.evict(session_id, EvictionReason::Unresponsive).await;
            return Err(ControlError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Broadcast a message to every live session
    pub async fn broadcast_all(&self, message: ServerMessage) -> usize {
        let targets: Vec<(String, mpsc::Sender<ServerMessage>)> = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .iter()
                .map(|(id, s)| (id.clone(), s.sender.clone()))
                .collect()
        };
        self.deliver(targets, message).await
    }

    /// Per-subscriber isolated delivery: `try_send` each, evict the
    /// ones that cannot accept.
    async fn deliver(
        &self,
        targets: Vec<(String, mpsc::Sender<ServerMessage>)>,
        message: ServerMessage,
    ) -> usize {
        let mut delivered = 0;
        let mut failed: Vec<String> = Vec::new();
        for (session_id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => failed.push(session_id),
            }
        }
        for session_id in failed {
            self.evict(&session_id, EvictionReason::Unresponsive).await;
        }
        delivered
    }

    /// Session ids whose heartbeat age exceeds `timeout_ms`
    pub async fn stale_sessions(&self, timeout_ms: i64) -> Vec<String> {
        let now = chrono::Utc::now().timestamp_millis();
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .filter(|s| s.heartbeat_age_ms(now) > timeout_ms)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Snapshot every live session
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read().await;
        inner.sessions.values().map(|s| s.snapshot()).collect()
    }

    /// Snapshot one session
    pub async fn session(&self, session_id: &str) -> Option<SessionInfo> {
        let inner = self.inner.read().await;
        inner.sessions.get(session_id).map(|s| s.snapshot())
    }

    /// The live session id for a principal, if any
    pub async fn principal_session(&self, principal_id: &str) -> Option<String> {
        self.inner.read().await.principals.get(principal_id).cloned()
    }

    /// Subscriber session ids for a topic (empty if the topic is
    /// unknown or has been garbage-collected)
    pub async fn topic_subscribers(&self, topic: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .topics
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Evict every session (shutdown path)
    pub async fn close_all(&self) {
        let ids: Vec<String> = {
            let inner = self.inner.read().await;
            inner.sessions.keys().cloned().collect()
        };
        for id in ids {
            self.evict(&id, EvictionReason::Shutdown).await;
        }
    }
}
