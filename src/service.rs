//! Control-plane service facade
//!
//! `ControlPlane` wires the registry, the credential validator, the
//! command dispatcher, the activity recorder, and the liveness monitor
//! into one owned object. Nothing in this crate lives in a global;
//! callers construct a `ControlPlane`, hand each accepted connection
//! to `connect`, and route every decoded client message through
//! `handle_message`.

use crate::activity::{ActivityRecorder, ActivityStore};
use crate::audit::AuditLedger;
use crate::auth::TokenValidator;
use crate::command::{CommandDispatcher, CommandHandler, CommandOutcome, CommandRequest, StepUpVerifier};
use crate::config::ControlConfig;
use crate::error::{ControlError, Result};
use crate::liveness::LivenessMonitor;
use crate::protocol::{capabilities, ClientMessage, ServerMessage};
use crate::registry::ConnectionRegistry;
use futures::Stream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Adapt a session's outbound receiver into a message stream.
///
/// Convenient for transports that consume `Stream`s (websocket
/// writers, SSE encoders) instead of polling the channel directly.
pub fn message_stream(rx: mpsc::Receiver<ServerMessage>) -> impl Stream<Item = ServerMessage> {
    ReceiverStream::new(rx)
}

/// The owner control plane
pub struct ControlPlane {
    registry: Arc<ConnectionRegistry>,
    validator: TokenValidator,
    dispatcher: Arc<CommandDispatcher>,
    recorder: ActivityRecorder,
    liveness: LivenessMonitor,
}

impl ControlPlane {
    /// Assemble a control plane from configuration and collaborators.
    ///
    /// Fails if the command table is inconsistent with the configured
    /// step-up gate, so a broken deployment never accepts connections.
    pub fn new(
        config: ControlConfig,
        validator: TokenValidator,
        handlers: Vec<Arc<dyn CommandHandler>>,
        verifier: Arc<dyn StepUpVerifier>,
        ledger: Arc<dyn AuditLedger>,
        activity_store: Arc<dyn ActivityStore>,
    ) -> Result<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.registry.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            config.commands.clone(),
            handlers,
            verifier,
            ledger,
            Arc::clone(&registry),
        )?);
        let recorder = ActivityRecorder::spawn(
            config.risk.clone(),
            activity_store,
            Arc::clone(&registry),
        );
        let liveness = LivenessMonitor::new(Arc::clone(&registry), config.liveness.clone());
        tracing::info!("Control plane assembled");
        Ok(Self {
            registry,
            validator,
            dispatcher,
            recorder,
            liveness,
        })
    }

    /// Start background work (the liveness sweep). Idempotent.
    pub fn start(&mut self) {
        self.liveness.start();
    }

    /// Authenticate a credential and open a session.
    ///
    /// On success the session receives a `connected` handshake as its
    /// first message and the caller gets the outbound message stream.
    /// Any earlier session for the same principal is superseded.
    pub async fn connect(
        &self,
        credential: &str,
    ) -> Result<(String, mpsc::Receiver<ServerMessage>)> {
        let principal = match self.validator.verify(credential).await {
            Ok(principal) => principal,
            Err(e) => {
                tracing::warn!(error = %e, "Connection rejected");
                return Err(e);
            }
        };

        let (session_id, rx) = self.registry.register(&principal).await;
        self.registry
            .send_to(
                &session_id,
                ServerMessage::Connected {
                    session_id: session_id.clone(),
                    capabilities: capabilities(),
                },
            )
            .await?;
        self.recorder.record(
            &principal.id,
            "connect",
            None,
            serde_json::json!({"sessionId": session_id}),
        );
        Ok((session_id, rx))
    }

    /// Route one raw inbound frame.
    ///
    /// A malformed frame surfaces a protocol error without closing the
    /// session; the attempt is still recorded for risk scoring, and
    /// the transport decides whether to answer or drop the frame.
    pub async fn handle_raw(&self, session_id: &str, text: &str) -> Result<()> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_message(session_id, message).await,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Malformed frame");
                if let Some(info) = self.registry.session(session_id).await {
                    self.recorder.record(
                        &info.principal_id,
                        "protocol_error",
                        None,
                        serde_json::json!({"sessionId": session_id}),
                    );
                }
                Err(ControlError::Protocol(format!("unparseable frame: {}", e)))
            }
        }
    }

    /// Route one decoded client message
    pub async fn handle_message(&self, session_id: &str, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Subscribe { channels } => {
                let all = self.registry.subscribe(session_id, &channels).await?;
                self.registry
                    .send_to(
                        session_id,
                        ServerMessage::SubscriptionConfirmed { channels: all },
                    )
                    .await?;
                self.record_for_session(session_id, "subscribe", serde_json::json!({
                    "channels": channels,
                }))
                .await;
                Ok(())
            }
            ClientMessage::Unsubscribe { channels } => {
                let remaining = self.registry.unsubscribe(session_id, &channels).await?;
                self.registry
                    .send_to(
                        session_id,
                        ServerMessage::SubscriptionConfirmed {
                            channels: remaining,
                        },
                    )
                    .await?;
                self.record_for_session(session_id, "unsubscribe", serde_json::json!({
                    "channels": channels,
                }))
                .await;
                Ok(())
            }
            ClientMessage::Command {
                command,
                payload,
                request_id,
                confirmation_code,
            } => {
                self.submit_command(session_id, command, payload, request_id, confirmation_code)
                    .await?;
                Ok(())
            }
            ClientMessage::Heartbeat => self.registry.touch(session_id).await,
            ClientMessage::Ping => self.registry.send_to(session_id, ServerMessage::Pong).await,
        }
    }

    /// Submit a command on behalf of a session and return its outcome.
    ///
    /// The `command_result` is also delivered on the session's stream.
    pub async fn submit_command(
        &self,
        session_id: &str,
        command: String,
        payload: serde_json::Value,
        request_id: String,
        confirmation_code: Option<String>,
    ) -> Result<CommandOutcome> {
        let info = self
            .registry
            .session(session_id)
            .await
            .ok_or_else(|| ControlError::SessionNotFound(session_id.to_string()))?;

        self.recorder.record(
            &info.principal_id,
            &command,
            None,
            serde_json::json!({"requestId": request_id}),
        );

        Ok(self
            .dispatcher
            .dispatch(CommandRequest {
                session_id: Some(session_id.to_string()),
                principal_id: info.principal_id,
                command,
                payload,
                request_id,
                confirmation_code,
            })
            .await)
    }

    /// Publish a platform event to a topic's subscribers.
    ///
    /// This is the entry point for external collaborators (order flow,
    /// inventory, payments) pushing live updates to connected owners.
    pub async fn publish(
        &self,
        topic: &str,
        event: impl Into<String>,
        data: serde_json::Value,
    ) -> usize {
        self.registry
            .publish(
                topic,
                ServerMessage::Event {
                    event: event.into(),
                    data,
                },
            )
            .await
    }

    /// Broadcast an operational alert to every connected session
    pub async fn broadcast_alert(&self, alert: serde_json::Value) -> usize {
        self.registry
            .broadcast_all(ServerMessage::SystemAlert { alert })
            .await
    }

    /// Close a single session
    pub async fn disconnect(&self, session_id: &str) {
        self.registry.disconnect(session_id).await;
    }

    /// The connection registry
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The command dispatcher
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Stop background work, drain the activity queue, and close every
    /// session.
    pub async fn shutdown(&mut self) {
        self.liveness.shutdown();
        self.recorder.shutdown().await;
        self.registry.close_all().await;
        tracing::info!("Control plane stopped");
    }

    async fn record_for_session(
        &self,
        session_id: &str,
        action: &str,
        metadata: serde_json::Value,
    ) {
        if let Some(info) = self.registry.session(session_id).await {
            self.recorder.record(&info.principal_id, action, None, metadata);
        }
    }
}
