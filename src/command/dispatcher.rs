//! Privileged command dispatch
//!
//! One dispatcher owns the handler table, the step-up gate, the
//! correlation-id dedup cache, and the audit append. A command moves
//! through an explicit state machine; rejected commands never touch a
//! handler, and a completed command is only ever reported after its
//! audit record is durably appended.

use crate::audit::{AuditAction, AuditLedger, AuditRecord};
use crate::command::handler::{CommandContext, CommandHandler, StepUpVerifier};
use crate::config::CommandConfig;
use crate::error::{ControlError, Result};
use crate::protocol::ServerMessage;
use crate::registry::ConnectionRegistry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Lifecycle of a submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Received,
    Validated,
    StepUpPending,
    StepUpConfirmed,
    Executing,
    Completed,
    Failed,
    Rejected,
}

/// A command as submitted over a session
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Session the command arrived on, when it came over a connection
    pub session_id: Option<String>,
    pub principal_id: String,
    pub command: String,
    pub payload: serde_json::Value,
    /// Caller-chosen correlation id, unique per principal
    pub request_id: String,
    pub confirmation_code: Option<String>,
}

/// Terminal result of a dispatch, also the dedup cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub state: CommandState,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub requires_step_up: bool,
}

impl CommandOutcome {
    fn rejected(error: impl Into<String>, requires_step_up: bool) -> Self {
        Self {
            state: CommandState::Rejected,
            success: false,
            data: None,
            error: Some(error.into()),
            requires_step_up,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            state: CommandState::Failed,
            success: false,
            data: None,
            error: Some(error.into()),
            requires_step_up: false,
        }
    }

    fn completed(data: Option<serde_json::Value>) -> Self {
        Self {
            state: CommandState::Completed,
            success: true,
            data,
            error: None,
            requires_step_up: false,
        }
    }
}

/// Dispatches privileged commands through validation, step-up gating,
/// execution, and audit.
pub struct CommandDispatcher {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
    step_up: HashSet<String>,
    verifier: Arc<dyn StepUpVerifier>,
    ledger: Arc<dyn AuditLedger>,
    registry: Arc<ConnectionRegistry>,
    /// Correlation-id cache; `None` marks a request still executing
    dedup: DashMap<String, Option<CommandOutcome>>,
    config: CommandConfig,
}

impl CommandDispatcher {
    /// Build a dispatcher over a fixed handler table.
    ///
    /// Fails at construction if two handlers claim the same name or a
    /// configured step-up action has no handler, so a misconfigured
    /// gate can never reach dispatch.
    pub fn new(
        config: CommandConfig,
        handlers: Vec<Arc<dyn CommandHandler>>,
        verifier: Arc<dyn StepUpVerifier>,
        ledger: Arc<dyn AuditLedger>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let mut table: HashMap<&'static str, Arc<dyn CommandHandler>> = HashMap::new();
        for handler in handlers {
            let name = handler.name();
            if table.insert(name, handler).is_some() {
                return Err(ControlError::Config(format!(
                    "duplicate handler registered for command '{}'",
                    name
                )));
            }
        }
        for action in &config.step_up_actions {
            if !table.contains_key(action.as_str()) {
                return Err(ControlError::Config(format!(
                    "step-up action '{}' has no registered handler",
                    action
                )));
            }
        }
        let step_up = config.step_up_actions.iter().cloned().collect();
        tracing::info!(
            handlers = table.len(),
            step_up_actions = config.step_up_actions.len(),
            "Command dispatcher ready"
        );
        Ok(Self {
            handlers: table,
            step_up,
            verifier,
            ledger,
            registry,
            dedup: DashMap::new(),
            config,
        })
    }

    /// Registered command names, sorted
    pub fn command_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Whether a command is gated behind step-up confirmation
    pub fn requires_step_up(&self, command: &str) -> bool {
        self.step_up.contains(command)
    }

    /// Run a command end to end and report the outcome.
    ///
    /// The requester receives a `command_result`; on completion the
    /// resulting event is fanned out on the effect's topic to every
    /// subscriber except the requester. Re-submitting the same
    /// `(principal, request_id)` returns the cached outcome without
    /// executing anything.
    pub async fn dispatch(&self, request: CommandRequest) -> CommandOutcome {
        let dedup_key = format!("{}:{}", request.principal_id, request.request_id);
        // Reserve the correlation id before running anything so a
        // concurrent duplicate cannot slip past the cache and execute
        // the command a second time.
        match self.dedup.entry(dedup_key.clone()) {
            Entry::Occupied(entry) => {
                let outcome = match entry.get() {
                    Some(done) => {
                        tracing::debug!(
                            principal = %request.principal_id,
                            request_id = %request.request_id,
                            "Duplicate command submission, returning cached outcome"
                        );
                        done.clone()
                    }
                    None => {
                        tracing::debug!(
                            principal = %request.principal_id,
                            request_id = %request.request_id,
                            "Duplicate command submission while original is in flight"
                        );
                        CommandOutcome::rejected(
                            format!("request '{}' is already in flight", request.request_id),
                            false,
                        )
                    }
                };
                drop(entry);
                self.send_result(&request, &outcome).await;
                return outcome;
            }
            Entry::Vacant(slot) => {
                slot.insert(None);
            }
        }

        let outcome = self.run(&request).await;
        self.remember(dedup_key, outcome.clone());
        self.send_result(&request, &outcome).await;
        outcome
    }

    async fn run(&self, request: &CommandRequest) -> CommandOutcome {
        let handler = match self.handlers.get(request.command.as_str()) {
            Some(handler) => handler.clone(),
            None => {
                tracing::warn!(
                    command = %request.command,
                    principal = %request.principal_id,
                    "Unknown command rejected"
                );
                return CommandOutcome::rejected(
                    format!("unknown command '{}'", request.command),
                    false,
                );
            }
        };

        // Step-up gate: rejected submissions must leave zero side
        // effects, so this happens before any handler runs.
        let mut confirmed_by_step_up = false;
        if self.step_up.contains(&request.command) {
            match &request.confirmation_code {
                None => {
                    let err = ControlError::StepUpRequired {
                        command: request.command.clone(),
                    };
                    return CommandOutcome::rejected(err.to_string(), true);
                }
                Some(code) => {
                    let verified = match self
                        .verifier
                        .verify(&request.principal_id, &request.command, code)
                        .await
                    {
                        Ok(verified) => verified,
                        Err(e) => {
                            tracing::error!(
                                command = %request.command,
                                error = %e,
                                "Step-up verification failed"
                            );
                            return CommandOutcome::rejected(
                                "step-up verification unavailable",
                                true,
                            );
                        }
                    };
                    if !verified {
                        tracing::warn!(
                            command = %request.command,
                            principal = %request.principal_id,
                            "Invalid step-up confirmation code"
                        );
                        return CommandOutcome::rejected(
                            "invalid step-up confirmation code",
                            true,
                        );
                    }
                    confirmed_by_step_up = true;
                }
            }
        }

        let ctx = CommandContext {
            principal_id: request.principal_id.clone(),
            payload: request.payload.clone(),
        };

        // Snapshot the target before the handler runs; if execution
        // fails, the audit record must show the state the operator
        // acted on, not whatever a partial mutation left behind.
        let attempt_state = handler.current_state(&ctx).await;

        match handler.execute(&ctx).await {
            Ok(effect) => {
                let record = AuditRecord::new(
                    effect.action,
                    effect.target_type.clone(),
                    effect.target_id.clone(),
                    request.principal_id.clone(),
                    effect.before_state.clone(),
                    effect.after_state.clone(),
                    confirmed_by_step_up,
                    true,
                );
                // The audit record must exist before anyone hears
                // about success.
                if let Err(e) = self.ledger.append(record).await {
                    self.escalate_audit_failure(request, &e).await;
                    return CommandOutcome::failed(format!(
                        "audit persistence failed: {}",
                        e
                    ));
                }

                self.registry
                    .publish_excluding(
                        &effect.topic,
                        ServerMessage::Event {
                            event: effect.event.clone(),
                            data: effect.after_state.clone(),
                        },
                        request.session_id.as_deref(),
                    )
                    .await;

                tracing::info!(
                    command = %request.command,
                    principal = %request.principal_id,
                    target = %effect.target_id,
                    "Command completed"
                );
                CommandOutcome::completed(effect.data)
            }
            Err(ControlError::Validation { command, reason }) => {
                tracing::warn!(command = %command, reason = %reason, "Command payload invalid");
                CommandOutcome::rejected(
                    format!("invalid payload for '{}': {}", command, reason),
                    false,
                )
            }
            Err(e) => {
                let (target_type, target_id) = handler.target(&request.payload);
                let record = AuditRecord::new(
                    AuditAction::from_command(&request.command),
                    target_type,
                    target_id,
                    request.principal_id.clone(),
                    attempt_state.clone(),
                    attempt_state,
                    confirmed_by_step_up,
                    false,
                )
                .with_review();
                if let Err(append_err) = self.ledger.append(record).await {
                    self.escalate_audit_failure(request, &append_err).await;
                }
                tracing::error!(command = %request.command, error = %e, "Command failed");
                CommandOutcome::failed(e.to_string())
            }
        }
    }

    /// A lost audit record is never silently absorbed, whatever the
    /// command's own outcome: log it and alert every connected owner.
    async fn escalate_audit_failure(&self, request: &CommandRequest, err: &ControlError) {
        tracing::error!(
            command = %request.command,
            error = %err,
            "Audit append failed"
        );
        self.registry
            .broadcast_all(ServerMessage::SystemAlert {
                alert: serde_json::json!({
                    "kind": "audit_persistence_failure",
                    "command": request.command,
                    "principal": request.principal_id,
                }),
            })
            .await;
    }

    async fn send_result(&self, request: &CommandRequest, outcome: &CommandOutcome) {
        let Some(session_id) = &request.session_id else {
            return;
        };
        // The session may have dropped mid-execution; the effect is
        // already applied and audited either way.
        let _ = self
            .registry
            .send_to(
                session_id,
                ServerMessage::CommandResult {
                    command: request.command.clone(),
                    request_id: request.request_id.clone(),
                    success: outcome.success,
                    data: outcome.data.clone(),
                    error: outcome.error.clone(),
                    requires_step_up: outcome.requires_step_up,
                },
            )
            .await;
    }

    fn remember(&self, key: String, outcome: CommandOutcome) {
        if self.dedup.len() >= self.config.dedup_cache_size {
            // Coarse reset; correctness only needs dedup within the
            // retry window, not forever.
            self.dedup.clear();
        }
        self.dedup.insert(key, Some(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLedger;
    use crate::auth::{Principal, Role};
    use crate::command::handler::{
        BanUserHandler, CommandEffect, MemoryStatsProvider, MemoryUserService,
        PlatformStatsHandler, StaticStepUpVerifier, UserService,
    };
    use crate::config::RegistryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FailingLedger;

    #[async_trait::async_trait]
    impl AuditLedger for FailingLedger {
        async fn append(&self, _record: AuditRecord) -> crate::error::Result<String> {
            Err(ControlError::AuditPersistence("disk full".to_string()))
        }

        async fn recent(&self, _limit: usize) -> Vec<AuditRecord> {
            Vec::new()
        }
    }

    /// User service whose reads succeed but whose writes fail
    struct UnavailableUserService {
        state: serde_json::Value,
    }

    #[async_trait::async_trait]
    impl UserService for UnavailableUserService {
        async fn user_state(&self, _user_id: &str) -> crate::error::Result<serde_json::Value> {
            Ok(self.state.clone())
        }

        async fn set_banned(
            &self,
            user_id: &str,
            _banned: bool,
        ) -> crate::error::Result<serde_json::Value> {
            Err(ControlError::Execution {
                command: "set_banned".to_string(),
                reason: format!("user service unavailable for {}", user_id),
            })
        }

        async fn revoke_sessions(&self, user_id: &str) -> crate::error::Result<serde_json::Value> {
            Err(ControlError::Execution {
                command: "revoke_sessions".to_string(),
                reason: format!("user service unavailable for {}", user_id),
            })
        }
    }

    /// Handler that counts executions and yields mid-flight
    struct SlowHandler {
        executions: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl CommandHandler for SlowHandler {
        fn name(&self) -> &'static str {
            "slow_op"
        }

        fn target(&self, _payload: &serde_json::Value) -> (String, String) {
            ("system".to_string(), "slow".to_string())
        }

        async fn execute(&self, _ctx: &CommandContext) -> crate::error::Result<CommandEffect> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(CommandEffect {
                action: AuditAction::Unknown,
                target_type: "system".to_string(),
                target_id: "slow".to_string(),
                before_state: serde_json::json!({}),
                after_state: serde_json::json!({}),
                data: None,
                topic: "system".to_string(),
                event: "slow_done".to_string(),
            })
        }
    }

    struct Fixture {
        dispatcher: CommandDispatcher,
        users: Arc<MemoryUserService>,
        ledger: Arc<MemoryAuditLedger>,
        registry: Arc<ConnectionRegistry>,
    }

    async fn fixture() -> Fixture {
        let users = Arc::new(MemoryUserService::new());
        users.seed("u-1").await;
        let ledger = Arc::new(MemoryAuditLedger::new());
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        let config = CommandConfig {
            step_up_actions: vec!["ban_user".to_string()],
            dedup_cache_size: 4,
        };
        let dispatcher = CommandDispatcher::new(
            config,
            vec![
                Arc::new(BanUserHandler::new(users.clone())),
                Arc::new(PlatformStatsHandler::new(Arc::new(
                    MemoryStatsProvider::new(serde_json::json!({"orders": 3})),
                ))),
            ],
            Arc::new(StaticStepUpVerifier::new("123456")),
            ledger.clone(),
            registry.clone(),
        )
        .unwrap();
        Fixture {
            dispatcher,
            users,
            ledger,
            registry,
        }
    }

    fn request(
        command: &str,
        payload: serde_json::Value,
        request_id: &str,
        code: Option<&str>,
    ) -> CommandRequest {
        CommandRequest {
            session_id: None,
            principal_id: "owner-1".to_string(),
            command: command.to_string(),
            payload,
            request_id: request_id.to_string(),
            confirmation_code: code.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_step_up_gated_command_completes_with_valid_code() {
        let f = fixture().await;
        let outcome = f
            .dispatcher
            .dispatch(request(
                "ban_user",
                serde_json::json!({"userId": "u-1"}),
                "req-1",
                Some("123456"),
            ))
            .await;

        assert_eq!(outcome.state, CommandState::Completed);
        assert!(outcome.success);
        assert_eq!(f.users.get("u-1").await.unwrap()["banned"], true);

        let records = f.ledger.recent(10).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].confirmed_by_step_up);
        assert!(records[0].success);
    }

    #[tokio::test]
    async fn test_missing_step_up_code_rejected_with_no_side_effects() {
        let f = fixture().await;
        let outcome = f
            .dispatcher
            .dispatch(request(
                "ban_user",
                serde_json::json!({"userId": "u-1"}),
                "req-1",
                None,
            ))
            .await;

        assert_eq!(outcome.state, CommandState::Rejected);
        assert!(outcome.requires_step_up);
        assert!(outcome
            .error
            .unwrap()
            .contains("requires step-up confirmation"));
        assert_eq!(f.users.get("u-1").await.unwrap()["banned"], false);
        assert!(f.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_step_up_code_rejected() {
        let f = fixture().await;
        let outcome = f
            .dispatcher
            .dispatch(request(
                "ban_user",
                serde_json::json!({"userId": "u-1"}),
                "req-1",
                Some("999999"),
            ))
            .await;

        assert_eq!(outcome.state, CommandState::Rejected);
        assert!(outcome.requires_step_up);
        assert!(f.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_gated_command_needs_no_code() {
        let f = fixture().await;
        let outcome = f
            .dispatcher
            .dispatch(request("platform_stats", serde_json::json!({}), "req-1", None))
            .await;

        assert_eq!(outcome.state, CommandState::Completed);
        assert_eq!(outcome.data.unwrap()["orders"], 3);
    }

    #[tokio::test]
    async fn test_unknown_command_rejected_without_audit() {
        let f = fixture().await;
        let outcome = f
            .dispatcher
            .dispatch(request("make_coffee", serde_json::json!({}), "req-1", None))
            .await;

        assert_eq!(outcome.state, CommandState::Rejected);
        assert!(!outcome.requires_step_up);
        assert!(f.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_returns_cached_outcome() {
        let f = fixture().await;
        let req = request(
            "ban_user",
            serde_json::json!({"userId": "u-1"}),
            "req-dup",
            Some("123456"),
        );

        let first = f.dispatcher.dispatch(req.clone()).await;
        assert_eq!(first.state, CommandState::Completed);
        assert_eq!(f.ledger.len().await, 1);

        // Same correlation id: cached outcome, no second execution,
        // no second audit record.
        let second = f.dispatcher.dispatch(req).await;
        assert_eq!(second.state, CommandState::Completed);
        assert!(second.success);
        assert_eq!(f.ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_distinct_request_ids_execute_independently() {
        let f = fixture().await;
        f.dispatcher
            .dispatch(request(
                "ban_user",
                serde_json::json!({"userId": "u-1"}),
                "req-1",
                Some("123456"),
            ))
            .await;
        f.dispatcher
            .dispatch(request(
                "ban_user",
                serde_json::json!({"userId": "u-1"}),
                "req-2",
                Some("123456"),
            ))
            .await;
        assert_eq!(f.ledger.len().await, 2);
    }

    #[tokio::test]
    async fn test_failed_execution_is_audited_with_review_flag() {
        let f = fixture().await;
        let outcome = f
            .dispatcher
            .dispatch(request(
                "ban_user",
                serde_json::json!({"userId": "u-missing"}),
                "req-1",
                Some("123456"),
            ))
            .await;

        assert_eq!(outcome.state, CommandState::Failed);
        let records = f.ledger.recent(10).await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(records[0].requires_review);
        assert_eq!(records[0].before_state, records[0].after_state);
    }

    #[tokio::test]
    async fn test_failed_execution_audits_state_at_attempt() {
        let state = serde_json::json!({"id": "u-1", "banned": false, "sessions": 1});
        let users: Arc<dyn UserService> = Arc::new(UnavailableUserService {
            state: state.clone(),
        });
        let ledger = Arc::new(MemoryAuditLedger::new());
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        let dispatcher = CommandDispatcher::new(
            CommandConfig {
                step_up_actions: Vec::new(),
                dedup_cache_size: 4,
            },
            vec![Arc::new(BanUserHandler::new(users))],
            Arc::new(StaticStepUpVerifier::new("123456")),
            ledger.clone(),
            registry,
        )
        .unwrap();

        let outcome = dispatcher
            .dispatch(request(
                "ban_user",
                serde_json::json!({"userId": "u-1"}),
                "req-1",
                None,
            ))
            .await;

        // The target was readable when the write failed; the record
        // carries that snapshot rather than an empty object.
        assert_eq!(outcome.state, CommandState::Failed);
        let records = ledger.recent(10).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].requires_review);
        assert_eq!(records[0].before_state, state);
        assert_eq!(records[0].after_state, state);
    }

    #[tokio::test]
    async fn test_invalid_payload_rejected_before_execution() {
        let f = fixture().await;
        let outcome = f
            .dispatcher
            .dispatch(request(
                "ban_user",
                serde_json::json!({}),
                "req-1",
                Some("123456"),
            ))
            .await;

        assert_eq!(outcome.state, CommandState::Rejected);
        assert!(outcome.error.unwrap().contains("invalid payload"));
    }

    #[tokio::test]
    async fn test_audit_failure_never_reports_success() {
        let users = Arc::new(MemoryUserService::new());
        users.seed("u-1").await;
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));

        // A connected watcher should see the escalation alert.
        let watcher = Principal {
            id: "owner-2".to_string(),
            role: Role::Owner,
        };
        let (_session_id, mut rx) = registry.register(&watcher).await;

        let dispatcher = CommandDispatcher::new(
            CommandConfig {
                step_up_actions: Vec::new(),
                dedup_cache_size: 4,
            },
            vec![Arc::new(BanUserHandler::new(users.clone()))],
            Arc::new(StaticStepUpVerifier::new("123456")),
            Arc::new(FailingLedger),
            registry.clone(),
        )
        .unwrap();

        let outcome = dispatcher
            .dispatch(request(
                "ban_user",
                serde_json::json!({"userId": "u-1"}),
                "req-1",
                None,
            ))
            .await;

        assert_eq!(outcome.state, CommandState::Failed);
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("audit persistence"));

        let msg = rx.recv().await.unwrap();
        match msg {
            ServerMessage::SystemAlert { alert } => {
                assert_eq!(alert["kind"], "audit_persistence_failure");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_audit_failure_on_failed_command_escalates() {
        // The user is never seeded, so execution fails; the failure
        // record's append then fails too and must still raise an alert.
        let users = Arc::new(MemoryUserService::new());
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        let watcher = Principal {
            id: "owner-2".to_string(),
            role: Role::Owner,
        };
        let (_session_id, mut rx) = registry.register(&watcher).await;

        let dispatcher = CommandDispatcher::new(
            CommandConfig {
                step_up_actions: Vec::new(),
                dedup_cache_size: 4,
            },
            vec![Arc::new(BanUserHandler::new(users))],
            Arc::new(StaticStepUpVerifier::new("123456")),
            Arc::new(FailingLedger),
            registry.clone(),
        )
        .unwrap();

        let outcome = dispatcher
            .dispatch(request(
                "ban_user",
                serde_json::json!({"userId": "u-missing"}),
                "req-1",
                None,
            ))
            .await;

        assert_eq!(outcome.state, CommandState::Failed);
        match rx.recv().await.unwrap() {
            ServerMessage::SystemAlert { alert } => {
                assert_eq!(alert["kind"], "audit_persistence_failure");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_submissions_execute_once() {
        let executions = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        let ledger = Arc::new(MemoryAuditLedger::new());
        let dispatcher = CommandDispatcher::new(
            CommandConfig {
                step_up_actions: Vec::new(),
                dedup_cache_size: 4,
            },
            vec![Arc::new(SlowHandler {
                executions: executions.clone(),
            })],
            Arc::new(StaticStepUpVerifier::new("123456")),
            ledger.clone(),
            registry,
        )
        .unwrap();

        let req = request("slow_op", serde_json::json!({}), "req-race", None);
        let (first, second) =
            tokio::join!(dispatcher.dispatch(req.clone()), dispatcher.dispatch(req));

        // The second submission arrives while the first is still
        // executing; it must not run the handler again.
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.len().await, 1);
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|o| o.success).count(), 1);
        let rejected = outcomes.iter().find(|o| !o.success).unwrap();
        assert_eq!(rejected.state, CommandState::Rejected);
        assert!(rejected.error.as_ref().unwrap().contains("in flight"));
    }

    #[tokio::test]
    async fn test_event_fanned_out_excluding_requester() {
        let f = fixture().await;

        let requester = Principal {
            id: "owner-1".to_string(),
            role: Role::Owner,
        };
        let (req_session, mut req_rx) = f.registry.register(&requester).await;
        let watcher = Principal {
            id: "owner-2".to_string(),
            role: Role::Owner,
        };
        let (watch_session, mut watch_rx) = f.registry.register(&watcher).await;
        f.registry
            .subscribe(&req_session, &["users".to_string()])
            .await
            .unwrap();
        f.registry
            .subscribe(&watch_session, &["users".to_string()])
            .await
            .unwrap();

        let mut req = request(
            "ban_user",
            serde_json::json!({"userId": "u-1"}),
            "req-1",
            Some("123456"),
        );
        req.session_id = Some(req_session.clone());
        f.dispatcher.dispatch(req).await;

        // Watcher gets the topic event
        let msg = watch_rx.recv().await.unwrap();
        match msg {
            ServerMessage::Event { event, data } => {
                assert_eq!(event, "user_banned");
                assert_eq!(data["banned"], true);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        // Requester gets the command result, not the event
        let msg = req_rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::CommandResult { success: true, .. }));
    }

    #[test]
    fn test_misconfigured_step_up_gate_fails_construction() {
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        let result = CommandDispatcher::new(
            CommandConfig {
                step_up_actions: vec!["ban_user".to_string()],
                dedup_cache_size: 4,
            },
            Vec::new(),
            Arc::new(StaticStepUpVerifier::new("123456")),
            Arc::new(MemoryAuditLedger::new()),
            registry,
        );
        assert!(matches!(result, Err(ControlError::Config(_))));
    }

    #[test]
    fn test_duplicate_handler_name_fails_construction() {
        let users = Arc::new(MemoryUserService::new());
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        let result = CommandDispatcher::new(
            CommandConfig {
                step_up_actions: Vec::new(),
                dedup_cache_size: 4,
            },
            vec![
                Arc::new(BanUserHandler::new(users.clone())),
                Arc::new(BanUserHandler::new(users)),
            ],
            Arc::new(StaticStepUpVerifier::new("123456")),
            Arc::new(MemoryAuditLedger::new()),
            registry,
        );
        assert!(matches!(result, Err(ControlError::Config(_))));
    }

    #[tokio::test]
    async fn test_dedup_cache_bounded() {
        let f = fixture().await;
        // Capacity is 4; a fifth distinct id forces the coarse reset
        // and everything still dispatches.
        for i in 0..6 {
            let outcome = f
                .dispatcher
                .dispatch(request(
                    "platform_stats",
                    serde_json::json!({}),
                    &format!("req-{}", i),
                    None,
                ))
                .await;
            assert!(outcome.success);
        }
        assert!(f.dispatcher.dedup.len() <= 4);
    }
}
