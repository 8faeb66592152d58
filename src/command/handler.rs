//! Command handlers and business collaborator seams
//!
//! Each handler owns one command name: it validates the payload,
//! snapshots before-state, calls the responsible collaborator, and
//! returns a `CommandEffect` describing what changed and where to
//! fan the resulting event out. The control plane never owns business
//! state; users, orders, and settings live behind these traits.

use crate::audit::AuditAction;
use crate::error::{ControlError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

// ─── Collaborator traits ─────────────────────────────────────────

/// User service collaborator: owns ban state and session revocation
#[async_trait::async_trait]
pub trait UserService: Send + Sync {
    /// Current state snapshot for a user
    async fn user_state(&self, user_id: &str) -> Result<serde_json::Value>;

    /// Set the ban flag, returning the updated state snapshot
    async fn set_banned(&self, user_id: &str, banned: bool) -> Result<serde_json::Value>;

    /// Revoke all of a user's platform sessions, returning the
    /// updated state snapshot
    async fn revoke_sessions(&self, user_id: &str) -> Result<serde_json::Value>;
}

/// Order service collaborator: owns order status and refunds
#[async_trait::async_trait]
pub trait OrderService: Send + Sync {
    async fn order_state(&self, order_id: &str) -> Result<serde_json::Value>;

    /// Force an order into the given status, returning the updated state
    async fn override_status(&self, order_id: &str, status: &str) -> Result<serde_json::Value>;

    /// Refund an order, returning the updated state
    async fn refund(&self, order_id: &str) -> Result<serde_json::Value>;
}

/// Settings store collaborator: feature flags and maintenance state
#[async_trait::async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_flag(&self, name: &str) -> Result<bool>;

    /// Set a flag, returning its previous value
    async fn set_flag(&self, name: &str, value: bool) -> Result<bool>;
}

/// Aggregate counters collaborator (read-only)
#[async_trait::async_trait]
pub trait StatsProvider: Send + Sync {
    async fn snapshot(&self) -> Result<serde_json::Value>;
}

/// Step-up (second factor) verifier collaborator.
///
/// The verification protocol itself is out of scope here; the control
/// plane only needs a trustworthy yes/no for a one-time code.
#[async_trait::async_trait]
pub trait StepUpVerifier: Send + Sync {
    async fn verify(&self, principal_id: &str, command: &str, code: &str) -> Result<bool>;
}

/// Feature flag names used by the built-in handlers
pub const MAINTENANCE_FLAG: &str = "maintenance_mode";
pub const SHUTDOWN_FLAG: &str = "emergency_shutdown";

// ─── Handler contract ────────────────────────────────────────────

/// Execution context handed to a handler
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Principal that submitted the command
    pub principal_id: String,
    /// Raw command payload
    pub payload: serde_json::Value,
}

/// What a completed command did, for auditing and fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEffect {
    /// Audit action describing the effect
    pub action: AuditAction,
    /// Affected resource kind
    pub target_type: String,
    /// Affected resource id
    pub target_id: String,
    /// Snapshot before execution
    pub before_state: serde_json::Value,
    /// Snapshot after execution
    pub after_state: serde_json::Value,
    /// Result data returned to the requester
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Topic the resulting event is published on
    pub topic: String,
    /// Event name for the fan-out message
    pub event: String,
}

/// One registered command
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    /// Wire name of the command this handler owns
    fn name(&self) -> &'static str;

    /// (target_type, target_id) extracted from a payload, for audit
    /// records of attempts that never reached execution
    fn target(&self, payload: &serde_json::Value) -> (String, String);

    /// Best-effort snapshot of the target's state, taken before the
    /// handler runs so a failure record still captures what the
    /// operator acted on
    async fn current_state(&self, ctx: &CommandContext) -> serde_json::Value {
        let _ = ctx;
        serde_json::json!({})
    }

    /// Validate the payload and perform the effect
    async fn execute(&self, ctx: &CommandContext) -> Result<CommandEffect>;
}

fn required_str(payload: &serde_json::Value, key: &str, command: &str) -> Result<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| ControlError::Validation {
            command: command.to_string(),
            reason: format!("missing or empty '{}'", key),
        })
}

fn str_field(payload: &serde_json::Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

async fn user_snapshot(users: &dyn UserService, payload: &serde_json::Value) -> serde_json::Value {
    match payload.get("userId").and_then(|v| v.as_str()) {
        Some(user_id) => users
            .user_state(user_id)
            .await
            .unwrap_or_else(|_| serde_json::json!({})),
        None => serde_json::json!({}),
    }
}

async fn order_snapshot(
    orders: &dyn OrderService,
    payload: &serde_json::Value,
) -> serde_json::Value {
    match payload.get("orderId").and_then(|v| v.as_str()) {
        Some(order_id) => orders
            .order_state(order_id)
            .await
            .unwrap_or_else(|_| serde_json::json!({})),
        None => serde_json::json!({}),
    }
}

// ─── Built-in handlers ───────────────────────────────────────────

/// `ban_user`: set a user's ban flag (step-up gated)
pub struct BanUserHandler {
    users: std::sync::Arc<dyn UserService>,
}

impl BanUserHandler {
    pub fn new(users: std::sync::Arc<dyn UserService>) -> Self {
        Self { users }
    }
}

#[async_trait::async_trait]
impl CommandHandler for BanUserHandler {
    fn name(&self) -> &'static str {
        "ban_user"
    }

    fn target(&self, payload: &serde_json::Value) -> (String, String) {
        ("user".to_string(), str_field(payload, "userId"))
    }

    async fn current_state(&self, ctx: &CommandContext) -> serde_json::Value {
        user_snapshot(self.users.as_ref(), &ctx.payload).await
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<CommandEffect> {
        let user_id = required_str(&ctx.payload, "userId", self.name())?;
        let before = self.users.user_state(&user_id).await?;
        let after = self.users.set_banned(&user_id, true).await?;
        Ok(CommandEffect {
            action: AuditAction::BanUser,
            target_type: "user".to_string(),
            target_id: user_id.clone(),
            before_state: before,
            after_state: after.clone(),
            data: Some(after),
            topic: "users".to_string(),
            event: "user_banned".to_string(),
        })
    }
}

/// `unban_user`: clear a user's ban flag (step-up gated)
pub struct UnbanUserHandler {
    users: std::sync::Arc<dyn UserService>,
}

impl UnbanUserHandler {
    pub fn new(users: std::sync::Arc<dyn UserService>) -> Self {
        Self { users }
    }
}

#[async_trait::async_trait]
impl CommandHandler for UnbanUserHandler {
    fn name(&self) -> &'static str {
        "unban_user"
    }

    fn target(&self, payload: &serde_json::Value) -> (String, String) {
        ("user".to_string(), str_field(payload, "userId"))
    }

    async fn current_state(&self, ctx: &CommandContext) -> serde_json::Value {
        user_snapshot(self.users.as_ref(), &ctx.payload).await
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<CommandEffect> {
        let user_id = required_str(&ctx.payload, "userId", self.name())?;
        let before = self.users.user_state(&user_id).await?;
        let after = self.users.set_banned(&user_id, false).await?;
        Ok(CommandEffect {
            action: AuditAction::UnbanUser,
            target_type: "user".to_string(),
            target_id: user_id,
            before_state: before,
            after_state: after.clone(),
            data: Some(after),
            topic: "users".to_string(),
            event: "user_unbanned".to_string(),
        })
    }
}

/// `force_logout`: revoke every platform session of a user
pub struct ForceLogoutHandler {
    users: std::sync::Arc<dyn UserService>,
}

impl ForceLogoutHandler {
    pub fn new(users: std::sync::Arc<dyn UserService>) -> Self {
        Self { users }
    }
}

#[async_trait::async_trait]
impl CommandHandler for ForceLogoutHandler {
    fn name(&self) -> &'static str {
        "force_logout"
    }

    fn target(&self, payload: &serde_json::Value) -> (String, String) {
        ("user".to_string(), str_field(payload, "userId"))
    }

    async fn current_state(&self, ctx: &CommandContext) -> serde_json::Value {
        user_snapshot(self.users.as_ref(), &ctx.payload).await
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<CommandEffect> {
        let user_id = required_str(&ctx.payload, "userId", self.name())?;
        let before = self.users.user_state(&user_id).await?;
        let after = self.users.revoke_sessions(&user_id).await?;
        Ok(CommandEffect {
            action: AuditAction::ForceLogout,
            target_type: "user".to_string(),
            target_id: user_id.clone(),
            before_state: before,
            after_state: after,
            data: Some(serde_json::json!({"userId": user_id})),
            topic: "users".to_string(),
            event: "force_logout".to_string(),
        })
    }
}

/// `override_order`: force an order into a given status (step-up gated)
pub struct OverrideOrderHandler {
    orders: std::sync::Arc<dyn OrderService>,
}

impl OverrideOrderHandler {
    pub fn new(orders: std::sync::Arc<dyn OrderService>) -> Self {
        Self { orders }
    }
}

#[async_trait::async_trait]
impl CommandHandler for OverrideOrderHandler {
    fn name(&self) -> &'static str {
        "override_order"
    }

    fn target(&self, payload: &serde_json::Value) -> (String, String) {
        ("order".to_string(), str_field(payload, "orderId"))
    }

    async fn current_state(&self, ctx: &CommandContext) -> serde_json::Value {
        order_snapshot(self.orders.as_ref(), &ctx.payload).await
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<CommandEffect> {
        let order_id = required_str(&ctx.payload, "orderId", self.name())?;
        let status = required_str(&ctx.payload, "status", self.name())?;
        let before = self.orders.order_state(&order_id).await?;
        let after = self.orders.override_status(&order_id, &status).await?;
        Ok(CommandEffect {
            action: AuditAction::OverrideOrder,
            target_type: "order".to_string(),
            target_id: order_id,
            before_state: before,
            after_state: after.clone(),
            data: Some(after),
            topic: "orders".to_string(),
            event: "order_updated".to_string(),
        })
    }
}

/// `refund_order`: force a refund (step-up gated)
pub struct RefundOrderHandler {
    orders: std::sync::Arc<dyn OrderService>,
}

impl RefundOrderHandler {
    pub fn new(orders: std::sync::Arc<dyn OrderService>) -> Self {
        Self { orders }
    }
}

#[async_trait::async_trait]
impl CommandHandler for RefundOrderHandler {
    fn name(&self) -> &'static str {
        "refund_order"
    }

    fn target(&self, payload: &serde_json::Value) -> (String, String) {
        ("order".to_string(), str_field(payload, "orderId"))
    }

    async fn current_state(&self, ctx: &CommandContext) -> serde_json::Value {
        order_snapshot(self.orders.as_ref(), &ctx.payload).await
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<CommandEffect> {
        let order_id = required_str(&ctx.payload, "orderId", self.name())?;
        let before = self.orders.order_state(&order_id).await?;
        let after = self.orders.refund(&order_id).await?;
        Ok(CommandEffect {
            action: AuditAction::RefundOrder,
            target_type: "order".to_string(),
            target_id: order_id,
            before_state: before,
            after_state: after.clone(),
            data: Some(after),
            topic: "orders".to_string(),
            event: "order_refunded".to_string(),
        })
    }
}

/// `toggle_maintenance`: flip platform maintenance mode (step-up gated)
pub struct ToggleMaintenanceHandler {
    settings: std::sync::Arc<dyn SettingsStore>,
}

impl ToggleMaintenanceHandler {
    pub fn new(settings: std::sync::Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl CommandHandler for ToggleMaintenanceHandler {
    fn name(&self) -> &'static str {
        "toggle_maintenance"
    }

    fn target(&self, _payload: &serde_json::Value) -> (String, String) {
        ("system".to_string(), MAINTENANCE_FLAG.to_string())
    }

    async fn current_state(&self, _ctx: &CommandContext) -> serde_json::Value {
        let enabled = self.settings.get_flag(MAINTENANCE_FLAG).await.unwrap_or(false);
        serde_json::json!({"maintenanceMode": enabled})
    }

    async fn execute(&self, ctx: &CommandContext) -> Result<CommandEffect> {
        let enabled = ctx
            .payload
            .get("enabled")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| ControlError::Validation {
                command: self.name().to_string(),
                reason: "missing boolean 'enabled'".to_string(),
            })?;
        let previous = self.settings.set_flag(MAINTENANCE_FLAG, enabled).await?;
        Ok(CommandEffect {
            action: AuditAction::ToggleMaintenance,
            target_type: "system".to_string(),
            target_id: MAINTENANCE_FLAG.to_string(),
            before_state: serde_json::json!({"maintenanceMode": previous}),
            after_state: serde_json::json!({"maintenanceMode": enabled}),
            data: Some(serde_json::json!({"maintenanceMode": enabled})),
            topic: "system".to_string(),
            event: "maintenance_changed".to_string(),
        })
    }
}

/// `emergency_shutdown`: flag the platform down and stop accepting
/// customer traffic (step-up gated)
pub struct EmergencyShutdownHandler {
    settings: std::sync::Arc<dyn SettingsStore>,
}

impl EmergencyShutdownHandler {
    pub fn new(settings: std::sync::Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }
}

#[async_trait::async_trait]
impl CommandHandler for EmergencyShutdownHandler {
    fn name(&self) -> &'static str {
        "emergency_shutdown"
    }

    fn target(&self, _payload: &serde_json::Value) -> (String, String) {
        ("system".to_string(), SHUTDOWN_FLAG.to_string())
    }

    async fn current_state(&self, _ctx: &CommandContext) -> serde_json::Value {
        let down = self.settings.get_flag(SHUTDOWN_FLAG).await.unwrap_or(false);
        serde_json::json!({"emergencyShutdown": down})
    }

    async fn execute(&self, _ctx: &CommandContext) -> Result<CommandEffect> {
        let previous = self.settings.set_flag(SHUTDOWN_FLAG, true).await?;
        // Shutdown implies maintenance mode
        let _ = self.settings.set_flag(MAINTENANCE_FLAG, true).await?;
        Ok(CommandEffect {
            action: AuditAction::EmergencyShutdown,
            target_type: "system".to_string(),
            target_id: SHUTDOWN_FLAG.to_string(),
            before_state: serde_json::json!({"emergencyShutdown": previous}),
            after_state: serde_json::json!({"emergencyShutdown": true}),
            data: Some(serde_json::json!({"emergencyShutdown": true})),
            topic: "system".to_string(),
            event: "emergency_shutdown".to_string(),
        })
    }
}

/// `platform_stats`: read-only aggregate counters (no step-up)
pub struct PlatformStatsHandler {
    stats: std::sync::Arc<dyn StatsProvider>,
}

impl PlatformStatsHandler {
    pub fn new(stats: std::sync::Arc<dyn StatsProvider>) -> Self {
        Self { stats }
    }
}

#[async_trait::async_trait]
impl CommandHandler for PlatformStatsHandler {
    fn name(&self) -> &'static str {
        "platform_stats"
    }

    fn target(&self, _payload: &serde_json::Value) -> (String, String) {
        ("system".to_string(), "stats".to_string())
    }

    async fn current_state(&self, _ctx: &CommandContext) -> serde_json::Value {
        serde_json::Value::Null
    }

    async fn execute(&self, _ctx: &CommandContext) -> Result<CommandEffect> {
        let snapshot = self.stats.snapshot().await?;
        Ok(CommandEffect {
            action: AuditAction::PlatformStats,
            target_type: "system".to_string(),
            target_id: "stats".to_string(),
            before_state: serde_json::Value::Null,
            after_state: serde_json::Value::Null,
            data: Some(snapshot),
            topic: "system".to_string(),
            event: "stats_read".to_string(),
        })
    }
}

// ─── In-memory collaborators ─────────────────────────────────────
//
// Single-process implementations for testing and local runs, in the
// same spirit as the registry's in-memory stores.

/// In-memory user service
#[derive(Default)]
pub struct MemoryUserService {
    users: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryUserService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user with default state
    pub async fn seed(&self, user_id: &str) {
        self.users.write().await.insert(
            user_id.to_string(),
            serde_json::json!({"id": user_id, "banned": false, "sessions": 1}),
        );
    }

    pub async fn get(&self, user_id: &str) -> Option<serde_json::Value> {
        self.users.read().await.get(user_id).cloned()
    }
}

#[async_trait::async_trait]
impl UserService for MemoryUserService {
    async fn user_state(&self, user_id: &str) -> Result<serde_json::Value> {
        self.users
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| ControlError::Execution {
                command: "user_state".to_string(),
                reason: format!("user {} not found", user_id),
            })
    }

    async fn set_banned(&self, user_id: &str, banned: bool) -> Result<serde_json::Value> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| ControlError::Execution {
                command: "set_banned".to_string(),
                reason: format!("user {} not found", user_id),
            })?;
        user["banned"] = serde_json::json!(banned);
        Ok(user.clone())
    }

    async fn revoke_sessions(&self, user_id: &str) -> Result<serde_json::Value> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(user_id)
            .ok_or_else(|| ControlError::Execution {
                command: "revoke_sessions".to_string(),
                reason: format!("user {} not found", user_id),
            })?;
        user["sessions"] = serde_json::json!(0);
        Ok(user.clone())
    }
}

/// In-memory order service
#[derive(Default)]
pub struct MemoryOrderService {
    orders: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryOrderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, order_id: &str, status: &str) {
        self.orders.write().await.insert(
            order_id.to_string(),
            serde_json::json!({"id": order_id, "status": status, "refunded": false}),
        );
    }

    pub async fn get(&self, order_id: &str) -> Option<serde_json::Value> {
        self.orders.read().await.get(order_id).cloned()
    }
}

#[async_trait::async_trait]
impl OrderService for MemoryOrderService {
    async fn order_state(&self, order_id: &str) -> Result<serde_json::Value> {
        self.orders
            .read()
            .await
            .get(order_id)
            .cloned()
            .ok_or_else(|| ControlError::Execution {
                command: "order_state".to_string(),
                reason: format!("order {} not found", order_id),
            })
    }

    async fn override_status(&self, order_id: &str, status: &str) -> Result<serde_json::Value> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| ControlError::Execution {
                command: "override_status".to_string(),
                reason: format!("order {} not found", order_id),
            })?;
        order["status"] = serde_json::json!(status);
        Ok(order.clone())
    }

    async fn refund(&self, order_id: &str) -> Result<serde_json::Value> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| ControlError::Execution {
                command: "refund".to_string(),
                reason: format!("order {} not found", order_id),
            })?;
        order["status"] = serde_json::json!("refunded");
        order["refunded"] = serde_json::json!(true);
        Ok(order.clone())
    }
}

/// In-memory settings store
#[derive(Default)]
pub struct MemorySettingsStore {
    flags: RwLock<HashMap<String, bool>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn get_flag(&self, name: &str) -> Result<bool> {
        Ok(self.flags.read().await.get(name).copied().unwrap_or(false))
    }

    async fn set_flag(&self, name: &str, value: bool) -> Result<bool> {
        let mut flags = self.flags.write().await;
        Ok(flags.insert(name.to_string(), value).unwrap_or(false))
    }
}

/// In-memory stats provider returning fixed counters
#[derive(Default)]
pub struct MemoryStatsProvider {
    counters: RwLock<serde_json::Value>,
}

impl MemoryStatsProvider {
    pub fn new(counters: serde_json::Value) -> Self {
        Self {
            counters: RwLock::new(counters),
        }
    }
}

#[async_trait::async_trait]
impl StatsProvider for MemoryStatsProvider {
    async fn snapshot(&self) -> Result<serde_json::Value> {
        Ok(self.counters.read().await.clone())
    }
}

/// Step-up verifier that accepts exactly one configured code.
///
/// Stands in for the real second-factor collaborator in tests and
/// local runs; the production verifier lives outside this crate.
pub struct StaticStepUpVerifier {
    code: String,
}

impl StaticStepUpVerifier {
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

#[async_trait::async_trait]
impl StepUpVerifier for StaticStepUpVerifier {
    async fn verify(&self, _principal_id: &str, _command: &str, code: &str) -> Result<bool> {
        Ok(code == self.code)
    }
}
