//! # storeops-control
//!
//! Real-time owner control plane for a multi-tenant commerce platform.
//!
//! ## Overview
//!
//! `storeops-control` gives platform owners a single authenticated
//! session over which they watch live activity (orders, users, system
//! alerts as topic streams) and execute privileged commands (bans,
//! order overrides, refunds, maintenance toggles) with step-up
//! confirmation, full audit, and asynchronous risk scoring of every
//! request.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storeops_control::{
//!     ControlConfig, ControlPlane, MemoryActivityStore, MemoryAuditLedger,
//!     MemoryDirectory, MemoryStatsProvider, PlatformStatsHandler,
//!     StaticStepUpVerifier, TokenValidator,
//! };
//!
//! # async fn example() -> storeops_control::Result<()> {
//! let validator = TokenValidator::new(
//!     b"signing-secret".to_vec(),
//!     Arc::new(MemoryDirectory::with_owner("owner-1")),
//! );
//! let stats = Arc::new(MemoryStatsProvider::new(serde_json::json!({"orders": 0})));
//!
//! let mut plane = ControlPlane::new(
//!     ControlConfig::default(),
//!     validator,
//!     vec![Arc::new(PlatformStatsHandler::new(stats))],
//!     Arc::new(StaticStepUpVerifier::new("000000")),
//!     Arc::new(MemoryAuditLedger::new()),
//!     Arc::new(MemoryActivityStore::new()),
//! )?;
//! plane.start();
//!
//! let (session_id, _messages) = plane.connect("owner-credential").await?;
//! println!("connected: {}", session_id);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **ConnectionRegistry**: sessions, topic subscriptions, fan-out
//! - **TokenValidator**: signed bearer credentials, owner-only admission
//! - **CommandDispatcher**: validated handler table, step-up gate,
//!   correlation-id dedup
//! - **AuditLedger** trait: append-only trail of privileged actions
//! - **ActivityRecorder**: non-blocking risk scoring of every request
//! - **ControlPlane**: the facade wiring it all together

pub mod activity;
pub mod audit;
pub mod auth;
pub mod command;
pub mod config;
pub mod error;
pub mod liveness;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod session;

// Re-export core types
pub use activity::{
    ActivityRecord, ActivityRecorder, ActivityStore, MemoryActivityStore, RiskScorer, ALERT_TOPIC,
};
pub use audit::{AuditAction, AuditLedger, AuditRecord, FileAuditLedger, MemoryAuditLedger};
pub use auth::{
    DirectoryEntry, MemoryDirectory, Principal, Role, TokenValidator, UserDirectory,
};
pub use command::{
    BanUserHandler, CommandContext, CommandDispatcher, CommandEffect, CommandHandler,
    CommandOutcome, CommandRequest, CommandState, EmergencyShutdownHandler, ForceLogoutHandler,
    MemoryOrderService, MemorySettingsStore, MemoryStatsProvider, MemoryUserService, OrderService,
    OverrideOrderHandler, PlatformStatsHandler, RefundOrderHandler, SettingsStore,
    StaticStepUpVerifier, StatsProvider, StepUpVerifier, ToggleMaintenanceHandler,
    UnbanUserHandler, UserService,
};
pub use config::{CommandConfig, ControlConfig, LivenessConfig, RegistryConfig, RiskConfig};
pub use error::{ControlError, Result};
pub use liveness::LivenessMonitor;
pub use protocol::{capabilities, ClientMessage, ServerMessage};
pub use registry::{ConnectionRegistry, EvictionReason};
pub use service::{message_stream, ControlPlane};
pub use session::{Session, SessionInfo};
