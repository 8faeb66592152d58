//! Privileged command dispatch
//!
//! Commands arrive over the wire as `{command, payload, request_id}`,
//! pass through a per-command state machine, and leave exactly one
//! audit record behind. Handlers are registered at startup; an
//! unknown name is rejected without side effects, and a missing
//! handler for a configured step-up action is a construction error,
//! not a runtime surprise.

mod dispatcher;
mod handler;

pub use dispatcher::{CommandDispatcher, CommandOutcome, CommandRequest, CommandState};
pub use handler::{
    BanUserHandler, CommandContext, CommandEffect, CommandHandler, EmergencyShutdownHandler,
    ForceLogoutHandler, MemoryOrderService, MemorySettingsStore, MemoryStatsProvider,
    MemoryUserService, OrderService, OverrideOrderHandler, PlatformStatsHandler,
    RefundOrderHandler, SettingsStore, StaticStepUpVerifier, StatsProvider, StepUpVerifier,
    ToggleMaintenanceHandler, UnbanUserHandler, UserService,
};
