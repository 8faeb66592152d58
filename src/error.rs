//! Error types for the control plane

use thiserror::Error;

/// Errors that can occur in the control plane
#[derive(Debug, Error)]
pub enum ControlError {
    /// Credential rejected before a session exists (bad signature,
    /// expired, wrong role, suspended principal)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed inbound message; the connection stays open
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Command failed validation (unknown name, malformed payload)
    #[error("Validation failed for command '{command}': {reason}")]
    Validation {
        command: String,
        reason: String,
    },

    /// Command requires a verified step-up confirmation
    #[error("Command '{command}' requires step-up confirmation")]
    StepUpRequired {
        command: String,
    },

    /// A business collaborator call failed during execution
    #[error("Execution of command '{command}' failed: {reason}")]
    Execution {
        command: String,
        reason: String,
    },

    /// Audit record could not be persisted; callers must not report
    /// the guarded action as successful
    #[error("Audit persistence failed: {0}")]
    AuditPersistence(String),

    /// Activity/risk pipeline failure; best-effort telemetry,
    /// suppressed from request callers
    #[error("Activity recorder error: {0}")]
    Recorder(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session not present in the registry
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for control-plane operations
pub type Result<T> = std::result::Result<T, ControlError>;
