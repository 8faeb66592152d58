//! Control-plane configuration
//!
//! All sections deserialize with `#[serde(default)]` so a partial
//! config file (or none at all) yields working defaults. Risk weights
//! and thresholds are deliberately configuration, not constants:
//! operators tune them without a rebuild.

use serde::{Deserialize, Serialize};

/// Top-level control-plane configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Connection registry configuration
    pub registry: RegistryConfig,

    /// Liveness monitor configuration
    pub liveness: LivenessConfig,

    /// Command dispatch configuration
    pub commands: CommandConfig,

    /// Activity recording and risk scoring configuration
    pub risk: RiskConfig,
}

/// Connection registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Per-session outbound channel capacity. A session whose buffer
    /// is full when a message arrives is treated as unresponsive and
    /// evicted rather than allowed to stall fan-out.
    pub outbound_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 256,
        }
    }
}

/// Liveness monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Seconds between sweep runs
    pub sweep_interval_secs: u64,

    /// Heartbeat age in seconds after which a session is evicted
    pub heartbeat_timeout_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            heartbeat_timeout_secs: 60,
        }
    }
}

/// Command dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Command names that require a verified step-up confirmation
    /// code before executing. Every name listed here must have a
    /// registered handler at startup.
    pub step_up_actions: Vec<String>,

    /// Maximum number of cached command outcomes kept for
    /// correlation-id deduplication.
    pub dedup_cache_size: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            step_up_actions: vec![
                "ban_user".to_string(),
                "unban_user".to_string(),
                "override_order".to_string(),
                "refund_order".to_string(),
                "toggle_maintenance".to_string(),
                "emergency_shutdown".to_string(),
            ],
            dedup_cache_size: 1024,
        }
    }
}

/// Risk scoring and activity recording configuration
///
/// The scoring mechanism (additive weights, capped at 100) is fixed;
/// the concrete numbers are policy and therefore live here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Action names considered sensitive for scoring purposes
    pub sensitive_actions: Vec<String>,

    /// Weight added when the action name is in `sensitive_actions`
    pub sensitive_weight: u8,

    /// Weight added when the principal's request count within the
    /// sliding window exceeds `burst_threshold`
    pub burst_weight: u8,

    /// Request count within the window that counts as a burst
    pub burst_threshold: usize,

    /// Sliding window length in seconds for burst detection
    pub window_secs: u64,

    /// Weight added for requests inside the off-hours window
    pub off_hours_weight: u8,

    /// Start of the off-hours window (UTC hour, inclusive)
    pub off_hours_start: u32,

    /// End of the off-hours window (UTC hour, exclusive)
    pub off_hours_end: u32,

    /// Scores strictly above this are flagged suspicious
    pub suspicion_threshold: u8,

    /// Capacity of the background recording queue
    pub queue_capacity: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            sensitive_actions: vec![
                "ban_user".to_string(),
                "unban_user".to_string(),
                "force_logout".to_string(),
                "override_order".to_string(),
                "refund_order".to_string(),
                "toggle_maintenance".to_string(),
                "emergency_shutdown".to_string(),
            ],
            sensitive_weight: 30,
            burst_weight: 40,
            burst_threshold: 30,
            window_secs: 60,
            off_hours_weight: 20,
            off_hours_start: 0,
            off_hours_end: 6,
            suspicion_threshold: 50,
            queue_capacity: 1024,
        }
    }
}
