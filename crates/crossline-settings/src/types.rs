//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file only needs the keys it changes.

use crossline_core::PeerRole;
use crossline_core::constants::{DEFAULT_HISTORY_LIMIT, MAX_LOCK_DURATION_SECS};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "identity": { "systemId": "utcs-01", "role": "lower" },
///   "server": { "port": 7001 },
///   "control": { "historyLimit": 50 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrosslineSettings {
    /// Local and peer system identity.
    pub identity: IdentitySettings,
    /// Listener / connector network settings.
    pub server: ServerSettings,
    /// Request/response session behaviour.
    pub session: SessionSettings,
    /// Control-mode and flow-lock rules.
    pub control: ControlSettings,
    /// Push fan-out.
    pub push: PushSettings,
    /// Retransmission task housekeeping.
    pub retrans: RetransSettings,
    /// Accepted auth tokens for the built-in validator.
    pub auth: AuthSettings,
    /// Logging output.
    pub logging: LoggingSettings,
}

impl CrosslineSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.identity.system_id.trim().is_empty() {
            return Err(SettingsError::Invalid {
                key: "identity.systemId",
                reason: "must not be empty",
            });
        }
        if self.control.history_limit == 0 {
            return Err(SettingsError::Invalid {
                key: "control.historyLimit",
                reason: "must be positive",
            });
        }
        if self.control.sentinel_plan_ceiling > 0 {
            return Err(SettingsError::Invalid {
                key: "control.sentinelPlanCeiling",
                reason: "must not be positive",
            });
        }
        if self.push.worker_concurrency == 0 {
            return Err(SettingsError::Invalid {
                key: "push.workerConcurrency",
                reason: "must be positive",
            });
        }
        if self.server.max_frame_bytes < 1024 {
            return Err(SettingsError::Invalid {
                key: "server.maxFrameBytes",
                reason: "must be at least 1024",
            });
        }
        Ok(())
    }
}

/// Local and peer identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentitySettings {
    /// Local system id written into every outbound message.
    pub system_id: String,
    /// Expected peer system id (used by the connector).
    pub peer_system_id: String,
    /// Which end of the link this process plays.
    pub role: PeerRole,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            system_id: "utcs".to_string(),
            peer_system_id: "tica".to_string(),
            role: PeerRole::Lower,
        }
    }
}

/// Network settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Maximum concurrent peer connections.
    pub max_connections: usize,
    /// Largest accepted frame payload in bytes.
    pub max_frame_bytes: usize,
    /// Per-frame write timeout in milliseconds.
    pub write_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7001,
            max_connections: 32,
            max_frame_bytes: 4 * 1024 * 1024,
            write_timeout_ms: 5_000,
        }
    }
}

/// Session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Default `sendRequest` timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Heartbeat interval for the connector in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}

/// Control-mode and flow-lock rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlSettings {
    /// Mode history entries kept per cross.
    pub history_limit: usize,
    /// Plan numbers at or below this value are ad-hoc / temporary /
    /// center-plan sentinels accepted without a plan lookup.
    pub sentinel_plan_ceiling: i32,
    /// Longest accepted flow-lock duration in seconds.
    pub max_lock_duration_secs: u32,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            sentinel_plan_ceiling: -1,
            max_lock_duration_secs: MAX_LOCK_DURATION_SECS,
        }
    }
}

/// Push fan-out settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PushSettings {
    /// Maximum publications running concurrently on the worker pool.
    pub worker_concurrency: usize,
    /// Per-recipient delivery timeout in milliseconds.
    pub delivery_timeout_ms: u64,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            worker_concurrency: 16,
            delivery_timeout_ms: 5_000,
        }
    }
}

/// Retransmission housekeeping.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetransSettings {
    /// Days a terminal task's metadata is kept.
    pub keep_days: u32,
    /// Interval between cleanup sweeps in seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for RetransSettings {
    fn default() -> Self {
        Self {
            keep_days: 7,
            cleanup_interval_secs: 3_600,
        }
    }
}

/// One accepted token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEntry {
    /// Token value presented by the peer.
    pub token: String,
    /// Identity the token maps to.
    pub identity: String,
}

/// Auth settings for the built-in token validator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Accepted tokens.
    pub tokens: Vec<TokenEntry>,
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`trace`..`error`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
