//! Session manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bound on a pairing handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 120;

/// Default bound on restoring one session.
pub const DEFAULT_RESTORE_TIMEOUT_SECS: u64 = 120;

/// Lower bound of the broadcast pacing window.
pub const DEFAULT_MIN_DELAY_MS: u64 = 30_000;

/// Upper bound (exclusive) of the broadcast pacing window.
pub const DEFAULT_MAX_DELAY_MS: u64 = 90_000;

/// Session manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Seconds to wait for the first pairing code (or readiness).
    pub handshake_timeout_secs: u64,
    /// Seconds to wait for a restored session to settle.
    pub restore_timeout_secs: u64,
    /// Delay between consecutive broadcast recipients.
    pub pacing: PacingConfig,
    /// Label of the timestamp footer appended to broadcast messages.
    pub timestamp_footer_label: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            restore_timeout_secs: DEFAULT_RESTORE_TIMEOUT_SECS,
            pacing: PacingConfig::default(),
            timestamp_footer_label: "SENT ON".to_string(),
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    #[must_use]
    pub const fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }
}

/// Broadcast pacing window in milliseconds, `[min_delay_ms, max_delay_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}
