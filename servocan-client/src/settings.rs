//! Client tuning parameters
//!
//! ```toml
//! sdo_timeout_ms = 500
//! poll_interval_ms = 20
//! read_retries = 3
//! ```
use std::{path::Path, time::Duration};

use serde::Deserialize;
use snafu::ResultExt;

use crate::{
    lss_master::{DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SCAN_TIMEOUT},
    node_configuration::{ConfigError, IoSnafu, TomlDeserializationSnafu},
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timeouts and retry limits used by the drive engine
///
/// Every field has a default, so a settings file only lists what it changes.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ClientSettings {
    /// Default deadline of one SDO transaction
    pub sdo_timeout_ms: u64,
    /// Deadline for reaching each intermediate state of a state transition
    pub state_transition_timeout_ms: u64,
    /// Deadline for the drive to confirm a mode of operation change
    pub mode_confirm_timeout_ms: u64,
    /// Statusword polling interval, clamped to 10..=50 ms
    pub poll_interval_ms: u64,
    /// A PDO statusword older than this is not used, and the statusword is read over SDO
    pub pdo_max_age_ms: u64,
    /// Deadline for the set-point acknowledge of a profile position move
    pub setpoint_ack_timeout_ms: u64,
    /// Homing attained or homing error is only accepted after this long, unless the drive was
    /// first seen homing
    pub homing_settle_ms: u64,
    /// Number of times an idempotent read is retried after an SDO timeout
    pub read_retries: u32,
    /// Deadline for an LSS slave answer
    pub lss_response_timeout_ms: u64,
    /// Wait after each LSS fast scan step
    pub lss_scan_timeout_ms: u64,
    /// Wait after an NMT reset before talking to the nodes again
    pub lss_reset_delay_ms: u64,
    /// Deadline for the boot-up message after an NMT reset
    pub bootup_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            sdo_timeout_ms: 1000,
            state_transition_timeout_ms: 15000,
            mode_confirm_timeout_ms: 1000,
            poll_interval_ms: 10,
            pdo_max_age_ms: 100,
            setpoint_ack_timeout_ms: 1000,
            homing_settle_ms: 500,
            read_retries: 2,
            lss_response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            lss_scan_timeout_ms: DEFAULT_SCAN_TIMEOUT.as_millis() as u64,
            lss_reset_delay_ms: 1000,
            bootup_timeout_ms: 3000,
        }
    }
}

impl ClientSettings {
    /// Read settings from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read settings from a TOML string
    pub fn load_from_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).context(TomlDeserializationSnafu)
    }

    #[allow(missing_docs)]
    pub fn sdo_timeout(&self) -> Duration {
        Duration::from_millis(self.sdo_timeout_ms)
    }

    #[allow(missing_docs)]
    pub fn state_transition_timeout(&self) -> Duration {
        Duration::from_millis(self.state_transition_timeout_ms)
    }

    #[allow(missing_docs)]
    pub fn mode_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.mode_confirm_timeout_ms)
    }

    /// The polling interval, bounded to keep polling from flooding the bus
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
    }

    #[allow(missing_docs)]
    pub fn pdo_max_age(&self) -> Duration {
        Duration::from_millis(self.pdo_max_age_ms)
    }

    #[allow(missing_docs)]
    pub fn setpoint_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.setpoint_ack_timeout_ms)
    }

    #[allow(missing_docs)]
    pub fn homing_settle(&self) -> Duration {
        Duration::from_millis(self.homing_settle_ms)
    }

    #[allow(missing_docs)]
    pub fn lss_response_timeout(&self) -> Duration {
        Duration::from_millis(self.lss_response_timeout_ms)
    }

    #[allow(missing_docs)]
    pub fn lss_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.lss_scan_timeout_ms)
    }

    #[allow(missing_docs)]
    pub fn lss_reset_delay(&self) -> Duration {
        Duration::from_millis(self.lss_reset_delay_ms)
    }

    #[allow(missing_docs)]
    pub fn bootup_timeout(&self) -> Duration {
        Duration::from_millis(self.bootup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings() {
        let settings = ClientSettings::load_from_str(
            r#"
            sdo_timeout_ms = 250
            read_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(Duration::from_millis(250), settings.sdo_timeout());
        assert_eq!(5, settings.read_retries);
        assert_eq!(
            ClientSettings::default().state_transition_timeout_ms,
            settings.state_transition_timeout_ms
        );
    }

    #[test]
    fn test_poll_interval_clamped() {
        let mut settings = ClientSettings {
            poll_interval_ms: 1,
            ..Default::default()
        };
        assert_eq!(Duration::from_millis(10), settings.poll_interval());
        settings.poll_interval_ms = 500;
        assert_eq!(Duration::from_millis(50), settings.poll_interval());
    }

    #[test]
    fn test_lss_defaults_match_master() {
        let settings = ClientSettings::default();
        assert_eq!(DEFAULT_RESPONSE_TIMEOUT, settings.lss_response_timeout());
        assert_eq!(DEFAULT_SCAN_TIMEOUT, settings.lss_scan_timeout());
        assert_eq!(Duration::from_millis(500), settings.homing_settle());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ClientSettings::load_from_str("sdo_timeout = 5").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }
}
