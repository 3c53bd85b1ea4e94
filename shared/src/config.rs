use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::monitor::geofence::SafeZone;
use crate::outbox::MAX_PAYLOAD_BYTES;

const MAX_OUTBOX_ENTRIES: usize = 10_000;
const MAX_DEAD_LETTERS: usize = 1_000;
/// Leaves room in a 16 MiB snapshot for entry metadata and dead letters.
const MAX_QUEUE_BYTES: usize = 8 * 1024 * 1024;
const MAX_KEYWORD_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Top-level configuration handed to [`crate::SafetyCore::start`].
///
/// Every section falls back to its defaults, so `{}` is a valid document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub trigger: TriggerConfig,
    pub emergency: EmergencyConfig,
    pub outbox: OutboxConfig,
    pub sync: SyncConfig,
    pub battery: BatteryConfig,
    pub geofence: GeofenceConfig,
    pub voice: VoiceConfig,
}

impl CoreConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.trigger.validate()?;
        self.emergency.validate()?;
        self.outbox.validate()?;
        self.sync.validate()?;
        self.battery.validate()?;
        self.geofence.validate()?;
        self.voice.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TriggerConfig {
    pub hold_duration_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            hold_duration_ms: 1_000,
        }
    }
}

impl TriggerConfig {
    #[must_use]
    pub fn hold_duration(&self) -> Duration {
        Duration::from_millis(self.hold_duration_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hold_duration_ms == 0 {
            return Err(invalid("trigger.hold_duration_ms", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmergencyConfig {
    /// Upper bound on location acquisition during activation.
    pub location_timeout_ms: u64,
    /// Optional message forwarded to contacts with the alert.
    pub message: Option<String>,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            location_timeout_ms: 10_000,
            message: None,
        }
    }
}

impl EmergencyConfig {
    #[must_use]
    pub fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.location_timeout_ms == 0 {
            return Err(invalid("emergency.location_timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutboxConfig {
    /// Failed attempts after which an entry is dead-lettered.
    pub max_retries: u32,
    pub max_entries: usize,
    /// Dead letters retained; the oldest reported ones go first.
    pub max_dead_letters: usize,
    /// Serialized payload bytes the active queue may hold.
    pub max_queue_bytes: usize,
    /// Capped exponential backoff between attempts. `None` retries on the
    /// next drain trigger.
    pub backoff: Option<BackoffConfig>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_entries: MAX_OUTBOX_ENTRIES,
            max_dead_letters: 100,
            max_queue_bytes: MAX_QUEUE_BYTES,
            backoff: None,
        }
    }
}

impl OutboxConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(invalid("outbox.max_retries", "must be > 0"));
        }
        if self.max_entries == 0 || self.max_entries > MAX_OUTBOX_ENTRIES {
            return Err(invalid("outbox.max_entries", "must be in 1..=10000"));
        }
        if self.max_dead_letters > MAX_DEAD_LETTERS {
            return Err(invalid("outbox.max_dead_letters", "must be <= 1000"));
        }
        if self.max_queue_bytes < MAX_PAYLOAD_BYTES || self.max_queue_bytes > MAX_QUEUE_BYTES {
            return Err(invalid(
                "outbox.max_queue_bytes",
                "must hold one payload and fit the snapshot limit",
            ));
        }
        if let Some(backoff) = &self.backoff {
            backoff.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
            jitter_ms: 1_000,
        }
    }
}

impl BackoffConfig {
    /// Delay before the next attempt after `retry_count` failures.
    #[must_use]
    pub fn delay_ms(&self, retry_count: u32, jitter_ms: u64) -> u64 {
        let exponent = retry_count.saturating_sub(1).min(16);
        let exponential = self.base_ms.saturating_mul(1u64 << exponent);
        exponential.min(self.max_ms).saturating_add(jitter_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_ms == 0 {
            return Err(invalid("outbox.backoff.base_ms", "must be > 0"));
        }
        if self.max_ms < self.base_ms {
            return Err(invalid("outbox.backoff.max_ms", "must be >= base_ms"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Fallback poll while online.
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 15_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(invalid("sync.poll_interval_ms", "must be > 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("sync.request_timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatteryConfig {
    pub poll_interval_ms: u64,
    pub low_threshold_percent: f64,
    pub critical_threshold_percent: f64,
    /// Queue every polled reading to the battery log.
    pub log_readings: bool,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5 * 60 * 1_000,
            low_threshold_percent: 20.0,
            critical_threshold_percent: 10.0,
            log_readings: true,
        }
    }
}

impl BatteryConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(invalid("battery.poll_interval_ms", "must be > 0"));
        }
        if !(self.low_threshold_percent > 0.0 && self.low_threshold_percent < 100.0) {
            return Err(invalid(
                "battery.low_threshold_percent",
                "must be between 0 and 100",
            ));
        }
        if !(self.critical_threshold_percent > 0.0
            && self.critical_threshold_percent < self.low_threshold_percent)
        {
            return Err(invalid(
                "battery.critical_threshold_percent",
                "must be > 0 and below the low threshold",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeofenceConfig {
    /// Zones known at startup. When empty, the last cached set is used.
    pub zones: Vec<SafeZone>,
}

impl GeofenceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for zone in &self.zones {
            if zone.id.trim().is_empty() {
                return Err(invalid("geofence.zones", "zone id cannot be empty"));
            }
            if !(zone.radius_m.is_finite() && zone.radius_m > 0.0) {
                return Err(invalid(
                    "geofence.zones",
                    format!("zone `{}` has a non-positive radius", zone.id),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VoiceConfig {
    pub keywords: Vec<String>,
    /// How long a keyword match waits for a yes or no.
    pub confirmation_timeout_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            keywords: [
                "help",
                "emergency",
                "sos",
                "danger",
                "police",
                "ambulance",
                "fire",
                "medical",
                "accident",
                "attack",
            ]
            .iter()
            .map(|k| (*k).to_string())
            .collect(),
            confirmation_timeout_ms: 10_000,
        }
    }
}

impl VoiceConfig {
    #[must_use]
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(invalid("voice.keywords", "needs at least one non-blank keyword"));
        }
        if self.keywords.iter().any(|k| k.len() > MAX_KEYWORD_LEN) {
            return Err(invalid("voice.keywords", "keyword longer than 64 bytes"));
        }
        if self.confirmation_timeout_ms == 0 {
            return Err(invalid("voice.confirmation_timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}
