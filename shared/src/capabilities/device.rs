use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ErrorClass;

/// Three heavy pulses, as played when an emergency is armed.
pub const EMERGENCY_HAPTIC_PATTERN: [u64; 5] = [200, 200, 200, 200, 200];
/// Single short pulse acknowledging a press.
pub const ACKNOWLEDGE_HAPTIC_PATTERN: [u64; 1] = [80];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundCue {
    /// Looping alarm while an emergency is active.
    Emergency,
    Notification,
    Success,
}

/// Local notification, haptic and sound output.
///
/// Fire-and-forget: the core never depends on these succeeding.
pub trait FeedbackSink: Send + Sync {
    fn notify(&self, title: &str, body: &str);
    fn vibrate(&self, pattern: &[u64]);
    fn play_sound(&self, cue: SoundCue);
    fn stop_sound(&self, cue: SoundCue);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryReading {
    /// 0.0 ..= 100.0
    pub level_percent: f64,
    pub charging: bool,
}

impl BatteryReading {
    #[must_use]
    pub fn new(level_percent: f64, charging: bool) -> Self {
        Self {
            level_percent: if level_percent.is_finite() {
                level_percent.clamp(0.0, 100.0)
            } else {
                100.0
            },
            charging,
        }
    }

    /// Build from a platform fraction (`0.0 ..= 1.0`), treating a missing
    /// value as full and not charging.
    #[must_use]
    pub fn from_fraction(fraction: Option<f64>, charging: Option<bool>) -> Self {
        Self::new(fraction.unwrap_or(1.0) * 100.0, charging.unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device API unavailable: {0}")]
    Unavailable(String),
}

impl DeviceError {
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        ErrorClass::LocalResource
    }
}

#[async_trait]
pub trait BatteryProvider: Send + Sync {
    async fn read(&self) -> Result<BatteryReading, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_platform_values_read_as_full() {
        let reading = BatteryReading::from_fraction(None, None);
        assert!((reading.level_percent - 100.0).abs() < f64::EPSILON);
        assert!(!reading.charging);
    }

    #[test]
    fn out_of_range_levels_are_clamped() {
        assert!((BatteryReading::new(140.0, false).level_percent - 100.0).abs() < f64::EPSILON);
        assert!(BatteryReading::new(-3.0, true).level_percent.abs() < f64::EPSILON);
        assert!((BatteryReading::new(f64::NAN, false).level_percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fraction_is_scaled_to_percent() {
        let reading = BatteryReading::from_fraction(Some(0.08), Some(false));
        assert!((reading.level_percent - 8.0).abs() < 1e-9);
    }
}
