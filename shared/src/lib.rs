//! Emergency-trigger and store-and-forward synchronization core.
//!
//! The application shell feeds this crate user gestures, sensor samples and
//! connectivity transitions; the core decides when an emergency fires, what
//! gets queued for delivery, and how queued work is retried against an
//! unreliable network. Everything device- or network-specific is injected
//! through [`capabilities::Capabilities`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod config;
pub mod emergency;
pub mod engine;
pub mod event;
pub mod monitor;
pub mod outbox;
pub mod store;
pub mod sync;
pub mod trigger;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capabilities::{CapabilityProfile, Capabilities};
pub use config::CoreConfig;
pub use emergency::{
    ActivationOutcome, DeactivationOutcome, EmergencyRecord, EmergencyStateMachine,
    EmergencyStatus, EmergencyStatusKind, TriggerSource,
};
pub use engine::{CoreError, SafetyCore};
pub use outbox::{Endpoint, EntryId, Outbox, OutboxEntry, OutboxError};
pub use sync::{DrainReport, SyncDrainer};
pub use trigger::{PressEnd, PressHoldTrigger, PressStart, TriggerSignal};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// How a failure is handled once it reaches a component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network unreachable, remote 5xx, timeouts. Retried by the outbox.
    Transient,
    /// Remote validation errors, exhausted retries. Dead-lettered.
    Permanent,
    /// Geolocation or storage trouble on the device. Degrades, never blocks.
    LocalResource,
    /// A call that is not valid in the current state. Reported as a no-op.
    InvariantViolation,
}

impl ErrorClass {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::Permanent => "PERMANENT",
            Self::LocalResource => "LOCAL_RESOURCE",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn is_before(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl std::fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("coordinate is not finite")]
    NonFinite,
    #[error("latitude {0} out of range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} out of range [-180, 180]")]
    LongitudeOutOfRange(f64),
}

/// Validated geographic coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate", into = "RawCoordinate")]
pub struct Coordinate {
    lat: f64,
    lon: f64,
}

/// Wire shape of [`Coordinate`].
#[doc(hidden)]
#[derive(Serialize, Deserialize)]
pub struct RawCoordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(CoordinateError::LongitudeOutOfRange(lon));
        }
        Ok(Self { lat, lon })
    }

    #[must_use]
    pub const fn lat(self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn lon(self) -> f64 {
        self.lon
    }

    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        haversine_distance(self, other)
    }
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = CoordinateError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Self::new(raw.latitude, raw.longitude)
    }
}

impl From<Coordinate> for RawCoordinate {
    fn from(coord: Coordinate) -> Self {
        Self {
            latitude: coord.lat,
            longitude: coord.lon,
        }
    }
}

/// Great-circle distance in meters on a sphere of radius [`EARTH_RADIUS_M`].
#[must_use]
pub fn haversine_distance(p1: Coordinate, p2: Coordinate) -> f64 {
    const EPSILON: f64 = 1e-10;

    if (p1.lat - p2.lat).abs() < EPSILON && (p1.lon - p2.lon).abs() < EPSILON {
        return 0.0;
    }

    let lat1_rad = p1.lat.to_radians();
    let lat2_rad = p2.lat.to_radians();
    let delta_lat = (p2.lat - p1.lat).to_radians();
    let delta_lon = (p2.lon - p1.lon).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);

    let a = a.clamp(0.0, 1.0);

    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    let result = EARTH_RADIUS_M * c;

    if result.is_finite() {
        result
    } else {
        f64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod coordinate_tests {
        use super::*;

        #[test]
        fn test_valid_coordinates() {
            assert!(Coordinate::new(0.0, 0.0).is_ok());
            assert!(Coordinate::new(90.0, 180.0).is_ok());
            assert!(Coordinate::new(-90.0, -180.0).is_ok());
        }

        #[test]
        fn test_invalid_coordinates() {
            assert!(matches!(
                Coordinate::new(91.0, 0.0),
                Err(CoordinateError::LatitudeOutOfRange(_))
            ));
            assert!(matches!(
                Coordinate::new(0.0, -181.0),
                Err(CoordinateError::LongitudeOutOfRange(_))
            ));
            assert!(matches!(
                Coordinate::new(f64::NAN, 0.0),
                Err(CoordinateError::NonFinite)
            ));
        }

        #[test]
        fn test_json_shape_uses_full_field_names() {
            let coord = Coordinate::new(10.0, 20.0).unwrap();
            let json = serde_json::to_value(coord).unwrap();
            assert_eq!(json["latitude"], 10.0);
            assert_eq!(json["longitude"], 20.0);

            let bad: Result<Coordinate, _> =
                serde_json::from_str(r#"{"latitude": 100.0, "longitude": 0.0}"#);
            assert!(bad.is_err());
        }
    }

    mod distance_tests {
        use super::*;

        #[test]
        fn test_same_point_distance() {
            let p = Coordinate::new(40.0, -74.0).unwrap();
            assert!(haversine_distance(p, p).abs() < f64::EPSILON);
        }

        #[test]
        fn test_one_degree_of_longitude_at_equator() {
            let a = Coordinate::new(0.0, 0.0).unwrap();
            let b = Coordinate::new(0.0, 1.0).unwrap();
            let d = haversine_distance(a, b);
            assert!((d - 111_195.0).abs() < 111_195.0 * 0.01, "got {d}");
        }

        #[test]
        fn test_distance_is_symmetric() {
            let a = Coordinate::new(51.5074, -0.1278).unwrap();
            let b = Coordinate::new(48.8566, 2.3522).unwrap();
            let ab = a.distance_to(b);
            let ba = b.distance_to(a);
            assert!((ab - ba).abs() < 1e-6);
            assert!((ab - 343_500.0).abs() < 2_000.0, "got {ab}");
        }
    }

    #[test]
    fn test_error_class_retryable() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::Permanent.is_retryable());
        assert!(!ErrorClass::LocalResource.is_retryable());
        assert!(!ErrorClass::InvariantViolation.is_retryable());
    }
}
