//! Device and network interfaces the core consumes.
//!
//! The shell picks a [`CapabilityProfile`] once at startup and hands the core a
//! [`Capabilities`] bundle; nothing in the core inspects the platform after
//! that.

mod device;
mod http;
mod kv;
mod location;
mod network;
pub mod testing;

use std::sync::Arc;

pub use self::device::{
    BatteryProvider, BatteryReading, DeviceError, FeedbackSink, SoundCue, ACKNOWLEDGE_HAPTIC_PATTERN,
    EMERGENCY_HAPTIC_PATTERN,
};
pub use self::http::{ApiError, ApiResponse, ApiRoutes, RemoteApi};
pub use self::kv::{KeyNamespace, KeyValueStore, KvError, KvKey, MemoryKvStore};
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;
pub use self::location::{GeolocationProvider, LocationError, Position, WatchHandle};
pub use self::network::{ConnectivityObserver, ConnectivityState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityProfile {
    /// iOS/Android shell with haptics and a battery API.
    Native,
    /// Web shell: no haptics, no battery API.
    Browser,
    /// In-process fakes, see [`testing`].
    Test,
}

impl CapabilityProfile {
    #[must_use]
    pub const fn supports_haptics(self) -> bool {
        matches!(self, Self::Native | Self::Test)
    }

    #[must_use]
    pub const fn supports_battery(self) -> bool {
        matches!(self, Self::Native | Self::Test)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Browser => "browser",
            Self::Test => "test",
        }
    }
}

#[derive(Clone)]
pub struct Capabilities {
    pub profile: CapabilityProfile,
    pub geolocation: Arc<dyn GeolocationProvider>,
    pub remote: Arc<dyn RemoteApi>,
    pub storage: Arc<dyn KeyValueStore>,
    pub connectivity: Arc<dyn ConnectivityObserver>,
    pub feedback: Arc<dyn FeedbackSink>,
    pub battery: Option<Arc<dyn BatteryProvider>>,
}

impl Capabilities {
    pub fn native(
        geolocation: Arc<dyn GeolocationProvider>,
        remote: Arc<dyn RemoteApi>,
        storage: Arc<dyn KeyValueStore>,
        connectivity: Arc<dyn ConnectivityObserver>,
        feedback: Arc<dyn FeedbackSink>,
        battery: Arc<dyn BatteryProvider>,
    ) -> Self {
        Self {
            profile: CapabilityProfile::Native,
            geolocation,
            remote,
            storage,
            connectivity,
            feedback,
            battery: Some(battery),
        }
    }

    pub fn browser(
        geolocation: Arc<dyn GeolocationProvider>,
        remote: Arc<dyn RemoteApi>,
        storage: Arc<dyn KeyValueStore>,
        connectivity: Arc<dyn ConnectivityObserver>,
        feedback: Arc<dyn FeedbackSink>,
    ) -> Self {
        Self {
            profile: CapabilityProfile::Browser,
            geolocation,
            remote,
            storage,
            connectivity,
            feedback,
            battery: None,
        }
    }

    /// Battery provider, if this profile has one.
    #[must_use]
    pub fn battery(&self) -> Option<Arc<dyn BatteryProvider>> {
        if self.profile.supports_battery() {
            self.battery.clone()
        } else {
            None
        }
    }

    /// Haptic pattern playback, dropped silently where unsupported.
    pub fn vibrate(&self, pattern: &[u64]) {
        if self.profile.supports_haptics() {
            self.feedback.vibrate(pattern);
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("profile", &self.profile)
            .field("battery", &self.battery.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{FeedbackCall, TestHarness};

    #[test]
    fn browser_profile_drops_haptics_and_battery() {
        let harness = TestHarness::new();
        let mut caps = harness.capabilities();
        caps.profile = CapabilityProfile::Browser;

        caps.vibrate(&EMERGENCY_HAPTIC_PATTERN);
        assert!(caps.battery().is_none());
        assert!(harness.feedback.calls().is_empty());
    }

    #[test]
    fn test_profile_forwards_haptics() {
        let harness = TestHarness::new();
        let caps = harness.capabilities();

        caps.vibrate(&ACKNOWLEDGE_HAPTIC_PATTERN);
        assert!(caps.battery().is_some());
        assert_eq!(
            harness.feedback.calls(),
            vec![FeedbackCall::Vibrate(ACKNOWLEDGE_HAPTIC_PATTERN.to_vec())]
        );
    }
}
