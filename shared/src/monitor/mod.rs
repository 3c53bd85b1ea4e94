//! Periodic samplers that report threshold crossings, not raw samples.

pub mod battery;
pub mod geofence;

use serde::{Deserialize, Serialize};

pub use battery::{BatteryMonitor, BatteryTier};
pub use geofence::{parse_zones_geojson, GeofenceError, GeofenceMonitor, SafeZone};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Entered,
    Exited,
}

/// Excursion bookkeeping for one monitored quantity.
///
/// A crossing into the abnormal side is reported once; staying there is
/// silent until the value returns to normal, which is reported once too.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdMonitorState {
    pub last_known_value: Option<f64>,
    /// Geofence only: the zone currently occupied.
    pub current_region: Option<String>,
    pub notified_for_current_excursion: bool,
}

impl ThresholdMonitorState {
    pub fn observe(&mut self, value: f64, abnormal: bool) -> Option<Transition> {
        self.last_known_value = Some(value);
        match (abnormal, self.notified_for_current_excursion) {
            (true, false) => {
                self.notified_for_current_excursion = true;
                Some(Transition::Entered)
            }
            (false, true) => {
                self.notified_for_current_excursion = false;
                Some(Transition::Exited)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn in_excursion(&self) -> bool {
        self.notified_for_current_excursion
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorEvent {
    Battery {
        tier: BatteryTier,
        transition: Transition,
        level_percent: f64,
    },
    Zone {
        zone_id: String,
        zone_name: String,
        transition: Transition,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_each_edge_once() {
        let mut state = ThresholdMonitorState::default();
        assert_eq!(state.observe(50.0, false), None);
        assert_eq!(state.observe(9.0, true), Some(Transition::Entered));
        assert_eq!(state.observe(8.0, true), None);
        assert_eq!(state.observe(7.0, true), None);
        assert_eq!(state.observe(30.0, false), Some(Transition::Exited));
        assert_eq!(state.observe(31.0, false), None);
        assert_eq!(state.observe(5.0, true), Some(Transition::Entered));
        assert_eq!(state.last_known_value, Some(5.0));
    }
}
