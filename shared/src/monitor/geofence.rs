use geojson::{feature::Id, GeoJson};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{MonitorEvent, ThresholdMonitorState, Transition};
use crate::capabilities::{FeedbackSink, KeyNamespace, KeyValueStore, KvKey, Position};
use crate::emergency::EmergencyStatus;
use crate::outbox::{Endpoint, Outbox};
use crate::store;
use crate::{Coordinate, ErrorClass};

const ZONE_CACHE_KEY: &str = "cache";
const DEFAULT_RADIUS_M: f64 = 100.0;

fn default_active() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SafeZone {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub center: Coordinate,
    pub radius_m: f64,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl SafeZone {
    #[must_use]
    pub fn contains(&self, point: Coordinate) -> bool {
        self.center.distance_to(point) <= self.radius_m
    }

    fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Error)]
pub enum GeofenceError {
    #[error("invalid GeoJSON: {0}")]
    Parse(String),

    #[error("feature {index}: {reason}")]
    InvalidZone { index: usize, reason: String },
}

impl GeofenceError {
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        ErrorClass::InvariantViolation
    }
}

/// Parse a FeatureCollection of Point features into zones.
///
/// Recognised properties: `id` (falls back to the feature id), `name`,
/// `radius` or `radius_m` in meters, and `active`.
pub fn parse_zones_geojson(input: &str) -> Result<Vec<SafeZone>, GeofenceError> {
    let parsed: GeoJson = input
        .parse()
        .map_err(|e: geojson::Error| GeofenceError::Parse(e.to_string()))?;
    let GeoJson::FeatureCollection(collection) = parsed else {
        return Err(GeofenceError::Parse("expected a FeatureCollection".into()));
    };

    let mut zones = Vec::with_capacity(collection.features.len());
    for (index, feature) in collection.features.iter().enumerate() {
        let invalid = |reason: &str| GeofenceError::InvalidZone {
            index,
            reason: reason.to_string(),
        };

        let Some(geometry) = &feature.geometry else {
            return Err(invalid("missing geometry"));
        };
        let geojson::Value::Point(point) = &geometry.value else {
            return Err(invalid("geometry is not a Point"));
        };
        let (Some(&lon), Some(&lat)) = (point.first(), point.get(1)) else {
            return Err(invalid("point needs longitude and latitude"));
        };
        let center = Coordinate::new(lat, lon).map_err(|e| invalid(&e.to_string()))?;

        let property = |name: &str| feature.property(name);
        let id = property("id")
            .and_then(|v| v.as_str().map(str::to_string))
            .or_else(|| match &feature.id {
                Some(Id::String(s)) => Some(s.clone()),
                Some(Id::Number(n)) => Some(n.to_string()),
                None => None,
            })
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| invalid("zone has no id"))?;
        let name = property("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let radius_m = property("radius_m")
            .or_else(|| property("radius"))
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(DEFAULT_RADIUS_M);
        if !(radius_m.is_finite() && radius_m > 0.0) {
            return Err(invalid("radius must be positive"));
        }
        let active = property("active")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);

        zones.push(SafeZone {
            id,
            name,
            center,
            radius_m,
            active,
        });
    }
    Ok(zones)
}

/// Tracks which safe zone, if any, the device is in.
///
/// At most one zone is current. Moving straight from one zone into another
/// reports the exit before the entry.
pub struct GeofenceMonitor {
    zones: Vec<SafeZone>,
    state: ThresholdMonitorState,
    outbox: Arc<Outbox>,
    feedback: Arc<dyn FeedbackSink>,
    emergency: watch::Receiver<EmergencyStatus>,
    storage: Arc<dyn KeyValueStore>,
    cache_key: KvKey,
}

impl std::fmt::Debug for GeofenceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeofenceMonitor")
            .field("zones", &self.zones.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl GeofenceMonitor {
    /// Start with `zones`, or with the cached set when `zones` is empty.
    pub async fn load(
        zones: Vec<SafeZone>,
        outbox: Arc<Outbox>,
        feedback: Arc<dyn FeedbackSink>,
        emergency: watch::Receiver<EmergencyStatus>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        let mut monitor = Self {
            zones: Vec::new(),
            state: ThresholdMonitorState::default(),
            outbox,
            feedback,
            emergency,
            storage,
            cache_key: KvKey::fixed(KeyNamespace::Zones, ZONE_CACHE_KEY),
        };

        if zones.is_empty() {
            monitor.zones = monitor.read_cache().await;
            info!(zones = monitor.zones.len(), "safe zones loaded from cache");
        } else {
            monitor.set_zones(zones).await;
        }
        monitor
    }

    pub fn zones(&self) -> &[SafeZone] {
        &self.zones
    }

    pub fn current_zone(&self) -> Option<&str> {
        self.state.current_region.as_deref()
    }

    /// Replace the zone set and cache it for offline use. If the current
    /// zone disappears or is deactivated, it stops being current without an
    /// exit report.
    pub async fn set_zones(&mut self, zones: Vec<SafeZone>) {
        self.zones = zones;
        if let Some(current) = &self.state.current_region {
            if !self.zones.iter().any(|z| z.active && &z.id == current) {
                debug!(zone_id = %current, "current zone removed");
                self.state.current_region = None;
                self.state.notified_for_current_excursion = false;
            }
        }

        match store::seal(&self.zones) {
            Ok(bytes) => {
                if let Err(e) = self.storage.set(&self.cache_key, bytes).await {
                    warn!(error = %e, "failed to cache safe zones");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode safe zones"),
        }
    }

    #[instrument(skip(self, position), fields(lat = position.coordinate.lat(), lon = position.coordinate.lon()))]
    pub async fn sample(&mut self, position: Position) -> Vec<MonitorEvent> {
        let point = position.coordinate;

        let nearest = self
            .zones
            .iter()
            .filter(|z| z.active)
            .map(|z| (z, z.center.distance_to(point)))
            .min_by(|a, b| a.1.total_cmp(&b.1));
        self.state.last_known_value = nearest.map(|(_, d)| d);

        let inside = nearest
            .filter(|(z, d)| *d <= z.radius_m)
            .map(|(z, _)| z.clone());

        let mut events = Vec::new();
        let current = self.state.current_region.clone();

        if let Some(current_id) = current.as_deref() {
            if inside.as_ref().map(|z| z.id.as_str()) != Some(current_id) {
                let zone = self.zones.iter().find(|z| z.id == current_id).cloned();
                self.state.current_region = None;
                self.state.notified_for_current_excursion = false;
                if let Some(zone) = zone {
                    events.push(self.report(&zone, Transition::Exited, &position).await);
                }
            }
        }

        if let Some(zone) = inside {
            if self.state.current_region.as_deref() != Some(zone.id.as_str()) {
                self.state.current_region = Some(zone.id.clone());
                self.state.notified_for_current_excursion = true;
                events.push(self.report(&zone, Transition::Entered, &position).await);
            }
        }

        events
    }

    async fn report(
        &self,
        zone: &SafeZone,
        transition: Transition,
        position: &Position,
    ) -> MonitorEvent {
        let (verb, label) = match transition {
            Transition::Entered => ("entry", "Entered safe zone"),
            Transition::Exited => ("exit", "Left safe zone"),
        };
        info!(zone_id = %zone.id, transition = verb, "safe zone transition");
        self.feedback.notify(label, zone.display_name());

        let payload = json!({
            "zoneId": zone.id,
            "zoneName": zone.name,
            "transition": verb,
            "latitude": position.coordinate.lat(),
            "longitude": position.coordinate.lon(),
            "timestamp": position.timestamp,
            "emergencyActive": self.emergency.borrow().is_active(),
        });
        if let Err(e) = self.outbox.enqueue(Endpoint::ZoneTransition, payload).await {
            warn!(error = %e, "failed to queue zone transition");
        }

        MonitorEvent::Zone {
            zone_id: zone.id.clone(),
            zone_name: zone.name.clone(),
            transition,
        }
    }

    async fn read_cache(&self) -> Vec<SafeZone> {
        match self.storage.get(&self.cache_key).await {
            Ok(Some(bytes)) => store::open(&bytes).unwrap_or_else(|e| {
                warn!(error = %e, "discarding unreadable zone cache");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "zone cache unavailable");
                Vec::new()
            }
        }
    }
}
