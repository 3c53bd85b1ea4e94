//! Composition root.
//!
//! [`SafetyCore`] wires the state machine, outbox, drainer, triggers and
//! monitors over one [`Capabilities`] bundle and exposes the surface the
//! application shell talks to. Connectivity, positions and timers reach the
//! components only through the serialized event queue.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{BatteryProvider, Capabilities};
use crate::config::{ConfigError, CoreConfig};
use crate::emergency::{
    DeactivationOutcome, EmergencyError, EmergencyRecord, EmergencyStateMachine, EmergencyStatus,
};
use crate::event::{CoreEvent, EventError, EventQueue, Subscription, EVENT_QUEUE_CAPACITY};
use crate::monitor::{
    parse_zones_geojson, BatteryMonitor, GeofenceError, GeofenceMonitor, MonitorEvent, SafeZone,
};
use crate::outbox::{DeadLetter, MetricsSnapshot, Outbox, OutboxEntry, OutboxError};
use crate::sync::{DrainReport, DrainSkipped, SyncDrainer};
use crate::trigger::{KeywordTrigger, PressEnd, PressHoldTrigger, PressStart, TriggerSignal, VoiceOutcome};
use crate::ErrorClass;

const MONITOR_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Emergency(#[from] EmergencyError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Geofence(#[from] GeofenceError),
}

impl CoreError {
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        match self {
            CoreError::Config(_) => ErrorClass::Permanent,
            CoreError::Outbox(e) => e.error_class(),
            CoreError::Emergency(e) => e.error_class(),
            CoreError::Event(e) => e.error_class(),
            CoreError::Geofence(e) => e.error_class(),
        }
    }
}

pub struct SafetyCore {
    outbox: Arc<Outbox>,
    machine: Arc<EmergencyStateMachine>,
    trigger: Arc<PressHoldTrigger>,
    voice: Arc<KeywordTrigger>,
    drainer: Arc<SyncDrainer>,
    events: EventQueue,
    monitor_events: broadcast::Sender<MonitorEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SafetyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyCore")
            .field("status", &self.machine.status())
            .field("syncing", &self.drainer.is_syncing())
            .finish_non_exhaustive()
    }
}

impl SafetyCore {
    /// Rehydrate durable state and start the event sources.
    ///
    /// The outbox is loaded before anything can enqueue, and the emergency
    /// record is restored before the triggers exist.
    #[instrument(skip_all, fields(profile = caps.profile.as_str()))]
    pub async fn start(config: CoreConfig, caps: Capabilities) -> Result<Self, CoreError> {
        config.validate()?;

        let outbox = Arc::new(Outbox::open(Arc::clone(&caps.storage), config.outbox.clone()).await?);
        let machine =
            EmergencyStateMachine::restore(Arc::clone(&outbox), caps.clone(), config.emergency.clone())
                .await;
        let trigger = PressHoldTrigger::new(
            Arc::clone(&machine),
            caps.clone(),
            config.trigger.hold_duration(),
        );
        let voice = KeywordTrigger::new(Arc::clone(&machine), &caps, &config.voice);
        let drainer = SyncDrainer::new(
            Arc::clone(&outbox),
            &caps,
            Arc::clone(&machine),
            config.sync.request_timeout(),
        );

        let battery = caps.battery().map(|provider| {
            let monitor = BatteryMonitor::new(
                config.battery.clone(),
                Arc::clone(&outbox),
                Arc::clone(&caps.feedback),
                machine.subscribe_status(),
            );
            (monitor, provider)
        });
        let geofence = GeofenceMonitor::load(
            config.geofence.zones.clone(),
            Arc::clone(&outbox),
            Arc::clone(&caps.feedback),
            machine.subscribe_status(),
            Arc::clone(&caps.storage),
        )
        .await;

        let (events, rx) = EventQueue::new(EVENT_QUEUE_CAPACITY);
        let mut subscriptions = vec![
            events.forward_connectivity(caps.connectivity.subscribe()),
            events.forward_interval("sync_poll", config.sync.poll_interval(), || CoreEvent::SyncTick),
            events.forward_notify("enqueued", outbox.enqueued_signal(), CoreEvent::EntryEnqueued),
        ];
        if battery.is_some() {
            subscriptions.push(events.forward_interval(
                "battery_poll",
                config.battery.poll_interval(),
                || CoreEvent::BatteryTick,
            ));
        }
        match events.forward_positions(Arc::clone(&caps.geolocation)) {
            Ok(sub) => subscriptions.push(sub),
            Err(e) => warn!(error = %e, "position watch unavailable, geofencing disabled"),
        }

        let (monitor_events, _) = broadcast::channel(MONITOR_EVENT_CAPACITY);
        let dispatcher = Dispatcher {
            drainer: Arc::clone(&drainer),
            battery,
            geofence,
            monitor_events: monitor_events.clone(),
            online: caps.connectivity.current_status(),
            drain_task: None,
            rerun: false,
        };
        let dispatcher = tokio::spawn(dispatcher.run(rx));

        info!(
            queued = outbox.len().await,
            status = ?machine.status().status,
            "safety core started"
        );

        Ok(Self {
            outbox,
            machine,
            trigger,
            voice,
            drainer,
            events,
            monitor_events,
            subscriptions: Mutex::new(subscriptions),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn on_press_start(&self) -> PressStart {
        self.trigger.on_press_start()
    }

    pub fn on_press_end(&self) -> PressEnd {
        self.trigger.on_press_end()
    }

    pub fn subscribe_trigger(&self) -> broadcast::Receiver<TriggerSignal> {
        self.trigger.subscribe()
    }

    #[must_use]
    pub fn emergency_status(&self) -> EmergencyStatus {
        self.machine.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EmergencyStatus> {
        self.machine.subscribe_status()
    }

    pub async fn emergency_record(&self) -> EmergencyRecord {
        self.machine.record().await
    }

    pub async fn request_deactivation(&self) -> Result<DeactivationOutcome, CoreError> {
        self.trigger.disarm();
        self.voice.disarm();
        Ok(self.machine.request_deactivation().await?)
    }

    pub async fn handle_transcript(&self, transcript: &str) -> Result<VoiceOutcome, CoreError> {
        Ok(self.voice.on_transcript(transcript).await?)
    }

    pub async fn queue_length(&self) -> usize {
        self.outbox.len().await
    }

    /// Queued entries in delivery order.
    pub async fn pending_entries(&self) -> Vec<OutboxEntry> {
        self.outbox.peek_all().await
    }

    pub fn is_syncing(&self) -> bool {
        self.drainer.is_syncing()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.outbox.metrics()
    }

    pub fn take_delivery_failures(&self) -> Vec<DeadLetter> {
        self.drainer.take_delivery_failures()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.outbox.dead_letters().await
    }

    pub fn subscribe_monitor_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.monitor_events.subscribe()
    }

    /// Replace the safe-zone set.
    pub async fn update_zones(&self, zones: Vec<SafeZone>) -> Result<(), CoreError> {
        Ok(self.events.send(CoreEvent::ZonesUpdated(zones)).await?)
    }

    pub async fn update_zones_geojson(&self, geojson: &str) -> Result<usize, CoreError> {
        let zones = parse_zones_geojson(geojson)?;
        let count = zones.len();
        self.update_zones(zones).await?;
        Ok(count)
    }

    /// Run a drain cycle now instead of waiting for the next trigger.
    pub async fn drain_now(&self) -> Result<DrainReport, DrainSkipped> {
        self.drainer.drain().await
    }

    /// Stop every event source, let the dispatcher finish the events
    /// already queued, then persist whatever the outbox still holds in
    /// memory only.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.trigger.disarm();
        self.voice.disarm();

        let subscriptions = std::mem::take(&mut *self.subscriptions.lock().await);
        for sub in subscriptions {
            sub.cancel().await;
        }

        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            if self.events.send(CoreEvent::Shutdown).await.is_ok() {
                let _ = dispatcher.await;
            } else {
                dispatcher.abort();
            }
        }

        if let Err(e) = self.outbox.flush().await {
            warn!(error = %e, "outbox not fully persisted at shutdown");
        }
        info!("safety core stopped");
    }
}

/// Owns the monitors and reacts to core events one at a time.
struct Dispatcher {
    drainer: Arc<SyncDrainer>,
    battery: Option<(BatteryMonitor, Arc<dyn BatteryProvider>)>,
    geofence: GeofenceMonitor,
    monitor_events: broadcast::Sender<MonitorEvent>,
    online: bool,
    drain_task: Option<JoinHandle<Result<DrainReport, DrainSkipped>>>,
    /// A drain was requested while one was running.
    rerun: bool,
}

enum Next {
    Event(CoreEvent),
    Drained(Result<Result<DrainReport, DrainSkipped>, JoinError>),
    Closed,
}

async fn drain_finished(
    task: &mut Option<JoinHandle<Result<DrainReport, DrainSkipped>>>,
) -> Result<Result<DrainReport, DrainSkipped>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::Receiver<CoreEvent>) {
        loop {
            let next = tokio::select! {
                event = rx.recv() => event.map_or(Next::Closed, Next::Event),
                result = drain_finished(&mut self.drain_task) => Next::Drained(result),
            };
            match next {
                Next::Event(CoreEvent::Shutdown) | Next::Closed => break,
                Next::Event(event) => self.handle(event).await,
                Next::Drained(result) => {
                    self.drain_task = None;
                    match result {
                        Ok(Ok(report)) => debug!(delivered = report.delivered, "drain finished"),
                        Ok(Err(skipped)) => debug!(?skipped, "drain skipped"),
                        Err(e) => warn!(error = %e, "drain task failed"),
                    }
                    if std::mem::take(&mut self.rerun) && self.online {
                        self.start_drain();
                    }
                }
            }
        }

        if let Some(task) = self.drain_task.take() {
            let _ = task.await;
        }
        debug!("dispatcher stopped");
    }

    async fn handle(&mut self, event: CoreEvent) {
        debug!(event = event.name(), "core event");
        match event {
            CoreEvent::ConnectivityChanged { online } => {
                let came_online = online && !self.online;
                self.online = online;
                if came_online {
                    info!("back online, draining outbox");
                    self.start_drain();
                } else if !online {
                    info!("offline, outbox accumulating");
                }
            }
            CoreEvent::SyncTick | CoreEvent::EntryEnqueued => {
                if self.online {
                    self.start_drain();
                }
            }
            CoreEvent::PositionUpdated(position) => {
                let events = self.geofence.sample(position).await;
                self.publish(events);
            }
            CoreEvent::BatteryTick => {
                if let Some((monitor, provider)) = self.battery.as_mut() {
                    match monitor.tick(provider.as_ref()).await {
                        Ok(events) => self.publish(events),
                        Err(e) => debug!(error = %e, "battery reading unavailable"),
                    }
                }
            }
            CoreEvent::ZonesUpdated(zones) => self.geofence.set_zones(zones).await,
            CoreEvent::Shutdown => {}
        }
    }

    fn start_drain(&mut self) {
        if self.drain_task.is_some() {
            self.rerun = true;
            return;
        }
        self.drain_task = Some(self.drainer.spawn_drain());
    }

    fn publish(&self, events: Vec<MonitorEvent>) {
        for event in events {
            let _ = self.monitor_events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::TestHarness;
    use crate::monitor::{BatteryTier, Transition};
    use crate::outbox::Endpoint;
    use crate::Coordinate;
    use std::time::Duration;

    /// Defaults without the per-poll battery log, so queue counts stay exact.
    fn quiet_config() -> CoreConfig {
        let mut config = CoreConfig::default();
        config.battery.log_readings = false;
        config
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let harness = TestHarness::new();
        let mut config = CoreConfig::default();
        config.outbox.max_retries = 0;
        let err = SafetyCore::start(config, harness.capabilities())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
        assert_eq!(err.error_class(), ErrorClass::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_while_online_is_drained() {
        let harness = TestHarness::new();
        let core = SafetyCore::start(quiet_config(), harness.capabilities())
            .await
            .unwrap();

        let outcome = core.handle_transcript("help me").await.unwrap();
        assert_eq!(outcome, VoiceOutcome::AwaitingConfirmation);
        let outcome = core.handle_transcript("yes").await.unwrap();
        assert!(matches!(outcome, VoiceOutcome::Activation(_)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(core.queue_length().await, 0);
        assert_eq!(core.metrics().entries_delivered, 2);
        core.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_queue_drains_on_reconnect() {
        let harness = TestHarness::new();
        harness.connectivity.set_online(false);
        let core = SafetyCore::start(quiet_config(), harness.capabilities())
            .await
            .unwrap();

        core.handle_transcript("activate emergency").await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(core.queue_length().await, 2);
        assert_eq!(harness.remote.call_count(), 0);

        harness.connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(core.queue_length().await, 0);
        assert_eq!(harness.remote.call_count(), 2);
        core.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn battery_poll_feeds_monitor_events() {
        let harness = TestHarness::new();
        harness.connectivity.set_online(false);
        harness.battery.set(8.0, false);
        let core = SafetyCore::start(CoreConfig::default(), harness.capabilities())
            .await
            .unwrap();
        let mut monitor_events = core.subscribe_monitor_events();

        // First poll fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut saw_critical = false;
        while let Ok(event) = monitor_events.try_recv() {
            saw_critical |= matches!(
                event,
                MonitorEvent::Battery {
                    tier: BatteryTier::Critical,
                    transition: Transition::Entered,
                    ..
                }
            );
        }
        assert!(saw_critical);
        let queued = core.pending_entries().await;
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].endpoint, Endpoint::BatteryCritical);
        assert_eq!(queued[1].endpoint, Endpoint::BatteryLog);
        assert_eq!(queued[1].payload["batteryLevel"], 8.0);
        core.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zone_updates_reach_geofence() {
        let harness = TestHarness::new();
        harness.connectivity.set_online(false);
        let core = SafetyCore::start(CoreConfig::default(), harness.capabilities())
            .await
            .unwrap();
        let mut monitor_events = core.subscribe_monitor_events();

        core.update_zones(vec![SafeZone {
            id: "home".into(),
            name: "Home".into(),
            center: Coordinate::new(10.0, 20.0).unwrap(),
            radius_m: 100.0,
            active: true,
        }])
        .await
        .unwrap();
        harness.geolocation.push_position(10.0, 20.0);

        let event = tokio::time::timeout(Duration::from_secs(1), monitor_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            MonitorEvent::Zone {
                zone_id: "home".into(),
                zone_name: "Home".into(),
                transition: Transition::Entered,
            }
        );
        core.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_position_watch() {
        let harness = TestHarness::new();
        let core = SafetyCore::start(CoreConfig::default(), harness.capabilities())
            .await
            .unwrap();
        assert_eq!(harness.geolocation.active_watches(), 1);

        core.shutdown().await;
        assert_eq!(harness.geolocation.active_watches(), 0);
    }
}
