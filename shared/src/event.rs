//! Single serialized event queue feeding the core.
//!
//! Connectivity transitions, position updates, timers and enqueue
//! notifications all arrive as [`CoreEvent`]s on one `mpsc` channel and are
//! handled one at a time by the engine's dispatcher. Every source is held by
//! a [`Subscription`] that is torn down explicitly.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::capabilities::{GeolocationProvider, LocationError, Position};
use crate::monitor::SafeZone;
use crate::ErrorClass;

pub const EVENT_QUEUE_CAPACITY: usize = 256;
const POSITION_BUFFER: usize = 16;

#[derive(Clone, Debug, PartialEq)]
pub enum CoreEvent {
    ConnectivityChanged { online: bool },
    PositionUpdated(Position),
    BatteryTick,
    SyncTick,
    EntryEnqueued,
    ZonesUpdated(Vec<SafeZone>),
    Shutdown,
}

impl CoreEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            CoreEvent::ConnectivityChanged { .. } => "connectivity_changed",
            CoreEvent::PositionUpdated(_) => "position_updated",
            CoreEvent::BatteryTick => "battery_tick",
            CoreEvent::SyncTick => "sync_tick",
            CoreEvent::EntryEnqueued => "entry_enqueued",
            CoreEvent::ZonesUpdated(_) => "zones_updated",
            CoreEvent::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event queue closed")]
    Closed,

    #[error("failed to watch position: {0}")]
    Watch(#[from] LocationError),
}

impl EventError {
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        match self {
            EventError::Closed => ErrorClass::InvariantViolation,
            EventError::Watch(_) => ErrorClass::LocalResource,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventQueue {
    tx: mpsc::Sender<CoreEvent>,
}

impl EventQueue {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<CoreEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, event: CoreEvent) -> Result<(), EventError> {
        self.tx.send(event).await.map_err(|_| EventError::Closed)
    }

    /// Subscribe to connectivity transitions.
    pub fn forward_connectivity(&self, mut rx: watch::Receiver<bool>) -> Subscription {
        let tx = self.tx.clone();
        Subscription::new(
            "connectivity",
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let online = *rx.borrow_and_update();
                    if tx
                        .send(CoreEvent::ConnectivityChanged { online })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }),
        )
    }

    /// Register a position watch; cancelling the subscription clears it.
    pub fn forward_positions(
        &self,
        geolocation: Arc<dyn GeolocationProvider>,
    ) -> Result<Subscription, EventError> {
        let (sink, mut positions) = mpsc::channel(POSITION_BUFFER);
        let handle = geolocation.watch_position(sink)?;
        let tx = self.tx.clone();

        let task = tokio::spawn(async move {
            while let Some(position) = positions.recv().await {
                if tx.send(CoreEvent::PositionUpdated(position)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new("positions", task)
            .on_cancel(move || geolocation.clear_watch(handle)))
    }

    /// Emit `event()` every `period`, starting immediately.
    pub fn forward_interval(
        &self,
        name: &'static str,
        period: Duration,
        event: fn() -> CoreEvent,
    ) -> Subscription {
        let tx = self.tx.clone();
        Subscription::new(
            name,
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if tx.send(event()).await.is_err() {
                        break;
                    }
                }
            }),
        )
    }

    /// Emit `event` each time `notify` is signalled.
    pub fn forward_notify(
        &self,
        name: &'static str,
        notify: Arc<Notify>,
        event: CoreEvent,
    ) -> Subscription {
        let tx = self.tx.clone();
        Subscription::new(
            name,
            tokio::spawn(async move {
                loop {
                    notify.notified().await;
                    if tx.send(event.clone()).await.is_err() {
                        break;
                    }
                }
            }),
        )
    }
}

/// Handle to one event source. Cancelling stops the forwarding task and
/// releases whatever the source registered with the platform.
pub struct Subscription {
    name: &'static str,
    task: Option<JoinHandle<()>>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("active", &self.task.is_some())
            .finish()
    }
}

impl Subscription {
    fn new(name: &'static str, task: JoinHandle<()>) -> Self {
        Self {
            name,
            task: Some(task),
            on_cancel: None,
        }
    }

    fn on_cancel(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the source and wait for its task to finish.
    pub async fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(release) = self.on_cancel.take() {
            release();
        }
        debug!(subscription = self.name, "unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(release) = self.on_cancel.take() {
            release();
        }
    }
}
