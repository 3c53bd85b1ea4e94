//! In-process fakes backing [`CapabilityProfile::Test`].
//!
//! Every fake records what the core asked of it and can be scripted to fail,
//! so tests can drive the full engine without a device or a network.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    ApiError, ApiResponse, BatteryProvider, BatteryReading, Capabilities, CapabilityProfile,
    ConnectivityState, DeviceError, FeedbackSink, GeolocationProvider, KeyValueStore, KvError,
    KvKey, LocationError, MemoryKvStore, Position, RemoteApi, SoundCue, WatchHandle,
};
use crate::outbox::Endpoint;
use crate::{Coordinate, UnixTimeMs};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct FakeGeolocation {
    result: Mutex<Result<Position, LocationError>>,
    delay: Mutex<Duration>,
    watches: Mutex<HashMap<u64, mpsc::Sender<Position>>>,
    next_watch: AtomicU64,
}

impl Default for FakeGeolocation {
    fn default() -> Self {
        Self {
            result: Mutex::new(Err(LocationError::Unavailable("no fix configured".into()))),
            delay: Mutex::new(Duration::ZERO),
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
        }
    }
}

impl FakeGeolocation {
    pub fn set_position(&self, lat: f64, lon: f64) {
        if let Ok(coordinate) = Coordinate::new(lat, lon) {
            *lock(&self.result) = Ok(Position::new(coordinate, Some(5.0), UnixTimeMs::now()));
        }
    }

    pub fn set_error(&self, error: LocationError) {
        *lock(&self.result) = Err(error);
    }

    /// Delay before `current_position` answers.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Deliver a position to every active watch.
    pub fn push_position(&self, lat: f64, lon: f64) {
        let Ok(coordinate) = Coordinate::new(lat, lon) else {
            return;
        };
        let position = Position::new(coordinate, Some(5.0), UnixTimeMs::now());
        for sink in lock(&self.watches).values() {
            let _ = sink.try_send(position);
        }
    }

    pub fn active_watches(&self) -> usize {
        lock(&self.watches).len()
    }
}

#[async_trait]
impl GeolocationProvider for FakeGeolocation {
    async fn current_position(&self, _timeout: Duration) -> Result<Position, LocationError> {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.result).clone()
    }

    fn watch_position(&self, sink: mpsc::Sender<Position>) -> Result<WatchHandle, LocationError> {
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        lock(&self.watches).insert(id, sink);
        Ok(WatchHandle(id))
    }

    fn clear_watch(&self, handle: WatchHandle) {
        lock(&self.watches).remove(&handle.0);
    }
}

type Scripted = Result<ApiResponse, ApiError>;

/// Remote API answering from scripts; unscripted calls succeed with 200.
#[derive(Debug, Default)]
pub struct ScriptedApi {
    queue: Mutex<VecDeque<Scripted>>,
    per_endpoint: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<(Endpoint, Value)>>,
    delay: Mutex<Duration>,
}

impl ScriptedApi {
    /// Queue a result for the next call, whatever its endpoint.
    pub fn push_result(&self, result: Scripted) {
        lock(&self.queue).push_back(result);
    }

    /// Queue a result for the next call to `endpoint`. Takes precedence over
    /// [`push_result`](Self::push_result).
    pub fn push_for(&self, endpoint: &Endpoint, result: Scripted) {
        lock(&self.per_endpoint)
            .entry(endpoint.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn calls(&self) -> Vec<(Endpoint, Value)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn send(&self, endpoint: &Endpoint, payload: &Value) -> Result<ApiResponse, ApiError> {
        lock(&self.calls).push((endpoint.clone(), payload.clone()));

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted = lock(&self.per_endpoint)
            .get_mut(&endpoint.to_string())
            .and_then(VecDeque::pop_front);
        scripted
            .or_else(|| lock(&self.queue).pop_front())
            .unwrap_or_else(|| Ok(ApiResponse::ok()))
    }
}

/// In-memory storage whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyKvStore {
    inner: MemoryKvStore,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl FlakyKvStore {
    pub fn from_snapshot(values: HashMap<String, Vec<u8>>) -> Self {
        Self {
            inner: MemoryKvStore::from_snapshot(values),
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> HashMap<String, Vec<u8>> {
        self.inner.snapshot()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for FlakyKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KvError::Backend("disk full".into()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackCall {
    Notify { title: String, body: String },
    Vibrate(Vec<u64>),
    PlaySound(SoundCue),
    StopSound(SoundCue),
}

#[derive(Debug, Default)]
pub struct RecordingFeedback {
    calls: Mutex<Vec<FeedbackCall>>,
}

impl RecordingFeedback {
    pub fn calls(&self) -> Vec<FeedbackCall> {
        lock(&self.calls).clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                FeedbackCall::Notify { title, .. } => Some(title.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }
}

impl FeedbackSink for RecordingFeedback {
    fn notify(&self, title: &str, body: &str) {
        lock(&self.calls).push(FeedbackCall::Notify {
            title: title.to_string(),
            body: body.to_string(),
        });
    }

    fn vibrate(&self, pattern: &[u64]) {
        lock(&self.calls).push(FeedbackCall::Vibrate(pattern.to_vec()));
    }

    fn play_sound(&self, cue: SoundCue) {
        lock(&self.calls).push(FeedbackCall::PlaySound(cue));
    }

    fn stop_sound(&self, cue: SoundCue) {
        lock(&self.calls).push(FeedbackCall::StopSound(cue));
    }
}

#[derive(Debug)]
pub struct ScriptedBattery {
    reading: Mutex<Result<BatteryReading, DeviceError>>,
}

impl Default for ScriptedBattery {
    fn default() -> Self {
        Self {
            reading: Mutex::new(Ok(BatteryReading::new(100.0, false))),
        }
    }
}

impl ScriptedBattery {
    pub fn set(&self, level_percent: f64, charging: bool) {
        *lock(&self.reading) = Ok(BatteryReading::new(level_percent, charging));
    }

    pub fn set_unavailable(&self) {
        *lock(&self.reading) = Err(DeviceError::Unavailable("battery API missing".into()));
    }
}

#[async_trait]
impl BatteryProvider for ScriptedBattery {
    async fn read(&self) -> Result<BatteryReading, DeviceError> {
        lock(&self.reading).clone()
    }
}

/// One set of fakes wired into a [`Capabilities`] bundle.
#[derive(Debug, Clone)]
pub struct TestHarness {
    pub geolocation: Arc<FakeGeolocation>,
    pub remote: Arc<ScriptedApi>,
    pub storage: Arc<FlakyKvStore>,
    pub connectivity: ConnectivityState,
    pub feedback: Arc<RecordingFeedback>,
    pub battery: Arc<ScriptedBattery>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Fresh fakes, online, with empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::with_storage(FlakyKvStore::default())
    }

    fn with_storage(storage: FlakyKvStore) -> Self {
        Self {
            geolocation: Arc::new(FakeGeolocation::default()),
            remote: Arc::new(ScriptedApi::default()),
            storage: Arc::new(storage),
            connectivity: ConnectivityState::new(true),
            feedback: Arc::new(RecordingFeedback::default()),
            battery: Arc::new(ScriptedBattery::default()),
        }
    }

    /// Simulated process restart: new fakes over a copy of what was
    /// durably stored.
    #[must_use]
    pub fn restarted(&self) -> Self {
        Self::with_storage(FlakyKvStore::from_snapshot(self.storage.snapshot()))
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            profile: CapabilityProfile::Test,
            geolocation: self.geolocation.clone(),
            remote: self.remote.clone(),
            storage: self.storage.clone(),
            connectivity: Arc::new(self.connectivity.clone()),
            feedback: self.feedback.clone(),
            battery: Some(self.battery.clone()),
        }
    }
}
