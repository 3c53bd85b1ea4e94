//! Durable FIFO of side-effecting operations awaiting remote acknowledgement.
//!
//! Producers enqueue; only the sync drainer marks entries succeeded or
//! failed. The whole queue is written as one sealed snapshot under a single
//! storage key after every mutation, so a restart sees exactly the entries
//! that were durably accepted, in the order they were accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::capabilities::{KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::config::OutboxConfig;
use crate::store::{self, StoreError};
use crate::{ErrorClass, UnixTimeMs};

const QUEUE_KEY: &str = "queue";
const MAX_ERROR_LEN: usize = 1024;
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;
/// Payload bytes retained across all dead letters.
const DEAD_LETTER_BYTES: usize = 2 * 1024 * 1024;
const MAX_ENDPOINT_LEN: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Logical remote operation. Serialized as its kebab-case name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    RecordEmergencyLocation,
    NotifyContacts,
    CancelNotify,
    BatteryCritical,
    BatteryLog,
    ZoneTransition,
    Custom(String),
}

impl Endpoint {
    pub fn parse(name: &str) -> Result<Self, OutboxError> {
        let name = name.trim();
        Ok(match name {
            "record-emergency-location" => Endpoint::RecordEmergencyLocation,
            "notify-contacts" => Endpoint::NotifyContacts,
            "cancel-notify" => Endpoint::CancelNotify,
            "battery-critical" => Endpoint::BatteryCritical,
            "battery-log" => Endpoint::BatteryLog,
            "zone-transition" => Endpoint::ZoneTransition,
            other => {
                if other.is_empty() || other.len() > MAX_ENDPOINT_LEN {
                    return Err(OutboxError::InvalidEndpoint(other.to_string()));
                }
                if !other
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/'))
                {
                    return Err(OutboxError::InvalidEndpoint(other.to_string()));
                }
                Endpoint::Custom(other.to_string())
            }
        })
    }

    /// Emergency traffic is never refused for capacity.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(
            self,
            Endpoint::RecordEmergencyLocation
                | Endpoint::NotifyContacts
                | Endpoint::CancelNotify
                | Endpoint::BatteryCritical
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Endpoint::RecordEmergencyLocation => "record-emergency-location",
            Endpoint::NotifyContacts => "notify-contacts",
            Endpoint::CancelNotify => "cancel-notify",
            Endpoint::BatteryCritical => "battery-critical",
            Endpoint::BatteryLog => "battery-log",
            Endpoint::ZoneTransition => "zone-transition",
            Endpoint::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Endpoint {
    type Error = OutboxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.as_str().to_string()
    }
}

fn persisted_on_load() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: EntryId,
    pub endpoint: Endpoint,
    pub payload: Value,
    pub enqueued_at: UnixTimeMs,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Not attempted before this instant. Only set when backoff is enabled.
    pub next_attempt_at: Option<UnixTimeMs>,
    #[serde(skip, default = "persisted_on_load")]
    persisted: bool,
}

impl OutboxEntry {
    fn new(endpoint: Endpoint, payload: Value, now: UnixTimeMs) -> Self {
        Self {
            id: EntryId::generate(),
            endpoint,
            payload,
            enqueued_at: now,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            persisted: false,
        }
    }

    /// `false` while the entry exists only in memory.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    #[must_use]
    pub fn is_due(&self, now: UnixTimeMs) -> bool {
        self.next_attempt_at.map_or(true, |at| !now.is_before(at))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxRetriesExceeded,
    PermanentFailure,
    /// Displaced by emergency traffic while the queue was full.
    Evicted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub entry: OutboxEntry,
    pub reason: DeadLetterReason,
    pub dead_at: UnixTimeMs,
    /// Set once the failure has been reported to the user.
    pub surfaced: bool,
}

/// Why a delivery attempt failed, already classified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl DeliveryFailure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, message)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureDisposition {
    WillRetry {
        retry_count: u32,
        next_attempt_at: Option<UnixTimeMs>,
    },
    DeadLettered {
        reason: DeadLetterReason,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Enqueued {
    pub id: EntryId,
    /// `false` if the storage write failed and the entry is memory-only.
    pub durable: bool,
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox is full ({0} entries)")]
    Full(usize),

    #[error("outbox byte budget exhausted: {queued} queued, {size} more, max {max}")]
    OverBudget { queued: usize, size: usize, max: usize },

    #[error("entry not found: {0}")]
    NotFound(EntryId),

    #[error("invalid endpoint: {0:?}")]
    InvalidEndpoint(String),

    #[error("payload too large: {size} bytes, max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] StoreError),
}

impl OutboxError {
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        match self {
            OutboxError::Full(_)
            | OutboxError::OverBudget { .. }
            | OutboxError::Storage(_)
            | OutboxError::Snapshot(_) => ErrorClass::LocalResource,
            OutboxError::NotFound(_)
            | OutboxError::InvalidEndpoint(_)
            | OutboxError::PayloadTooLarge { .. } => ErrorClass::InvariantViolation,
        }
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

fn payload_size(payload: &Value) -> usize {
    serde_json::to_vec(payload).map_or(0, |b| b.len())
}

#[derive(Debug, Default)]
pub struct OutboxMetrics {
    pub entries_enqueued: AtomicU64,
    pub entries_delivered: AtomicU64,
    pub entries_failed: AtomicU64,
    pub entries_dead_lettered: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl OutboxMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_enqueued: self.entries_enqueued.load(Ordering::Relaxed),
            entries_delivered: self.entries_delivered.load(Ordering::Relaxed),
            entries_failed: self.entries_failed.load(Ordering::Relaxed),
            entries_dead_lettered: self.entries_dead_lettered.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub entries_enqueued: u64,
    pub entries_delivered: u64,
    pub entries_failed: u64,
    pub entries_dead_lettered: u64,
    pub storage_errors: u64,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    entries: &'a [OutboxEntry],
    dead_letters: &'a [DeadLetter],
}

#[derive(Deserialize, Default)]
struct Snapshot {
    entries: Vec<OutboxEntry>,
    dead_letters: Vec<DeadLetter>,
}

#[derive(Default)]
struct OutboxState {
    entries: Vec<OutboxEntry>,
    dead_letters: Vec<DeadLetter>,
    /// Serialized payload bytes across `entries`.
    queued_bytes: usize,
    /// Memory is ahead of storage.
    dirty: bool,
}

impl OutboxState {
    fn remove_entry(&mut self, index: usize) -> OutboxEntry {
        let entry = self.entries.remove(index);
        self.queued_bytes = self
            .queued_bytes
            .saturating_sub(payload_size(&entry.payload));
        entry
    }

    /// Oldest entry that emergency traffic may displace.
    fn oldest_evictable(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.endpoint.is_critical())
    }

    fn bury(&mut self, entry: OutboxEntry, reason: DeadLetterReason, now: UnixTimeMs) {
        self.dead_letters.push(DeadLetter {
            entry,
            reason,
            dead_at: now,
            surfaced: false,
        });
    }

    /// Drop the oldest dead letters beyond `max_count` or the byte cap,
    /// reported ones first. Returns how many were dropped.
    fn prune_dead_letters(&mut self, max_count: usize) -> usize {
        let mut bytes: usize = self
            .dead_letters
            .iter()
            .map(|d| payload_size(&d.entry.payload))
            .sum();
        let mut dropped = 0;
        while self.dead_letters.len() > max_count || bytes > DEAD_LETTER_BYTES {
            let index = self
                .dead_letters
                .iter()
                .position(|d| d.surfaced)
                .unwrap_or(0);
            let dead = self.dead_letters.remove(index);
            bytes = bytes.saturating_sub(payload_size(&dead.entry.payload));
            dropped += 1;
        }
        dropped
    }
}

pub struct Outbox {
    storage: Arc<dyn KeyValueStore>,
    key: KvKey,
    config: OutboxConfig,
    state: RwLock<OutboxState>,
    metrics: OutboxMetrics,
    enqueued: Arc<Notify>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Outbox {
    /// Rehydrate the queue from storage. Nothing can be enqueued before this
    /// returns.
    #[instrument(skip(storage, config))]
    pub async fn open(
        storage: Arc<dyn KeyValueStore>,
        config: OutboxConfig,
    ) -> Result<Self, OutboxError> {
        let key = KvKey::new(KeyNamespace::Outbox, QUEUE_KEY)?;

        let snapshot = match storage.get(&key).await? {
            None => Snapshot::default(),
            Some(bytes) => match store::open::<Snapshot>(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "quarantining unreadable outbox snapshot");
                    let quarantine = KvKey::new(
                        KeyNamespace::Outbox,
                        format!("quarantine-{}", UnixTimeMs::now().as_millis()),
                    )?;
                    if let Err(e) = storage.set(&quarantine, bytes).await {
                        error!(error = %e, "failed to quarantine outbox snapshot");
                    }
                    Snapshot::default()
                }
            },
        };

        info!(
            entries = snapshot.entries.len(),
            dead_letters = snapshot.dead_letters.len(),
            "outbox rehydrated"
        );

        let queued_bytes = snapshot.entries.iter().map(|e| payload_size(&e.payload)).sum();
        let mut state = OutboxState {
            entries: snapshot.entries,
            dead_letters: snapshot.dead_letters,
            queued_bytes,
            dirty: false,
        };
        if state.prune_dead_letters(config.max_dead_letters) > 0 {
            state.dirty = true;
        }

        Ok(Self {
            storage,
            key,
            config,
            state: RwLock::new(state),
            metrics: OutboxMetrics::default(),
            enqueued: Arc::new(Notify::new()),
        })
    }

    /// Append an operation. Returns once the entry is durably stored, or
    /// once it is held in memory if storage refused the write.
    ///
    /// When the queue is at `max_entries` or `max_queue_bytes`, ordinary
    /// entries are refused. Critical entries instead displace the oldest
    /// non-critical entries into the dead letters, and are admitted past the
    /// limits if nothing is left to displace.
    #[instrument(skip(self, payload), fields(endpoint = %endpoint))]
    pub async fn enqueue(&self, endpoint: Endpoint, payload: Value) -> Result<Enqueued, OutboxError> {
        let size = payload_size(&payload);
        if size > MAX_PAYLOAD_BYTES {
            return Err(OutboxError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_BYTES,
            });
        }

        let now = UnixTimeMs::now();
        let mut state = self.state.write().await;
        self.make_room(&mut state, &endpoint, size, now)?;

        let entry = OutboxEntry::new(endpoint, payload, now);
        let id = entry.id;
        state.entries.push(entry);
        state.queued_bytes += size;
        self.metrics.entries_enqueued.fetch_add(1, Ordering::Relaxed);

        let durable = self.persist(&mut state).await.is_ok();
        if durable {
            debug!(entry_id = %id, "entry enqueued");
        } else {
            warn!(entry_id = %id, "entry held in memory only");
        }
        drop(state);

        self.enqueued.notify_one();
        Ok(Enqueued { id, durable })
    }

    fn make_room(
        &self,
        state: &mut OutboxState,
        endpoint: &Endpoint,
        size: usize,
        now: UnixTimeMs,
    ) -> Result<(), OutboxError> {
        let over = |state: &OutboxState| {
            state.entries.len() >= self.config.max_entries
                || state.queued_bytes + size > self.config.max_queue_bytes
        };
        if !over(state) {
            return Ok(());
        }
        if !endpoint.is_critical() {
            return Err(if state.entries.len() >= self.config.max_entries {
                OutboxError::Full(self.config.max_entries)
            } else {
                OutboxError::OverBudget {
                    queued: state.queued_bytes,
                    size,
                    max: self.config.max_queue_bytes,
                }
            });
        }

        while over(state) {
            let Some(index) = state.oldest_evictable() else {
                warn!(
                    entries = state.entries.len(),
                    queued_bytes = state.queued_bytes,
                    "admitting critical entry past outbox limits"
                );
                break;
            };
            let mut evicted = state.remove_entry(index);
            evicted.last_error = Some("evicted while the outbox was full".to_string());
            warn!(entry_id = %evicted.id, endpoint = %evicted.endpoint, "entry evicted");
            state.bury(evicted, DeadLetterReason::Evicted, now);
            self.metrics
                .entries_dead_lettered
                .fetch_add(1, Ordering::Relaxed);
        }
        state.prune_dead_letters(self.config.max_dead_letters);
        Ok(())
    }

    /// All active entries, oldest first.
    pub async fn peek_all(&self) -> Vec<OutboxEntry> {
        self.state.read().await.entries.clone()
    }

    /// Entries whose backoff has elapsed, oldest first.
    pub async fn peek_due(&self, now: UnixTimeMs) -> Vec<OutboxEntry> {
        self.state
            .read()
            .await
            .entries
            .iter()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect()
    }

    #[instrument(skip(self), fields(entry_id = %id))]
    pub async fn mark_succeeded(&self, id: EntryId) -> Result<OutboxEntry, OutboxError> {
        let mut state = self.state.write().await;
        let index = state
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        let entry = state.remove_entry(index);
        self.metrics.entries_delivered.fetch_add(1, Ordering::Relaxed);

        // Delivered either way; a failed write only means a restart may resend.
        let _ = self.persist(&mut state).await;
        debug!(endpoint = %entry.endpoint, "entry delivered");
        Ok(entry)
    }

    #[instrument(skip(self, failure), fields(entry_id = %id, class = %failure.class))]
    pub async fn mark_failed(
        &self,
        id: EntryId,
        failure: DeliveryFailure,
    ) -> Result<FailureDisposition, OutboxError> {
        let now = UnixTimeMs::now();
        let mut state = self.state.write().await;
        let index = state
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(OutboxError::NotFound(id))?;

        let mut message = failure.message;
        truncate_utf8_safe(&mut message, MAX_ERROR_LEN);

        let entry = &mut state.entries[index];
        entry.retry_count = entry.retry_count.saturating_add(1);
        entry.last_error = Some(message);
        let retry_count = entry.retry_count;
        self.metrics.entries_failed.fetch_add(1, Ordering::Relaxed);

        let reason = if !failure.class.is_retryable() {
            Some(DeadLetterReason::PermanentFailure)
        } else if retry_count >= self.config.max_retries {
            Some(DeadLetterReason::MaxRetriesExceeded)
        } else {
            None
        };

        let disposition = if let Some(reason) = reason {
            let entry = state.remove_entry(index);
            warn!(
                endpoint = %entry.endpoint,
                retry_count,
                reason = ?reason,
                "entry dead-lettered"
            );
            state.bury(entry, reason, now);
            state.prune_dead_letters(self.config.max_dead_letters);
            self.metrics
                .entries_dead_lettered
                .fetch_add(1, Ordering::Relaxed);
            FailureDisposition::DeadLettered { reason }
        } else {
            let next_attempt_at = self.config.backoff.as_ref().map(|backoff| {
                use rand::Rng;
                let jitter = if backoff.jitter_ms == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=backoff.jitter_ms)
                };
                now.add_millis(backoff.delay_ms(retry_count, jitter))
            });
            state.entries[index].next_attempt_at = next_attempt_at;
            FailureDisposition::WillRetry {
                retry_count,
                next_attempt_at,
            }
        };

        let _ = self.persist(&mut state).await;
        Ok(disposition)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.read().await.dead_letters.clone()
    }

    /// Dead letters not yet reported, marking them reported.
    pub async fn take_unsurfaced_dead_letters(&self) -> Vec<DeadLetter> {
        let mut state = self.state.write().await;
        let mut taken = Vec::new();
        for dead in state.dead_letters.iter_mut().filter(|d| !d.surfaced) {
            dead.surfaced = true;
            taken.push(dead.clone());
        }
        if !taken.is_empty() {
            let _ = self.persist(&mut state).await;
        }
        taken
    }

    /// Retry writing anything that only exists in memory.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<(), OutboxError> {
        let mut state = self.state.write().await;
        if !state.dirty {
            return Ok(());
        }
        self.persist(&mut state).await
    }

    pub async fn unpersisted_count(&self) -> usize {
        self.state
            .read()
            .await
            .entries
            .iter()
            .filter(|e| !e.persisted)
            .count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Woken after every enqueue.
    pub fn enqueued_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.enqueued)
    }

    async fn persist(&self, state: &mut OutboxState) -> Result<(), OutboxError> {
        let result = async {
            let bytes = store::seal(&SnapshotRef {
                entries: &state.entries,
                dead_letters: &state.dead_letters,
            })?;
            self.storage.set(&self.key, bytes).await?;
            Ok::<(), OutboxError>(())
        }
        .await;

        match result {
            Ok(()) => {
                state.dirty = false;
                for entry in &mut state.entries {
                    entry.persisted = true;
                }
                Ok(())
            }
            Err(e) => {
                state.dirty = true;
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "failed to persist outbox");
                Err(e)
            }
        }
    }
}
