//! Emergency lifecycle: `Idle -> Arming -> Active -> Deactivating -> Idle`.
//!
//! The state machine is the only writer of [`EmergencyRecord`]. Transitions
//! hold one async mutex from start to finish, so a second activation or a
//! deactivation issued mid-flight waits for the first to settle. Each
//! transition runs on its own task, which keeps it going even if the caller
//! stops waiting.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::capabilities::{
    Capabilities, KeyNamespace, KvKey, Position, SoundCue, EMERGENCY_HAPTIC_PATTERN,
};
use crate::config::EmergencyConfig;
use crate::outbox::{Endpoint, EntryId, Outbox};
use crate::store;
use crate::{ErrorClass, UnixTimeMs};

const RECORD_KEY: &str = "record";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyStatusKind {
    #[default]
    Idle,
    Arming,
    Active,
    Deactivating,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    ManualHold,
    VoiceKeyword,
    Geofence,
    BatteryCritical,
}

impl TriggerSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TriggerSource::ManualHold => "manual_hold",
            TriggerSource::VoiceKeyword => "voice_keyword",
            TriggerSource::Geofence => "geofence",
            TriggerSource::BatteryCritical => "battery_critical",
        }
    }
}

/// Identifies one activation, from Arming to the return to Idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(Uuid);

impl EpisodeId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyRecord {
    pub status: EmergencyStatusKind,
    pub activated_at: Option<UnixTimeMs>,
    pub trigger_source: Option<TriggerSource>,
    pub episode_id: Option<EpisodeId>,
    /// Non-empty only while Active.
    pub notified_contact_ids: BTreeSet<String>,
    pub last_location: Option<Position>,
}

impl EmergencyRecord {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn snapshot(&self) -> EmergencyStatus {
        EmergencyStatus {
            status: self.status,
            activated_at: self.activated_at,
            trigger_source: self.trigger_source,
            episode_id: self.episode_id,
        }
    }

    /// Bring a record saved mid-transition back to a resting state.
    fn settle(&mut self) {
        match self.status {
            EmergencyStatusKind::Arming => {
                self.status = EmergencyStatusKind::Active;
                if self.activated_at.is_none() {
                    self.activated_at = Some(UnixTimeMs::now());
                }
            }
            EmergencyStatusKind::Deactivating | EmergencyStatusKind::Idle => self.clear(),
            EmergencyStatusKind::Active => {}
        }
    }
}

/// Read-only snapshot for the UI and for monitors.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStatus {
    pub status: EmergencyStatusKind,
    pub activated_at: Option<UnixTimeMs>,
    pub trigger_source: Option<TriggerSource>,
    pub episode_id: Option<EpisodeId>,
}

impl EmergencyStatus {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == EmergencyStatusKind::Active
    }

    /// Active, or on its way there.
    #[must_use]
    pub fn is_engaged(&self) -> bool {
        matches!(
            self.status,
            EmergencyStatusKind::Arming | EmergencyStatusKind::Active
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStep {
    PersistRecord,
    QueueLocation,
    QueueNotification,
    QueueCancellation,
}

/// Something that went wrong during a transition that still completed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransitionIssue {
    pub step: TransitionStep,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationReport {
    pub episode_id: EpisodeId,
    pub activated_at: UnixTimeMs,
    pub source: TriggerSource,
    pub location: Option<Position>,
    pub location_error: Option<String>,
    pub queued: Vec<EntryId>,
    pub issues: Vec<TransitionIssue>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ActivationOutcome {
    Activated(ActivationReport),
    AlreadyActive,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeactivationReport {
    pub episode_id: Option<EpisodeId>,
    pub notified_contact_ids: Vec<String>,
    pub queued: Option<EntryId>,
    pub issues: Vec<TransitionIssue>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeactivationOutcome {
    Deactivated(DeactivationReport),
    NoActiveEmergency,
}

#[derive(Debug, Error)]
pub enum EmergencyError {
    #[error("transition task ended abnormally: {0}")]
    Aborted(String),
}

impl EmergencyError {
    #[must_use]
    pub const fn error_class(&self) -> ErrorClass {
        ErrorClass::LocalResource
    }
}

pub struct EmergencyStateMachine {
    record: Mutex<EmergencyRecord>,
    status_tx: watch::Sender<EmergencyStatus>,
    outbox: Arc<Outbox>,
    caps: Capabilities,
    config: EmergencyConfig,
    key: KvKey,
}

impl std::fmt::Debug for EmergencyStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyStateMachine")
            .field("status", &*self.status_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl EmergencyStateMachine {
    /// Restore the last persisted record, settling any interrupted
    /// transition. An interrupted activation resumes as Active and its
    /// missing outbox entries are queued again.
    #[instrument(skip_all)]
    pub async fn restore(
        outbox: Arc<Outbox>,
        caps: Capabilities,
        config: EmergencyConfig,
    ) -> Arc<Self> {
        let key = KvKey::fixed(KeyNamespace::Emergency, RECORD_KEY);

        let loaded = match caps.storage.get(&key).await {
            Ok(Some(bytes)) => match store::open::<EmergencyRecord>(&bytes) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "discarding unreadable emergency record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "emergency record unavailable, starting idle");
                None
            }
        };

        let mut record = loaded.unwrap_or_default();
        let interrupted_activation = record.status == EmergencyStatusKind::Arming;
        let interrupted_deactivation =
            (record.status == EmergencyStatusKind::Deactivating).then(|| record.clone());
        let was_mid_transition = matches!(
            record.status,
            EmergencyStatusKind::Arming | EmergencyStatusKind::Deactivating
        );
        record.settle();

        let (status_tx, _) = watch::channel(record.snapshot());
        let machine = Arc::new(Self {
            record: Mutex::new(record),
            status_tx,
            outbox,
            caps,
            config,
            key,
        });

        {
            let record = machine.record.lock().await;
            if interrupted_activation {
                machine.requeue_interrupted(&record).await;
            }
            if let Some(ending) = &interrupted_deactivation {
                machine.requeue_cancellation(ending).await;
            }
            if was_mid_transition {
                let _ = machine.persist(&record).await;
            }
            info!(status = ?record.status, "emergency state restored");
        }

        machine
    }

    #[must_use]
    pub fn status(&self) -> EmergencyStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EmergencyStatus> {
        self.status_tx.subscribe()
    }

    /// Full record. Waits for any in-flight transition.
    pub async fn record(&self) -> EmergencyRecord {
        self.record.lock().await.clone()
    }

    pub async fn request_activation(
        self: &Arc<Self>,
        source: TriggerSource,
    ) -> Result<ActivationOutcome, EmergencyError> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.activate(source).await })
            .await
            .map_err(|e| EmergencyError::Aborted(e.to_string()))
    }

    pub async fn request_deactivation(self: &Arc<Self>) -> Result<DeactivationOutcome, EmergencyError> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.deactivate().await })
            .await
            .map_err(|e| EmergencyError::Aborted(e.to_string()))
    }

    /// Merge contact ids acknowledged by the backend. Ignored unless
    /// `episode` is still the active one.
    #[instrument(skip(self, contact_ids), fields(episode_id = %episode))]
    pub async fn record_notified_contacts(&self, episode: EpisodeId, contact_ids: Vec<String>) -> bool {
        let mut record = self.record.lock().await;
        if record.status != EmergencyStatusKind::Active || record.episode_id != Some(episode) {
            info!("ignoring contact acknowledgement for a finished episode");
            return false;
        }
        let before = record.notified_contact_ids.len();
        record.notified_contact_ids.extend(contact_ids);
        if record.notified_contact_ids.len() != before {
            let _ = self.persist(&record).await;
        }
        true
    }

    #[instrument(skip(self), fields(source = source.as_str()))]
    async fn activate(&self, source: TriggerSource) -> ActivationOutcome {
        let mut record = self.record.lock().await;
        if record.status != EmergencyStatusKind::Idle {
            info!(status = ?record.status, "activation ignored, emergency already active");
            return ActivationOutcome::AlreadyActive;
        }

        let episode_id = EpisodeId::generate();
        let mut issues = Vec::new();

        record.status = EmergencyStatusKind::Arming;
        record.trigger_source = Some(source);
        record.episode_id = Some(episode_id);
        self.publish(&record);
        if let Err(issue) = self.persist(&record).await {
            issues.push(issue);
        }

        let timeout = self.config.location_timeout();
        let (location, location_error) = match tokio::time::timeout(
            timeout,
            self.caps.geolocation.current_position(timeout),
        )
        .await
        {
            Ok(Ok(position)) => (Some(position), None),
            Ok(Err(e)) => {
                warn!(error = %e, "activating without location");
                (None, Some(e.to_string()))
            }
            Err(_) => {
                warn!(timeout_ms = self.config.location_timeout_ms, "location timed out, activating without it");
                (
                    None,
                    Some(format!(
                        "location timed out after {}ms",
                        self.config.location_timeout_ms
                    )),
                )
            }
        };
        record.last_location = location;

        let now = UnixTimeMs::now();
        let mut queued = Vec::new();
        for (endpoint, payload, step) in [
            (
                Endpoint::RecordEmergencyLocation,
                location_payload(episode_id, source, location.as_ref(), now),
                TransitionStep::QueueLocation,
            ),
            (
                Endpoint::NotifyContacts,
                self.notify_payload(episode_id, source, location.as_ref(), now),
                TransitionStep::QueueNotification,
            ),
        ] {
            if let Some(id) = self.enqueue(endpoint, payload, step, &mut issues).await {
                queued.push(id);
            }
        }

        record.status = EmergencyStatusKind::Active;
        record.activated_at = Some(now);
        self.publish(&record);
        if let Err(issue) = self.persist(&record).await {
            issues.push(issue);
        }

        self.caps.feedback.play_sound(SoundCue::Emergency);
        self.caps.vibrate(&EMERGENCY_HAPTIC_PATTERN);
        self.caps.feedback.notify(
            "Emergency activated",
            "Your emergency contacts are being notified.",
        );

        if issues.is_empty() {
            info!(episode_id = %episode_id, "emergency active");
        } else {
            error!(episode_id = %episode_id, issues = issues.len(), "emergency active with delivery issues");
        }

        ActivationOutcome::Activated(ActivationReport {
            episode_id,
            activated_at: now,
            source,
            location,
            location_error,
            queued,
            issues,
        })
    }

    #[instrument(skip(self))]
    async fn deactivate(&self) -> DeactivationOutcome {
        let mut record = self.record.lock().await;
        if record.status != EmergencyStatusKind::Active {
            info!(status = ?record.status, "deactivation ignored, no active emergency");
            return DeactivationOutcome::NoActiveEmergency;
        }

        let mut issues = Vec::new();
        record.status = EmergencyStatusKind::Deactivating;
        self.publish(&record);
        if let Err(issue) = self.persist(&record).await {
            issues.push(issue);
        }

        let episode_id = record.episode_id;
        let notified: Vec<String> = record.notified_contact_ids.iter().cloned().collect();
        let payload = cancel_payload(&record, UnixTimeMs::now());
        let queued = self
            .enqueue(
                Endpoint::CancelNotify,
                payload,
                TransitionStep::QueueCancellation,
                &mut issues,
            )
            .await;

        record.clear();
        self.publish(&record);
        if let Err(issue) = self.persist(&record).await {
            issues.push(issue);
        }

        self.caps.feedback.stop_sound(SoundCue::Emergency);
        self.caps.feedback.notify(
            "Emergency cancelled",
            "Your contacts will be told you are safe.",
        );
        info!("emergency deactivated");

        DeactivationOutcome::Deactivated(DeactivationReport {
            episode_id,
            notified_contact_ids: notified,
            queued,
            issues,
        })
    }

    async fn requeue_interrupted(&self, record: &EmergencyRecord) {
        let Some(episode_id) = record.episode_id else {
            return;
        };
        let source = record.trigger_source.unwrap_or(TriggerSource::ManualHold);
        let episode = Value::String(episode_id.to_string());
        let pending = self.outbox.peek_all().await;
        let has = |endpoint: &Endpoint| {
            pending
                .iter()
                .any(|e| &e.endpoint == endpoint && e.payload.get("episodeId") == Some(&episode))
        };
        let at = record.activated_at.unwrap_or_else(UnixTimeMs::now);
        let location = record.last_location;

        let mut issues = Vec::new();
        if !has(&Endpoint::RecordEmergencyLocation) {
            let payload = location_payload(episode_id, source, location.as_ref(), at);
            self.enqueue(
                Endpoint::RecordEmergencyLocation,
                payload,
                TransitionStep::QueueLocation,
                &mut issues,
            )
            .await;
        }
        if !has(&Endpoint::NotifyContacts) {
            let payload = self.notify_payload(episode_id, source, location.as_ref(), at);
            self.enqueue(
                Endpoint::NotifyContacts,
                payload,
                TransitionStep::QueueNotification,
                &mut issues,
            )
            .await;
        }
        for issue in issues {
            error!(step = ?issue.step, message = %issue.message, "failed to requeue interrupted activation");
        }
    }

    /// Queue the safe notice for a deactivation that was cut short, unless
    /// it already made it into the outbox.
    async fn requeue_cancellation(&self, record: &EmergencyRecord) {
        let Some(episode_id) = record.episode_id else {
            return;
        };
        let episode = Value::String(episode_id.to_string());
        let already_queued = self.outbox.peek_all().await.iter().any(|e| {
            e.endpoint == Endpoint::CancelNotify && e.payload.get("episodeId") == Some(&episode)
        });
        if already_queued {
            return;
        }

        let mut issues = Vec::new();
        self.enqueue(
            Endpoint::CancelNotify,
            cancel_payload(record, UnixTimeMs::now()),
            TransitionStep::QueueCancellation,
            &mut issues,
        )
        .await;
        if issues.is_empty() {
            info!(episode_id = %episode_id, "requeued safe notice for interrupted deactivation");
        }
        for issue in issues {
            error!(step = ?issue.step, message = %issue.message, "failed to requeue safe notice");
        }
    }

    fn notify_payload(
        &self,
        episode_id: EpisodeId,
        source: TriggerSource,
        location: Option<&Position>,
        now: UnixTimeMs,
    ) -> Value {
        json!({
            "episodeId": episode_id,
            "triggerSource": source,
            "location": location,
            "message": self.config.message,
            "timestamp": now,
        })
    }

    async fn enqueue(
        &self,
        endpoint: Endpoint,
        payload: Value,
        step: TransitionStep,
        issues: &mut Vec<TransitionIssue>,
    ) -> Option<EntryId> {
        match self.outbox.enqueue(endpoint, payload).await {
            Ok(queued) => {
                if !queued.durable {
                    issues.push(TransitionIssue {
                        step,
                        class: ErrorClass::LocalResource,
                        message: "queued in memory only".to_string(),
                    });
                }
                Some(queued.id)
            }
            Err(e) => {
                error!(error = %e, step = ?step, "failed to queue emergency operation");
                issues.push(TransitionIssue {
                    step,
                    class: e.error_class(),
                    message: e.to_string(),
                });
                None
            }
        }
    }

    fn publish(&self, record: &EmergencyRecord) {
        self.status_tx.send_replace(record.snapshot());
    }

    async fn persist(&self, record: &EmergencyRecord) -> Result<(), TransitionIssue> {
        let result = match store::seal(record) {
            Ok(bytes) => self
                .caps
                .storage
                .set(&self.key, bytes)
                .await
                .map_err(|e| (e.error_class(), e.to_string())),
            Err(e) => Err((e.error_class(), e.to_string())),
        };
        result.map_err(|(class, message)| {
            warn!(error = %message, "failed to persist emergency record");
            TransitionIssue {
                step: TransitionStep::PersistRecord,
                class,
                message,
            }
        })
    }
}

fn cancel_payload(record: &EmergencyRecord, now: UnixTimeMs) -> Value {
    json!({
        "episodeId": record.episode_id,
        "notifiedContactIds": record.notified_contact_ids,
        "location": record.last_location,
        "timestamp": now,
    })
}

fn location_payload(
    episode_id: EpisodeId,
    source: TriggerSource,
    location: Option<&Position>,
    now: UnixTimeMs,
) -> Value {
    json!({
        "episodeId": episode_id,
        "triggerSource": source,
        "latitude": location.map(|p| p.coordinate.lat()),
        "longitude": location.map(|p| p.coordinate.lon()),
        "accuracy": location.and_then(|p| p.accuracy_m),
        "timestamp": location.map_or(now, |p| p.timestamp),
        "emergencyType": "panic",
    })
}
