//! User-facing activation triggers.
//!
//! [`PressHoldTrigger`] turns a sustained press into a single activation;
//! [`KeywordTrigger`] does the same for recognised speech.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capabilities::{Capabilities, FeedbackSink, ACKNOWLEDGE_HAPTIC_PATTERN};
use crate::config::VoiceConfig;
use crate::emergency::{
    ActivationOutcome, ActivationReport, DeactivationOutcome, EmergencyError,
    EmergencyStateMachine, TriggerSource,
};

const SIGNAL_CAPACITY: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressStart {
    /// Countdown started.
    Armed,
    /// A countdown is already pending; this press is ignored.
    AlreadyArmed,
    AlreadyActive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressEnd {
    Cancelled,
    /// Nothing pending: never armed, or already fired.
    NotArmed,
}

/// Outcome of a press, delivered asynchronously to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum TriggerSignal {
    Cancelled,
    AlreadyActive,
    Activated(Box<ActivationReport>),
    /// The emergency may still be active (see the report); some part of the
    /// activation did not go through.
    ActivationFailed {
        report: Option<Box<ActivationReport>>,
        message: String,
    },
}

impl TriggerSignal {
    fn from_activation(result: Result<ActivationOutcome, EmergencyError>) -> Self {
        match result {
            Ok(ActivationOutcome::AlreadyActive) => TriggerSignal::AlreadyActive,
            Ok(ActivationOutcome::Activated(report)) if report.issues.is_empty() => {
                TriggerSignal::Activated(Box::new(report))
            }
            Ok(ActivationOutcome::Activated(report)) => {
                let message = report
                    .issues
                    .iter()
                    .map(|i| i.message.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                TriggerSignal::ActivationFailed {
                    report: Some(Box::new(report)),
                    message,
                }
            }
            Err(e) => TriggerSignal::ActivationFailed {
                report: None,
                message: e.to_string(),
            },
        }
    }
}

struct PendingHold {
    generation: u64,
    cancel: oneshot::Sender<()>,
}

pub struct PressHoldTrigger {
    machine: Arc<EmergencyStateMachine>,
    caps: Capabilities,
    hold: Duration,
    pending: Mutex<Option<PendingHold>>,
    generation: AtomicU64,
    fired: AtomicU64,
    signals: broadcast::Sender<TriggerSignal>,
}

impl std::fmt::Debug for PressHoldTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressHoldTrigger")
            .field("hold", &self.hold)
            .field("fired", &self.fired.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PressHoldTrigger {
    #[must_use]
    pub fn new(machine: Arc<EmergencyStateMachine>, caps: Capabilities, hold: Duration) -> Arc<Self> {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Arc::new(Self {
            machine,
            caps,
            hold,
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
            fired: AtomicU64::new(0),
            signals,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerSignal> {
        self.signals.subscribe()
    }

    /// Number of countdowns that ran to completion and requested activation.
    pub fn activation_requests(&self) -> u64 {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn is_armed(&self) -> bool {
        self.slot().is_some()
    }

    /// Must be called from within a Tokio runtime.
    pub fn on_press_start(self: &Arc<Self>) -> PressStart {
        self.caps.vibrate(&ACKNOWLEDGE_HAPTIC_PATTERN);

        if self.machine.status().is_engaged() {
            self.emit(TriggerSignal::AlreadyActive);
            return PressStart::AlreadyActive;
        }

        let mut slot = self.slot();
        if slot.is_some() {
            debug!("press ignored, countdown already pending");
            return PressStart::AlreadyArmed;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, cancelled) = oneshot::channel();
        *slot = Some(PendingHold { generation, cancel });
        drop(slot);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(this.hold) => {}
                _ = cancelled => return,
            }

            // Past this point the countdown has fired and can no longer be
            // cancelled.
            {
                let mut slot = this.slot();
                if !matches!(slot.as_ref(), Some(p) if p.generation == generation) {
                    return;
                }
                *slot = None;
            }

            this.fired.fetch_add(1, Ordering::SeqCst);
            info!(hold_ms = this.hold.as_millis(), "hold sustained, requesting activation");
            let result = this.machine.request_activation(TriggerSource::ManualHold).await;
            this.emit(TriggerSignal::from_activation(result));
        });

        PressStart::Armed
    }

    pub fn on_press_end(&self) -> PressEnd {
        let Some(pending) = self.slot().take() else {
            return PressEnd::NotArmed;
        };
        let _ = pending.cancel.send(());
        debug!("hold released early, countdown cancelled");
        self.emit(TriggerSignal::Cancelled);
        PressEnd::Cancelled
    }

    /// Drop any pending countdown without signalling.
    pub fn disarm(&self) {
        if let Some(pending) = self.slot().take() {
            let _ = pending.cancel.send(());
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<PendingHold>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, signal: TriggerSignal) {
        // No subscribers is fine.
        let _ = self.signals.send(signal);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceCommand {
    /// The explicit activation phrase; activates without confirmation.
    Activate,
    /// A configured keyword; activates only once confirmed.
    Keyword,
    Cancel,
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub enum VoiceOutcome {
    Activation(ActivationOutcome),
    Deactivation(DeactivationOutcome),
    /// Keyword heard; waiting for a yes or no.
    AwaitingConfirmation,
    /// The pending confirmation was answered with anything but yes.
    Declined,
    Ignored,
}

struct PendingConfirmation {
    generation: u64,
    deadline: Instant,
    cancel: oneshot::Sender<()>,
}

/// Maps speech transcripts to activation and cancellation.
///
/// A keyword alone only asks "Do you need help?". The next transcript
/// settles it: yes or confirm activates, anything else declines, and
/// silence past the confirmation timeout declines too.
pub struct KeywordTrigger {
    machine: Arc<EmergencyStateMachine>,
    feedback: Arc<dyn FeedbackSink>,
    keywords: Vec<String>,
    timeout: Duration,
    pending: Mutex<Option<PendingConfirmation>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for KeywordTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeywordTrigger")
            .field("keywords", &self.keywords)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KeywordTrigger {
    pub const ACTIVATE_PHRASE: &'static str = "activate emergency";
    pub const CANCEL_PHRASE: &'static str = "cancel emergency";

    #[must_use]
    pub fn new(
        machine: Arc<EmergencyStateMachine>,
        caps: &Capabilities,
        config: &VoiceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            machine,
            feedback: Arc::clone(&caps.feedback),
            keywords: config
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            timeout: config.confirmation_timeout(),
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn classify(&self, transcript: &str) -> VoiceCommand {
        let text = transcript.to_lowercase();
        if text.contains(Self::CANCEL_PHRASE) {
            return VoiceCommand::Cancel;
        }
        if text.contains(Self::ACTIVATE_PHRASE) {
            return VoiceCommand::Activate;
        }

        let tokens = words(&text);
        let matched = self.keywords.iter().any(|keyword| {
            if keyword.contains(' ') {
                text.contains(keyword.as_str())
            } else {
                tokens.contains(&keyword.as_str())
            }
        });

        if matched {
            VoiceCommand::Keyword
        } else {
            VoiceCommand::None
        }
    }

    pub fn is_awaiting_confirmation(&self) -> bool {
        self.slot().is_some()
    }

    /// Must be called from within a Tokio runtime.
    pub async fn on_transcript(
        self: &Arc<Self>,
        transcript: &str,
    ) -> Result<VoiceOutcome, EmergencyError> {
        let command = self.classify(transcript);
        if command == VoiceCommand::None && transcript.trim().is_empty() {
            return Ok(VoiceOutcome::Ignored);
        }

        if let Some(pending) = self.take_pending() {
            let _ = pending.cancel.send(());
            if Instant::now() < pending.deadline {
                return self.settle(command, transcript).await;
            }
            self.announce_declined("confirmation window already closed");
        }

        match command {
            VoiceCommand::Activate => {
                info!("activation phrase recognised");
                self.activate().await
            }
            VoiceCommand::Keyword if self.machine.status().is_engaged() => self.activate().await,
            VoiceCommand::Keyword => {
                self.ask_for_confirmation();
                Ok(VoiceOutcome::AwaitingConfirmation)
            }
            VoiceCommand::Cancel => self.deactivate().await,
            VoiceCommand::None => {
                debug!("transcript ignored");
                Ok(VoiceOutcome::Ignored)
            }
        }
    }

    /// Drop any pending confirmation without announcing it.
    pub fn disarm(&self) {
        if let Some(pending) = self.take_pending() {
            let _ = pending.cancel.send(());
        }
    }

    async fn settle(
        &self,
        command: VoiceCommand,
        transcript: &str,
    ) -> Result<VoiceOutcome, EmergencyError> {
        match command {
            VoiceCommand::Activate => self.activate().await,
            VoiceCommand::Cancel => {
                self.announce_declined("cancelled by voice");
                Ok(VoiceOutcome::Declined)
            }
            _ if is_affirmative(transcript) => {
                info!("emergency keyword confirmed");
                self.activate().await
            }
            _ => {
                self.announce_declined("not confirmed");
                Ok(VoiceOutcome::Declined)
            }
        }
    }

    fn ask_for_confirmation(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, cancelled) = oneshot::channel();
        *self.slot() = Some(PendingConfirmation {
            generation,
            deadline: Instant::now() + self.timeout,
            cancel,
        });

        info!(timeout_ms = self.timeout.as_millis(), "emergency keyword heard, awaiting confirmation");
        self.feedback.notify(
            "Emergency keyword detected",
            "Do you need help? Say yes to confirm or no to cancel.",
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(this.timeout) => {}
                _ = cancelled => return,
            }
            {
                let mut slot = this.slot();
                if !matches!(slot.as_ref(), Some(p) if p.generation == generation) {
                    return;
                }
                *slot = None;
            }
            this.announce_declined("no answer before timeout");
        });
    }

    fn announce_declined(&self, why: &'static str) {
        info!(why, "keyword activation declined");
        self.feedback
            .notify("Emergency activation canceled", "No emergency was started.");
    }

    async fn activate(&self) -> Result<VoiceOutcome, EmergencyError> {
        self.machine
            .request_activation(TriggerSource::VoiceKeyword)
            .await
            .map(VoiceOutcome::Activation)
    }

    async fn deactivate(&self) -> Result<VoiceOutcome, EmergencyError> {
        info!("cancel command recognised");
        self.machine
            .request_deactivation()
            .await
            .map(VoiceOutcome::Deactivation)
    }

    fn take_pending(&self) -> Option<PendingConfirmation> {
        self.slot().take()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<PendingConfirmation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

fn is_affirmative(transcript: &str) -> bool {
    let text = transcript.to_lowercase();
    words(&text)
        .iter()
        .any(|w| matches!(*w, "yes" | "yeah" | "confirm" | "confirmed"))
}

impl Drop for PressHoldTrigger {
    fn drop(&mut self) {
        if self.is_armed() {
            warn!("trigger dropped with a pending countdown");
        }
    }
}
