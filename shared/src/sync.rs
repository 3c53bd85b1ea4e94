//! Drains the outbox against the remote API while the device is online.
//!
//! One drain cycle at a time. Each due entry is attempted once per cycle in
//! FIFO order; a failure is recorded and the cycle moves on to the next
//! entry.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ApiResponse, Capabilities, ConnectivityObserver, FeedbackSink, RemoteApi};
use crate::emergency::{EmergencyStateMachine, EpisodeId};
use crate::outbox::{
    DeadLetter, DeliveryFailure, Endpoint, FailureDisposition, Outbox, OutboxEntry,
};
use crate::UnixTimeMs;

const FAILURE_CAPACITY: usize = 32;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Entries still waiting out their backoff.
    pub deferred: usize,
    /// Connectivity dropped mid-cycle.
    pub interrupted: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainSkipped {
    Offline,
    AlreadySyncing,
}

/// Clears the syncing flag however the cycle ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncDrainer {
    outbox: Arc<Outbox>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<dyn ConnectivityObserver>,
    feedback: Arc<dyn FeedbackSink>,
    machine: Arc<EmergencyStateMachine>,
    request_timeout: Duration,
    syncing: AtomicBool,
    undelivered: Mutex<Vec<DeadLetter>>,
    failures: broadcast::Sender<DeadLetter>,
}

impl std::fmt::Debug for SyncDrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDrainer")
            .field("syncing", &self.is_syncing())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl SyncDrainer {
    #[must_use]
    pub fn new(
        outbox: Arc<Outbox>,
        caps: &Capabilities,
        machine: Arc<EmergencyStateMachine>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let (failures, _) = broadcast::channel(FAILURE_CAPACITY);
        Arc::new(Self {
            outbox,
            remote: Arc::clone(&caps.remote),
            connectivity: Arc::clone(&caps.connectivity),
            feedback: Arc::clone(&caps.feedback),
            machine,
            request_timeout,
            syncing: AtomicBool::new(false),
            undelivered: Mutex::new(Vec::new()),
            failures,
        })
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Dead-lettered entries surfaced since the last call, at most the
    /// newest 32.
    pub fn take_delivery_failures(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.undelivered.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<DeadLetter> {
        self.failures.subscribe()
    }

    /// Run a drain cycle on its own task.
    pub fn spawn_drain(self: &Arc<Self>) -> JoinHandle<Result<DrainReport, DrainSkipped>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drain().await })
    }

    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainReport, DrainSkipped> {
        if !self.connectivity.current_status() {
            debug!("offline, drain skipped");
            return Err(DrainSkipped::Offline);
        }
        let Some(_guard) = SyncGuard::acquire(&self.syncing) else {
            debug!("drain already running");
            return Err(DrainSkipped::AlreadySyncing);
        };

        if let Err(e) = self.outbox.flush().await {
            warn!(error = %e, "outbox still not persisted");
        }

        let now = UnixTimeMs::now();
        let queued = self.outbox.len().await;
        let due = self.outbox.peek_due(now).await;
        let mut report = DrainReport {
            deferred: queued.saturating_sub(due.len()),
            ..DrainReport::default()
        };

        for entry in due {
            if !self.connectivity.current_status() {
                info!("went offline, stopping drain");
                report.interrupted = true;
                break;
            }
            report.attempted += 1;
            self.deliver(entry, &mut report).await;
        }

        self.surface_dead_letters().await;

        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            deferred = report.deferred,
            "drain cycle finished"
        );
        Ok(report)
    }

    async fn deliver(&self, entry: OutboxEntry, report: &mut DrainReport) {
        let attempt =
            tokio::time::timeout(self.request_timeout, self.remote.send(&entry.endpoint, &entry.payload))
                .await;

        let failure = match attempt {
            Ok(Ok(response)) => {
                match self.outbox.mark_succeeded(entry.id).await {
                    Ok(_) => report.delivered += 1,
                    Err(e) => warn!(entry_id = %entry.id, error = %e, "delivered entry vanished"),
                }
                if entry.endpoint == Endpoint::NotifyContacts {
                    self.acknowledge_contacts(&entry, &response).await;
                }
                return;
            }
            Ok(Err(e)) => DeliveryFailure::new(e.error_class(), e.to_string()),
            Err(_) => DeliveryFailure::transient(format!(
                "timeout after {}ms",
                self.request_timeout.as_millis()
            )),
        };

        warn!(
            entry_id = %entry.id,
            endpoint = %entry.endpoint,
            class = %failure.class,
            error = %failure.message,
            "delivery failed"
        );
        report.failed += 1;
        match self.outbox.mark_failed(entry.id, failure).await {
            Ok(FailureDisposition::DeadLettered { .. }) => report.dead_lettered += 1,
            Ok(FailureDisposition::WillRetry { .. }) => {}
            Err(e) => warn!(entry_id = %entry.id, error = %e, "failed entry vanished"),
        }
    }

    async fn acknowledge_contacts(&self, entry: &OutboxEntry, response: &ApiResponse) {
        let Some(episode) = entry
            .payload
            .get("episodeId")
            .and_then(Value::as_str)
            .and_then(EpisodeId::parse)
        else {
            return;
        };
        let ids: Vec<String> = response
            .body
            .as_ref()
            .and_then(|b| b.get("notifiedContactIds").or_else(|| b.get("notifiedContacts")))
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if ids.is_empty() {
            return;
        }
        self.machine.record_notified_contacts(episode, ids).await;
    }

    async fn surface_dead_letters(&self) {
        let newly_dead = self.outbox.take_unsurfaced_dead_letters().await;
        if newly_dead.is_empty() {
            return;
        }

        for dead in &newly_dead {
            let reason = dead.entry.last_error.as_deref().unwrap_or("unknown error");
            self.feedback.notify(
                "Delivery failed",
                &format!("Could not deliver {}: {reason}", dead.entry.endpoint),
            );
            let _ = self.failures.send(dead.clone());
        }
        let mut undelivered = self.undelivered.lock().unwrap_or_else(PoisonError::into_inner);
        undelivered.extend(newly_dead);
        let excess = undelivered.len().saturating_sub(FAILURE_CAPACITY);
        undelivered.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::TestHarness;
    use crate::capabilities::ApiError;
    use crate::config::{EmergencyConfig, OutboxConfig};
    use crate::emergency::{ActivationOutcome, TriggerSource};
    use serde_json::json;

    async fn setup(
        harness: &TestHarness,
    ) -> (Arc<SyncDrainer>, Arc<Outbox>, Arc<EmergencyStateMachine>) {
        let caps = harness.capabilities();
        let outbox = Arc::new(
            Outbox::open(caps.storage.clone(), OutboxConfig::default())
                .await
                .unwrap(),
        );
        let machine =
            EmergencyStateMachine::restore(outbox.clone(), caps.clone(), EmergencyConfig::default())
                .await;
        let drainer = SyncDrainer::new(outbox.clone(), &caps, machine.clone(), Duration::from_secs(30));
        (drainer, outbox, machine)
    }

    #[tokio::test]
    async fn offline_drain_does_nothing() {
        let harness = TestHarness::new();
        harness.connectivity.set_online(false);
        let (drainer, outbox, _) = setup(&harness).await;
        outbox.enqueue(Endpoint::NotifyContacts, json!({})).await.unwrap();

        assert_eq!(drainer.drain().await, Err(DrainSkipped::Offline));
        assert!(!drainer.is_syncing());
        assert_eq!(outbox.peek_all().await[0].retry_count, 0);
        assert_eq!(harness.remote.call_count(), 0);
    }

    #[tokio::test]
    async fn failures_do_not_block_later_entries() {
        let harness = TestHarness::new();
        let (drainer, outbox, _) = setup(&harness).await;
        for i in 0..3 {
            outbox
                .enqueue(Endpoint::Custom("report".into()), json!({ "i": i }))
                .await
                .unwrap();
        }
        harness.remote.push_result(Ok(ApiResponse::ok()));
        harness
            .remote
            .push_result(Err(ApiError::from_status(503, "unavailable")));
        harness.remote.push_result(Ok(ApiResponse::ok()));

        let report = drainer.drain().await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);

        let left = outbox.peek_all().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].payload, json!({ "i": 1 }));
        assert_eq!(left[0].retry_count, 1);
        assert!(!drainer.is_syncing());
    }

    #[tokio::test]
    async fn delivery_order_is_fifo() {
        let harness = TestHarness::new();
        let (drainer, outbox, _) = setup(&harness).await;
        for name in ["first", "second", "third"] {
            outbox
                .enqueue(Endpoint::Custom(name.into()), json!({}))
                .await
                .unwrap();
        }
        drainer.drain().await.unwrap();
        let order: Vec<_> = harness
            .remote
            .calls()
            .into_iter()
            .map(|(e, _)| e.to_string())
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_drains_are_rejected() {
        let harness = TestHarness::new();
        harness.remote.set_delay(Duration::from_millis(100));
        let (drainer, outbox, _) = setup(&harness).await;
        outbox.enqueue(Endpoint::NotifyContacts, json!({})).await.unwrap();

        let running = drainer.spawn_drain();
        tokio::task::yield_now().await;
        assert!(drainer.is_syncing());
        assert_eq!(drainer.drain().await, Err(DrainSkipped::AlreadySyncing));

        running.await.unwrap().unwrap();
        assert!(!drainer.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_remote_times_out_as_transient() {
        let harness = TestHarness::new();
        harness.remote.set_delay(Duration::from_secs(120));
        let (drainer, outbox, _) = setup(&harness).await;
        outbox.enqueue(Endpoint::NotifyContacts, json!({})).await.unwrap();

        let report = drainer.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        let entry = &outbox.peek_all().await[0];
        assert_eq!(entry.retry_count, 1);
        assert!(entry.last_error.as_deref().unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn dead_letters_are_surfaced_once() {
        let harness = TestHarness::new();
        let (drainer, outbox, _) = setup(&harness).await;
        let mut failures = drainer.subscribe_failures();
        outbox
            .enqueue(Endpoint::BatteryCritical, json!({}))
            .await
            .unwrap();
        harness
            .remote
            .push_result(Err(ApiError::from_status(422, "invalid")));

        let report = drainer.drain().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert!(outbox.is_empty().await);
        assert_eq!(harness.feedback.notifications(), vec!["Delivery failed"]);
        assert_eq!(failures.recv().await.unwrap().entry.endpoint, Endpoint::BatteryCritical);

        assert_eq!(drainer.take_delivery_failures().len(), 1);
        assert!(drainer.take_delivery_failures().is_empty());

        drainer.drain().await.unwrap();
        assert_eq!(harness.feedback.notifications().len(), 1);
    }

    #[tokio::test]
    async fn unclaimed_failures_keep_only_newest() {
        let harness = TestHarness::new();
        let (drainer, outbox, _) = setup(&harness).await;
        let total = FAILURE_CAPACITY + 8;
        for i in 0..total {
            outbox
                .enqueue(Endpoint::Custom("report".into()), json!({ "i": i }))
                .await
                .unwrap();
            harness
                .remote
                .push_result(Err(ApiError::from_status(400, "rejected")));
        }

        let report = drainer.drain().await.unwrap();
        assert_eq!(report.dead_lettered, total);

        let failures = drainer.take_delivery_failures();
        assert_eq!(failures.len(), FAILURE_CAPACITY);
        assert_eq!(failures[0].entry.payload, json!({ "i": 8 }));
        assert_eq!(
            failures[FAILURE_CAPACITY - 1].entry.payload,
            json!({ "i": total - 1 })
        );
    }

    #[tokio::test]
    async fn contact_acknowledgement_reaches_state_machine() {
        let harness = TestHarness::new();
        let (drainer, _, machine) = setup(&harness).await;
        let ActivationOutcome::Activated(_) = machine
            .request_activation(TriggerSource::ManualHold)
            .await
            .unwrap()
        else {
            panic!("expected activation");
        };
        harness.remote.push_for(
            &Endpoint::NotifyContacts,
            Ok(ApiResponse::with_body(json!({ "notifiedContactIds": ["c1", "c2"] }))),
        );

        drainer.drain().await.unwrap();
        let record = machine.record().await;
        assert_eq!(
            record.notified_contact_ids.into_iter().collect::<Vec<_>>(),
            vec!["c1", "c2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_mid_cycle_stops() {
        let harness = TestHarness::new();
        harness.remote.set_delay(Duration::from_millis(100));
        let (drainer, outbox, _) = setup(&harness).await;
        outbox.enqueue(Endpoint::NotifyContacts, json!({})).await.unwrap();
        outbox.enqueue(Endpoint::CancelNotify, json!({})).await.unwrap();

        let running = drainer.spawn_drain();
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.connectivity.set_online(false);

        let report = running.await.unwrap().unwrap();
        assert!(report.interrupted);
        assert_eq!(report.attempted, 1);
        assert_eq!(harness.remote.call_count(), 1);

        let left = outbox.peek_all().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].endpoint, Endpoint::CancelNotify);
        assert_eq!(left[0].retry_count, 0);
    }
}
