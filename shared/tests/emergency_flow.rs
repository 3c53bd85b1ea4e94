use safety_core::capabilities::testing::{FeedbackCall, TestHarness};
use safety_core::capabilities::{ApiResponse, SoundCue};
use safety_core::outbox::DeadLetterReason;
use safety_core::{
    CoreConfig, DeactivationOutcome, Endpoint, EmergencyStatusKind, Outbox, PressEnd, PressStart,
    SafetyCore, TriggerSignal, TriggerSource,
};
use serde_json::json;
use std::time::Duration;

async fn start(harness: &TestHarness) -> SafetyCore {
    let mut config = CoreConfig::default();
    config.battery.log_readings = false;
    SafetyCore::start(config, harness.capabilities())
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn hold_activates_queues_and_records_contacts() {
    let harness = TestHarness::new();
    harness.geolocation.set_position(10.0, 20.0);
    harness.geolocation.set_delay(Duration::from_millis(200));
    harness.connectivity.set_online(false);
    harness.remote.push_for(
        &Endpoint::NotifyContacts,
        Ok(ApiResponse::with_body(json!({
            "notifiedCount": 2,
            "notifiedContactIds": ["alice", "bob"],
        }))),
    );

    let core = start(&harness).await;
    let mut signals = core.subscribe_trigger();

    assert_eq!(core.on_press_start(), PressStart::Armed);
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let TriggerSignal::Activated(report) = signals.recv().await.unwrap() else {
        panic!("expected a clean activation");
    };
    assert_eq!(report.source, TriggerSource::ManualHold);
    let location = report.location.expect("location within timeout");
    assert!((location.coordinate.lat() - 10.0).abs() < 1e-9);
    assert!((location.coordinate.lon() - 20.0).abs() < 1e-9);

    let status = core.emergency_status();
    assert_eq!(status.status, EmergencyStatusKind::Active);
    assert!(status.activated_at.is_some());

    // Releasing after the countdown fired changes nothing.
    assert_eq!(core.on_press_end(), PressEnd::NotArmed);

    let entries = core.pending_entries().await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].endpoint, Endpoint::RecordEmergencyLocation);
    assert_eq!(entries[0].payload["latitude"], 10.0);
    assert_eq!(entries[0].payload["longitude"], 20.0);
    assert_eq!(entries[1].endpoint, Endpoint::NotifyContacts);

    harness.connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(core.queue_length().await, 0);
    let record = core.emergency_record().await;
    assert_eq!(
        record.notified_contact_ids.iter().cloned().collect::<Vec<_>>(),
        vec!["alice".to_string(), "bob".to_string()]
    );

    let DeactivationOutcome::Deactivated(report) = core.request_deactivation().await.unwrap()
    else {
        panic!("expected deactivation");
    };
    assert_eq!(report.notified_contact_ids, vec!["alice", "bob"]);
    assert_eq!(core.emergency_status().status, EmergencyStatusKind::Idle);
    assert!(core.emergency_record().await.notified_contact_ids.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancel = harness
        .remote
        .calls()
        .into_iter()
        .find(|(endpoint, _)| *endpoint == Endpoint::CancelNotify)
        .expect("cancel notice delivered");
    assert_eq!(cancel.1["notifiedContactIds"], json!(["alice", "bob"]));

    let calls = harness.feedback.calls();
    assert!(calls.contains(&FeedbackCall::PlaySound(SoundCue::Emergency)));
    assert!(calls.contains(&FeedbackCall::StopSound(SoundCue::Emergency)));

    core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn early_release_cancels() {
    let harness = TestHarness::new();
    harness.connectivity.set_online(false);
    let core = start(&harness).await;
    let mut signals = core.subscribe_trigger();

    assert_eq!(core.on_press_start(), PressStart::Armed);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(core.on_press_end(), PressEnd::Cancelled);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(signals.recv().await.unwrap(), TriggerSignal::Cancelled);
    assert!(signals.try_recv().is_err());
    assert_eq!(core.emergency_status().status, EmergencyStatusKind::Idle);
    assert_eq!(core.queue_length().await, 0);
    core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn location_timeout_does_not_block_activation() {
    let harness = TestHarness::new();
    harness.geolocation.set_position(10.0, 20.0);
    harness.geolocation.set_delay(Duration::from_secs(60));
    harness.connectivity.set_online(false);
    let core = start(&harness).await;
    let mut signals = core.subscribe_trigger();

    core.on_press_start();
    let signal = tokio::time::timeout(Duration::from_secs(15), signals.recv())
        .await
        .unwrap()
        .unwrap();
    let TriggerSignal::Activated(report) = signal else {
        panic!("expected activation, got {signal:?}");
    };
    assert!(report.location.is_none());
    assert!(report.location_error.is_some());
    assert_eq!(core.emergency_status().status, EmergencyStatusKind::Active);

    let entries = core.pending_entries().await;
    assert_eq!(entries.len(), 2);
    assert!(entries[0].payload["latitude"].is_null());
    core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn press_while_active_reports_already_active() {
    let harness = TestHarness::new();
    harness.connectivity.set_online(false);
    let core = start(&harness).await;

    core.handle_transcript("sos").await.unwrap();
    core.handle_transcript("yes").await.unwrap();
    let mut signals = core.subscribe_trigger();

    assert_eq!(core.on_press_start(), PressStart::AlreadyActive);
    assert_eq!(signals.recv().await.unwrap(), TriggerSignal::AlreadyActive);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(core.queue_length().await, 2);
    core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn storage_failure_still_activates() {
    let harness = TestHarness::new();
    harness.connectivity.set_online(false);
    let core = start(&harness).await;
    let mut signals = core.subscribe_trigger();
    harness.storage.set_fail_writes(true);

    core.on_press_start();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let TriggerSignal::ActivationFailed { report, message } = signals.recv().await.unwrap() else {
        panic!("expected a degraded activation");
    };
    assert!(!message.is_empty());
    assert!(report.is_some());
    assert_eq!(core.emergency_status().status, EmergencyStatusKind::Active);
    assert_eq!(core.queue_length().await, 2);

    harness.storage.set_fail_writes(false);
    core.shutdown().await;

    let restarted = harness.restarted();
    let core = start(&restarted).await;
    assert_eq!(core.queue_length().await, 2);
    core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn activation_survives_restart() {
    let harness = TestHarness::new();
    harness.connectivity.set_online(false);
    let core = start(&harness).await;
    core.handle_transcript("activate emergency").await.unwrap();
    let before = core.emergency_status();
    core.shutdown().await;
    drop(core);

    let restarted = harness.restarted();
    restarted.connectivity.set_online(false);
    let core = start(&restarted).await;
    let after = core.emergency_status();
    assert_eq!(after.status, EmergencyStatusKind::Active);
    assert_eq!(after.episode_id, before.episode_id);
    assert_eq!(after.trigger_source, Some(TriggerSource::VoiceKeyword));
    assert_eq!(core.queue_length().await, 2);
    core.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_outbox_still_takes_the_emergency() {
    let harness = TestHarness::new();
    harness.connectivity.set_online(false);
    let mut config = CoreConfig::default();
    config.battery.log_readings = false;
    config.outbox.max_entries = 2;

    {
        let outbox = Outbox::open(harness.storage.clone(), config.outbox.clone())
            .await
            .unwrap();
        for zone in ["home", "work"] {
            outbox
                .enqueue(
                    Endpoint::ZoneTransition,
                    json!({ "zoneId": zone, "transition": "exit" }),
                )
                .await
                .unwrap();
        }
    }

    let core = SafetyCore::start(config, harness.capabilities()).await.unwrap();
    core.handle_transcript("activate emergency").await.unwrap();

    let endpoints: Vec<_> = core
        .pending_entries()
        .await
        .into_iter()
        .map(|e| e.endpoint)
        .collect();
    assert_eq!(
        endpoints,
        vec![Endpoint::RecordEmergencyLocation, Endpoint::NotifyContacts]
    );
    let displaced = core.dead_letters().await;
    assert_eq!(displaced.len(), 2);
    assert!(displaced
        .iter()
        .all(|d| d.reason == DeadLetterReason::Evicted));
    core.shutdown().await;
}
