use proptest::prelude::*;
use safety_core::capabilities::testing::{RecordingFeedback, TestHarness};
use safety_core::capabilities::{BatteryReading, MemoryKvStore};
use safety_core::config::{BatteryConfig, EmergencyConfig, OutboxConfig};
use safety_core::monitor::{BatteryMonitor, BatteryTier, MonitorEvent, Transition};
use safety_core::{EmergencyStateMachine, EmergencyStatus, EmergencyStatusKind, Outbox, PressHoldTrigger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const HOLD_MS: u64 = 1000;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

struct Rig {
    trigger: Arc<PressHoldTrigger>,
    machine: Arc<EmergencyStateMachine>,
    outbox: Arc<Outbox>,
}

async fn rig(harness: &TestHarness) -> Rig {
    let caps = harness.capabilities();
    let outbox = Arc::new(
        Outbox::open(caps.storage.clone(), OutboxConfig::default())
            .await
            .unwrap(),
    );
    let machine =
        EmergencyStateMachine::restore(outbox.clone(), caps.clone(), EmergencyConfig::default())
            .await;
    let trigger = PressHoldTrigger::new(machine.clone(), caps, Duration::from_millis(HOLD_MS));
    Rig {
        trigger,
        machine,
        outbox,
    }
}

/// Press, hold for `hold` ms, release, wait `gap` ms.
async fn play(trigger: &Arc<PressHoldTrigger>, presses: &[(u64, u64)]) {
    for &(hold, gap) in presses {
        trigger.on_press_start();
        tokio::time::sleep(Duration::from_millis(hold)).await;
        trigger.on_press_end();
        tokio::time::sleep(Duration::from_millis(gap)).await;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn short_presses_never_activate(
        presses in prop::collection::vec((0u64..990, 0u64..2000), 0..20)
    ) {
        let rt = paused_runtime();
        let (requests, status, queued) = rt.block_on(async {
            let harness = TestHarness::new();
            let rig = rig(&harness).await;
            play(&rig.trigger, &presses).await;
            (
                rig.trigger.activation_requests(),
                rig.machine.status().status,
                rig.outbox.len().await,
            )
        });
        prop_assert_eq!(requests, 0);
        prop_assert_eq!(status, EmergencyStatusKind::Idle);
        prop_assert_eq!(queued, 0);
    }

    #[test]
    fn sustained_holds_activate_exactly_once(
        presses in prop::collection::vec(
            (prop_oneof![0u64..990, 1010u64..3000], 0u64..2000),
            1..12
        )
    ) {
        let any_sustained = presses.iter().any(|&(hold, _)| hold >= HOLD_MS);
        let rt = paused_runtime();
        let (requests, status, queued) = rt.block_on(async {
            let harness = TestHarness::new();
            let rig = rig(&harness).await;
            play(&rig.trigger, &presses).await;
            (
                rig.trigger.activation_requests(),
                rig.machine.status().status,
                rig.outbox.len().await,
            )
        });
        prop_assert_eq!(requests, u64::from(any_sustained));
        if any_sustained {
            prop_assert_eq!(status, EmergencyStatusKind::Active);
            prop_assert_eq!(queued, 2);
        } else {
            prop_assert_eq!(status, EmergencyStatusKind::Idle);
            prop_assert_eq!(queued, 0);
        }
    }

    #[test]
    fn battery_excursions_report_each_edge_once(
        levels in prop::collection::vec(0.0f64..100.0, 1..60)
    ) {
        let critical = BatteryConfig::default().critical_threshold_percent;
        let mut below = false;
        let (mut expected_entries, mut expected_exits) = (0usize, 0usize);
        for &level in &levels {
            let now_below = level <= critical;
            if now_below && !below {
                expected_entries += 1;
            } else if !now_below && below {
                expected_exits += 1;
            }
            below = now_below;
        }

        let rt = paused_runtime();
        let (entries, exits, queued) = rt.block_on(async {
            let outbox = Arc::new(
                Outbox::open(Arc::new(MemoryKvStore::new()), OutboxConfig::default())
                    .await
                    .unwrap(),
            );
            let (_status_tx, status_rx) = watch::channel(EmergencyStatus::default());
            let mut monitor = BatteryMonitor::new(
                BatteryConfig::default(),
                outbox.clone(),
                Arc::new(RecordingFeedback::default()),
                status_rx,
            );

            let (mut entries, mut exits) = (0, 0);
            for &level in &levels {
                for event in monitor.sample(BatteryReading::new(level, false)).await {
                    if let MonitorEvent::Battery { tier: BatteryTier::Critical, transition, .. } = event {
                        match transition {
                            Transition::Entered => entries += 1,
                            Transition::Exited => exits += 1,
                        }
                    }
                }
            }
            (entries, exits, outbox.len().await)
        });

        prop_assert_eq!(entries, expected_entries);
        prop_assert_eq!(exits, expected_exits);
        prop_assert_eq!(queued, expected_entries);
    }
}
