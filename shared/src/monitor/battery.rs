use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{MonitorEvent, ThresholdMonitorState, Transition};
use crate::capabilities::{BatteryProvider, BatteryReading, DeviceError, FeedbackSink, SoundCue};
use crate::config::BatteryConfig;
use crate::emergency::EmergencyStatus;
use crate::outbox::{Endpoint, Outbox};
use crate::UnixTimeMs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryTier {
    /// Local warning only.
    Low,
    /// Local warning plus a contact notification through the outbox.
    Critical,
}

pub struct BatteryMonitor {
    config: BatteryConfig,
    low: ThresholdMonitorState,
    critical: ThresholdMonitorState,
    outbox: Arc<Outbox>,
    feedback: Arc<dyn FeedbackSink>,
    emergency: watch::Receiver<EmergencyStatus>,
}

impl std::fmt::Debug for BatteryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatteryMonitor")
            .field("low", &self.low)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

impl BatteryMonitor {
    pub fn new(
        config: BatteryConfig,
        outbox: Arc<Outbox>,
        feedback: Arc<dyn FeedbackSink>,
        emergency: watch::Receiver<EmergencyStatus>,
    ) -> Self {
        Self {
            config,
            low: ThresholdMonitorState::default(),
            critical: ThresholdMonitorState::default(),
            outbox,
            feedback,
            emergency,
        }
    }

    /// Read the provider, sample the result, then queue the reading to the
    /// battery log when enabled.
    pub async fn tick(
        &mut self,
        provider: &dyn BatteryProvider,
    ) -> Result<Vec<MonitorEvent>, DeviceError> {
        let reading = provider.read().await?;
        let events = self.sample(reading).await;
        if self.config.log_readings {
            self.log_reading(reading).await;
        }
        Ok(events)
    }

    async fn log_reading(&self, reading: BatteryReading) {
        let payload = json!({
            "batteryLevel": reading.level_percent,
            "isCharging": reading.charging,
            "timestamp": UnixTimeMs::now(),
        });
        if let Err(e) = self.outbox.enqueue(Endpoint::BatteryLog, payload).await {
            debug!(error = %e, "battery reading not logged");
        }
    }

    #[instrument(skip(self), fields(level = reading.level_percent, charging = reading.charging))]
    pub async fn sample(&mut self, reading: BatteryReading) -> Vec<MonitorEvent> {
        let level = reading.level_percent;
        let discharging = !reading.charging;

        let critical = self.critical.observe(
            level,
            discharging && level <= self.config.critical_threshold_percent,
        );
        let low = self
            .low
            .observe(level, discharging && level <= self.config.low_threshold_percent);

        let mut events = Vec::new();

        if let Some(transition) = critical {
            events.push(MonitorEvent::Battery {
                tier: BatteryTier::Critical,
                transition,
                level_percent: level,
            });
            if transition == Transition::Entered {
                self.on_critical(reading).await;
            } else {
                info!("battery recovered from critical");
            }
        }

        if let Some(transition) = low {
            events.push(MonitorEvent::Battery {
                tier: BatteryTier::Low,
                transition,
                level_percent: level,
            });
            // A sample that is already critical gets the critical warning only.
            if transition == Transition::Entered && critical != Some(Transition::Entered) {
                self.feedback.notify(
                    "Battery low",
                    &format!("{level:.0}% remaining. Consider charging your device."),
                );
            }
        }

        if events.is_empty() {
            debug!("battery sample within current excursion state");
        }
        events
    }

    async fn on_critical(&self, reading: BatteryReading) {
        let level = reading.level_percent;
        warn!(level, "battery critical");
        self.feedback.notify(
            "Battery critical",
            &format!("{level:.0}% remaining. Your emergency contacts will be notified."),
        );
        self.feedback.play_sound(SoundCue::Notification);

        let emergency_active = self.emergency.borrow().is_active();
        let payload = json!({
            "batteryLevel": level,
            "charging": reading.charging,
            "emergencyActive": emergency_active,
            "timestamp": UnixTimeMs::now(),
        });
        if let Err(e) = self.outbox.enqueue(Endpoint::BatteryCritical, payload).await {
            warn!(error = %e, "failed to queue battery-critical notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{RecordingFeedback, ScriptedBattery};
    use crate::capabilities::MemoryKvStore;
    use crate::config::OutboxConfig;

    async fn monitor() -> (BatteryMonitor, Arc<Outbox>, Arc<RecordingFeedback>) {
        let outbox = Arc::new(
            Outbox::open(Arc::new(MemoryKvStore::new()), OutboxConfig::default())
                .await
                .unwrap(),
        );
        let feedback = Arc::new(RecordingFeedback::default());
        let (_tx, rx) = watch::channel(EmergencyStatus::default());
        let monitor = BatteryMonitor::new(
            BatteryConfig::default(),
            outbox.clone(),
            feedback.clone(),
            rx,
        );
        (monitor, outbox, feedback)
    }

    fn critical_entries(events: &[MonitorEvent]) -> usize {
        events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    MonitorEvent::Battery {
                        tier: BatteryTier::Critical,
                        transition: Transition::Entered,
                        ..
                    }
                )
            })
            .count()
    }

    #[tokio::test]
    async fn critical_excursion_queues_once() {
        let (mut monitor, outbox, feedback) = monitor().await;

        let mut entered = 0;
        for level in [9.0, 8.0, 5.0, 3.0] {
            entered += critical_entries(&monitor.sample(BatteryReading::new(level, false)).await);
        }
        assert_eq!(entered, 1);
        assert_eq!(outbox.len().await, 1);
        assert_eq!(outbox.peek_all().await[0].endpoint, Endpoint::BatteryCritical);
        assert_eq!(feedback.notifications(), vec!["Battery critical"]);
    }

    #[tokio::test]
    async fn charging_is_not_critical() {
        let (mut monitor, outbox, _) = monitor().await;
        let events = monitor.sample(BatteryReading::new(4.0, true)).await;
        assert!(events.is_empty());
        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn low_tier_warns_without_queueing() {
        let (mut monitor, outbox, feedback) = monitor().await;
        let events = monitor.sample(BatteryReading::new(18.0, false)).await;
        assert_eq!(
            events,
            vec![MonitorEvent::Battery {
                tier: BatteryTier::Low,
                transition: Transition::Entered,
                level_percent: 18.0
            }]
        );
        assert!(outbox.is_empty().await);
        assert_eq!(feedback.notifications(), vec!["Battery low"]);

        // Dropping further into critical adds the critical tier only.
        let events = monitor.sample(BatteryReading::new(9.0, false)).await;
        assert_eq!(critical_entries(&events), 1);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn exit_and_reentry_report_again() {
        let (mut monitor, outbox, _) = monitor().await;
        monitor.sample(BatteryReading::new(9.0, false)).await;
        let exit = monitor.sample(BatteryReading::new(50.0, false)).await;
        assert!(exit.iter().any(|e| matches!(
            e,
            MonitorEvent::Battery {
                tier: BatteryTier::Critical,
                transition: Transition::Exited,
                ..
            }
        )));
        let reentry = monitor.sample(BatteryReading::new(9.0, false)).await;
        assert_eq!(critical_entries(&reentry), 1);
        assert_eq!(outbox.len().await, 2);
    }

    #[tokio::test]
    async fn tick_reads_provider() {
        let (mut monitor, outbox, _) = monitor().await;
        let battery = ScriptedBattery::default();
        battery.set(7.0, false);
        let events = monitor.tick(&battery).await.unwrap();
        assert_eq!(critical_entries(&events), 1);

        battery.set_unavailable();
        assert!(monitor.tick(&battery).await.is_err());
        // Failed reads log nothing.
        assert_eq!(outbox.len().await, 2);
    }

    #[tokio::test]
    async fn every_polled_reading_is_logged() {
        let (mut monitor, outbox, _) = monitor().await;
        let battery = ScriptedBattery::default();
        for (level, charging) in [(80.0, false), (79.5, true), (79.0, false)] {
            battery.set(level, charging);
            assert!(monitor.tick(&battery).await.unwrap().is_empty());
        }

        let logged = outbox.peek_all().await;
        assert_eq!(logged.len(), 3);
        assert!(logged.iter().all(|e| e.endpoint == Endpoint::BatteryLog));
        assert_eq!(logged[1].payload["batteryLevel"], 79.5);
        assert_eq!(logged[1].payload["isCharging"], true);
        assert!(logged[1].payload["timestamp"].is_number());
    }

    #[tokio::test]
    async fn reading_log_can_be_disabled() {
        let outbox = Arc::new(
            Outbox::open(Arc::new(MemoryKvStore::new()), OutboxConfig::default())
                .await
                .unwrap(),
        );
        let (_tx, rx) = watch::channel(EmergencyStatus::default());
        let mut monitor = BatteryMonitor::new(
            BatteryConfig {
                log_readings: false,
                ..BatteryConfig::default()
            },
            outbox.clone(),
            Arc::new(RecordingFeedback::default()),
            rx,
        );
        let battery = ScriptedBattery::default();
        battery.set(60.0, false);
        monitor.tick(&battery).await.unwrap();
        assert!(outbox.is_empty().await);
    }
}
