//! Fixed-cadence telemetry push.
//!
//! Every tick takes one snapshot, encodes each frame once, and pushes the
//! same bytes to every subscriber. Frames go out on every tick even when
//! nothing changed; apps use the steady cadence as a liveness signal.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::gatt::CharacteristicId;
use crate::protocol;
use crate::session::SessionRegistry;
use crate::telemetry::Treadmill;
use crate::transport::GattTransport;

pub struct NotificationScheduler {
    sessions: Arc<SessionRegistry>,
    treadmill: Arc<dyn Treadmill>,
    transport: Arc<dyn GattTransport>,
    interval: Duration,
}

impl NotificationScheduler {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        treadmill: Arc<dyn Treadmill>,
        transport: Arc<dyn GattTransport>,
        interval: Duration,
    ) -> Self {
        Self { sessions, treadmill, transport, interval }
    }

    /// Run one tick. Returns how many frames were pushed.
    pub fn tick(&self) -> usize {
        if self.sessions.is_empty() {
            return 0;
        }

        let snapshot = self.treadmill.snapshot();
        let mut sent = 0;

        let data = protocol::encode_treadmill_data(&snapshot);
        sent += self.push(CharacteristicId::TreadmillData, &data);

        if snapshot.heart_rate > 0 {
            let hr = protocol::encode_heart_rate(snapshot.heart_rate);
            sent += self.push(CharacteristicId::HeartRateMeasurement, &hr);
        }

        if let Some(pod) = snapshot.foot_pod {
            let rsc = protocol::encode_rsc_measurement(pod.speed_mps, pod.cadence_spm, pod.stride_length_m);
            sent += self.push(CharacteristicId::RscMeasurement, &rsc);
            if let Some(watts) = pod.power_watts {
                let power = protocol::encode_cycling_power(watts);
                sent += self.push(CharacteristicId::CyclingPowerMeasurement, &power);
            }
        }

        debug!("Notification tick: {} frames", sent);
        sent
    }

    fn push(&self, characteristic: CharacteristicId, value: &[u8]) -> usize {
        let subscribers = self.sessions.subscribers_of(characteristic);
        for client in &subscribers {
            self.transport.notify(client, characteristic, value, false);
        }
        subscribers.len()
    }

    /// Tick on a fixed interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Notification scheduler started ({:?} interval)", self.interval);
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.tick();
                    }
                }
            }
            info!("Notification scheduler stopped");
        })
    }
}
