//! Deterministic discovery driven by a script of synthetic advertisements.
//!
//! The script is run through the same [`PresenceTracker`] rules as the live
//! service, so a device that stops advertising is reported lost once the
//! presence timeout passes. The resulting timeline depends only on the
//! script and the timeout.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rcforge_core::{DeviceAdvert, DeviceId, EventBus, EventPayload, TargetId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{announce, announce_lost, Discovery, Observation, PresenceTracker, TaskSlot, DEFAULT_PRESENCE_TIMEOUT};
use crate::error::{DiscoveryError, ScriptError};

/// Longest simulation a script may describe: thirty days.
pub const MAX_SCRIPT_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// One synthetic advertisement, `at_ms` after the simulation starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptStep {
    pub at_ms: u64,
    pub advert: DeviceAdvert,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationScript {
    pub steps: Vec<ScriptStep>,

    /// Simulation end. Expiries up to this point are still reported.
    #[serde(default)]
    pub horizon_ms: u64,
}

impl SimulationScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advert(mut self, at: Duration, advert: DeviceAdvert) -> Self {
        let at_ms = at.as_millis() as u64;
        self.horizon_ms = self.horizon_ms.max(at_ms);
        self.steps.push(ScriptStep { at_ms, advert });
        self
    }

    pub fn until(mut self, horizon: Duration) -> Self {
        self.horizon_ms = horizon.as_millis() as u64;
        self
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, ScriptError> {
        let script: Self = serde_json::from_slice(raw)?;
        script.validate()?;
        Ok(script)
    }

    /// Reject offsets past [`MAX_SCRIPT_MS`].
    pub fn validate(&self) -> Result<(), ScriptError> {
        let offsets = self
            .steps
            .iter()
            .map(|step| ("at_ms", step.at_ms))
            .chain(std::iter::once(("horizon_ms", self.horizon_ms)));
        for (field, value) in offsets {
            if value > MAX_SCRIPT_MS {
                return Err(ScriptError::OutOfRange {
                    field,
                    value,
                    max: MAX_SCRIPT_MS,
                });
            }
        }
        Ok(())
    }

    /// A transmitter that keeps advertising and a receiver that goes quiet
    /// after twenty seconds.
    pub fn demo() -> Self {
        let tx = DeviceAdvert {
            device_id: DeviceId::new("tx-esp32-01"),
            name: "Simulated TX".into(),
            address: "192.0.2.10".into(),
            target: Some(TargetId::new("TX_ESP32")),
            version: Some("3.4.0".into()),
        };
        let rx = DeviceAdvert {
            device_id: DeviceId::new("rx-2400-01"),
            name: "Simulated RX".into(),
            address: "192.0.2.11".into(),
            target: Some(TargetId::new("RX_2400")),
            version: Some("3.4.0".into()),
        };
        let mut script = Self::new();
        for second in (0..60).step_by(5) {
            script = script.advert(Duration::from_secs(second), tx.clone());
            if second <= 20 {
                script = script.advert(Duration::from_secs(second + 1), rx.clone());
            }
        }
        script.until(Duration::from_secs(60))
    }
}

fn expire_until(
    tracker: &mut PresenceTracker,
    base: Instant,
    limit: Instant,
    timeline: &mut Vec<(Duration, EventPayload)>,
) {
    while let Some(expiry) = tracker.next_expiry().filter(|expiry| *expiry <= limit) {
        for device_id in tracker.expire(expiry) {
            timeline.push((expiry - base, EventPayload::DeviceLost { device_id }));
        }
    }
}

/// Compute every event the script produces, with its offset from start.
///
/// Offsets are clamped to [`MAX_SCRIPT_MS`]; steps past it are dropped.
pub fn plan(script: &SimulationScript, timeout: Duration) -> Vec<(Duration, EventPayload)> {
    let base = Instant::now();
    let offset = |ms: u64| base.checked_add(Duration::from_millis(ms.min(MAX_SCRIPT_MS)));
    let mut tracker = PresenceTracker::new(timeout);
    let mut timeline = Vec::new();

    let mut steps = script.steps.clone();
    steps.sort_by_key(|step| step.at_ms);
    for step in steps.into_iter().take_while(|step| step.at_ms <= MAX_SCRIPT_MS) {
        let Some(at) = offset(step.at_ms) else {
            break;
        };
        expire_until(&mut tracker, base, at, &mut timeline);
        match tracker.observe(step.advert.clone(), at) {
            Observation::New | Observation::Changed => timeline.push((
                at - base,
                EventPayload::DeviceDiscovered {
                    advert: step.advert,
                },
            )),
            Observation::Refreshed => {}
        }
    }
    if let Some(horizon) = offset(script.horizon_ms) {
        expire_until(&mut tracker, base, horizon, &mut timeline);
    }
    timeline
}

pub struct SimulatedDiscovery {
    bus: EventBus,
    script: SimulationScript,
    timeout: Duration,
    present: Arc<Mutex<BTreeMap<DeviceId, DeviceAdvert>>>,
    task: TaskSlot,
}

impl SimulatedDiscovery {
    pub fn new(bus: EventBus, script: SimulationScript) -> Self {
        Self {
            bus,
            script,
            timeout: DEFAULT_PRESENCE_TIMEOUT,
            present: Arc::new(Mutex::new(BTreeMap::new())),
            task: TaskSlot::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Payloads the script produces, in order, without publishing anything.
    pub fn replay(&self) -> Vec<EventPayload> {
        plan(&self.script, self.timeout)
            .into_iter()
            .map(|(_, payload)| payload)
            .collect()
    }
}

#[async_trait]
impl Discovery for SimulatedDiscovery {
    async fn start(&self) -> Result<(), DiscoveryError> {
        let timeline = plan(&self.script, self.timeout);
        let bus = self.bus.clone();
        let present = self.present.clone();
        self.task.launch(|cancel| {
            tokio::spawn(async move {
                let start = Instant::now();
                for (offset, payload) in timeline {
                    tokio::select! {
                        _ = tokio::time::sleep_until(start + offset) => {}
                        _ = cancel.cancelled() => return,
                    }
                    let mut seen = present
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    match payload {
                        EventPayload::DeviceDiscovered { advert } => {
                            seen.insert(advert.device_id.clone(), advert.clone());
                            announce(&bus, advert, Observation::New);
                        }
                        EventPayload::DeviceLost { device_id } => {
                            seen.remove(&device_id);
                            announce_lost(&bus, device_id);
                        }
                        _ => {}
                    }
                }
            })
        })?;
        tracing::info!(steps = self.script.steps.len(), "simulated discovery started");
        Ok(())
    }

    async fn stop(&self) {
        self.task.stop().await;
    }

    fn seen(&self) -> Vec<DeviceAdvert> {
        self.present
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn describe(&self) -> String {
        format!("simulated:{} steps", self.script.steps.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(id: &str) -> DeviceAdvert {
        DeviceAdvert {
            device_id: DeviceId::new(id),
            name: id.to_string(),
            address: "192.0.2.1".into(),
            target: None,
            version: None,
        }
    }

    #[test]
    fn silent_device_is_lost_after_timeout() {
        let script = SimulationScript::new()
            .advert(Duration::from_secs(0), advert("rx1"))
            .advert(Duration::from_secs(2), advert("rx1"))
            .until(Duration::from_secs(10));
        let timeline = plan(&script, Duration::from_secs(5));
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].0, Duration::ZERO);
        assert_eq!(timeline[1].0, Duration::from_secs(7));
        assert!(matches!(&timeline[1].1, EventPayload::DeviceLost { device_id } if device_id.as_str() == "rx1"));
    }

    #[test]
    fn horizon_cuts_off_later_expiries() {
        let script = SimulationScript::new()
            .advert(Duration::from_secs(0), advert("rx1"))
            .until(Duration::from_secs(3));
        assert_eq!(plan(&script, Duration::from_secs(5)).len(), 1);
    }

    #[test]
    fn rediscovery_after_loss() {
        let script = SimulationScript::new()
            .advert(Duration::from_secs(0), advert("rx1"))
            .advert(Duration::from_secs(8), advert("rx1"));
        let kinds: Vec<&str> = plan(&script, Duration::from_secs(5))
            .iter()
            .map(|(_, p)| p.kind())
            .collect();
        assert_eq!(kinds, vec!["device_discovered", "device_lost", "device_discovered"]);
    }

    #[test]
    fn demo_script_loses_the_receiver() {
        let sim = SimulatedDiscovery::new(EventBus::new(), SimulationScript::demo());
        let lost: Vec<EventPayload> = sim
            .replay()
            .into_iter()
            .filter(|p| matches!(p, EventPayload::DeviceLost { .. }))
            .collect();
        assert_eq!(
            lost,
            vec![EventPayload::DeviceLost {
                device_id: DeviceId::new("rx-2400-01")
            }]
        );
    }

    #[test]
    fn oversized_offsets_are_rejected_at_load() {
        let raw = br#"{"steps":[{"at_ms":18446744073709551615,"advert":{"device_id":"rx1","name":"RX","address":"10.0.0.2"}}]}"#;
        assert!(matches!(
            SimulationScript::from_json(raw),
            Err(ScriptError::OutOfRange { field: "at_ms", .. })
        ));

        let raw = br#"{"steps":[],"horizon_ms":18446744073709551615}"#;
        let err = SimulationScript::from_json(raw).unwrap_err();
        assert!(err.to_string().contains("horizon_ms"));

        assert!(matches!(
            SimulationScript::from_json(b"{"),
            Err(ScriptError::Parse(_))
        ));
    }

    #[test]
    fn plan_drops_steps_past_the_limit() {
        let script = SimulationScript {
            steps: vec![
                ScriptStep {
                    at_ms: 0,
                    advert: advert("rx1"),
                },
                ScriptStep {
                    at_ms: u64::MAX,
                    advert: advert("rx2"),
                },
            ],
            horizon_ms: u64::MAX,
        };
        let timeline = plan(&script, Duration::from_secs(5));
        let kinds: Vec<&str> = timeline
            .iter()
            .map(|(_, payload)| payload.kind())
            .collect();
        assert_eq!(kinds, vec!["device_discovered", "device_lost"]);
        assert_eq!(timeline[1].0, Duration::from_secs(5));
    }

    #[test]
    fn script_parses_from_json() {
        let raw = br#"{"steps":[{"at_ms":250,"advert":{"device_id":"rx1","name":"RX","address":"10.0.0.2"}}],"horizon_ms":1000}"#;
        let script = SimulationScript::from_json(raw).unwrap();
        assert_eq!(script.steps[0].at_ms, 250);
        assert_eq!(script.horizon_ms, 1000);
    }
}
