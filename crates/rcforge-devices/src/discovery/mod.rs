//! Device discovery.
//!
//! Two interchangeable services publish `DeviceDiscovered` and `DeviceLost`
//! on [`Topic::Discovery`]: [`LiveDiscovery`] queries the local network over
//! UDP, and [`SimulatedDiscovery`] replays a fixed schedule without touching
//! the network. Subscribers cannot tell which one is running.

pub mod live;
pub mod simulated;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rcforge_core::{emit_device_lost, emit_device_seen, DeviceAdvert, DeviceId, EventBus, EventPayload, Topic};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DiscoveryError;

pub use live::{LiveDiscovery, LiveDiscoverySettings, DEFAULT_DISCOVERY_PORT};
pub use simulated::{ScriptStep, SimulatedDiscovery, SimulationScript, MAX_SCRIPT_MS};

/// A device is reported lost once it has been silent this long.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Begin publishing discovery events. Fails if already running.
    async fn start(&self) -> Result<(), DiscoveryError>;

    /// Stop publishing and wait for the background task to end. Devices seen
    /// so far stay in [`Discovery::seen`].
    async fn stop(&self);

    /// Devices currently considered present, ordered by id.
    fn seen(&self) -> Vec<DeviceAdvert>;

    fn describe(&self) -> String;
}

/// Result of feeding one advertisement to a [`PresenceTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting, or first since it was lost.
    New,
    /// Known device whose advertisement changed.
    Changed,
    /// Known device, nothing new.
    Refreshed,
}

/// Last-seen bookkeeping shared by both discovery variants.
#[derive(Debug)]
pub struct PresenceTracker {
    timeout: Duration,
    devices: BTreeMap<DeviceId, (DeviceAdvert, Instant)>,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            devices: BTreeMap::new(),
        }
    }

    pub fn observe(&mut self, advert: DeviceAdvert, now: Instant) -> Observation {
        match self.devices.get_mut(&advert.device_id) {
            Some((known, last_seen)) => {
                *last_seen = now;
                if *known == advert {
                    Observation::Refreshed
                } else {
                    *known = advert;
                    Observation::Changed
                }
            }
            None => {
                self.devices.insert(advert.device_id.clone(), (advert, now));
                Observation::New
            }
        }
    }

    /// Forget devices silent for longer than the timeout, returning their ids
    /// in order.
    pub fn expire(&mut self, now: Instant) -> Vec<DeviceId> {
        let timeout = self.timeout;
        let lost: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|(_, (_, last_seen))| now.saturating_duration_since(*last_seen) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &lost {
            self.devices.remove(id);
        }
        lost
    }

    /// Earliest instant at which some device will expire.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.devices
            .values()
            .filter_map(|(_, last_seen)| last_seen.checked_add(self.timeout))
            .min()
    }

    pub fn seen(&self) -> Vec<DeviceAdvert> {
        self.devices.values().map(|(advert, _)| advert.clone()).collect()
    }
}

/// Publish the effect of one advertisement.
pub(crate) fn announce(bus: &EventBus, advert: DeviceAdvert, observation: Observation) {
    match observation {
        Observation::New | Observation::Changed => {
            emit_device_seen(advert.device_id.as_str(), &advert.address);
            bus.publish(Topic::Discovery, EventPayload::DeviceDiscovered { advert });
        }
        Observation::Refreshed => {}
    }
}

pub(crate) fn announce_lost(bus: &EventBus, device_id: DeviceId) {
    emit_device_lost(device_id.as_str());
    bus.publish(Topic::Discovery, EventPayload::DeviceLost { device_id });
}

/// Start/stop bookkeeping for a background discovery task.
#[derive(Debug, Default)]
pub(crate) struct TaskSlot {
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl TaskSlot {
    /// Spawn the background task unless one is already running.
    pub(crate) fn launch<F>(&self, spawn: F) -> Result<(), DiscoveryError>
    where
        F: FnOnce(CancellationToken) -> JoinHandle<()>,
    {
        let mut running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if running.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let task = spawn(cancel.clone());
        *running = Some((cancel, task));
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((cancel, task)) = running {
            cancel.cancel();
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(id: &str, version: &str) -> DeviceAdvert {
        DeviceAdvert {
            device_id: DeviceId::new(id),
            name: format!("{id} receiver"),
            address: "10.0.0.7".into(),
            target: None,
            version: Some(version.into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_reports_new_changed_and_refreshed() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(5));
        let now = Instant::now();
        assert_eq!(tracker.observe(advert("rx1", "3.4"), now), Observation::New);
        assert_eq!(tracker.observe(advert("rx1", "3.4"), now), Observation::Refreshed);
        assert_eq!(tracker.observe(advert("rx1", "3.5"), now), Observation::Changed);
        assert_eq!(tracker.seen()[0].version.as_deref(), Some("3.5"));
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_expires_silent_devices_in_id_order() {
        let mut tracker = PresenceTracker::new(Duration::from_secs(5));
        let start = Instant::now();
        tracker.observe(advert("rx2", "1"), start);
        tracker.observe(advert("rx1", "1"), start);
        tracker.observe(advert("tx1", "1"), start + Duration::from_secs(3));

        assert!(tracker.expire(start + Duration::from_secs(4)).is_empty());
        assert_eq!(tracker.next_expiry(), Some(start + Duration::from_secs(5)));
        assert_eq!(
            tracker.expire(start + Duration::from_secs(5)),
            vec![DeviceId::new("rx1"), DeviceId::new("rx2")]
        );
        assert_eq!(tracker.seen().len(), 1);
    }
}
