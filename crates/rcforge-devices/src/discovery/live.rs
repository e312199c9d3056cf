//! UDP discovery on the local network.
//!
//! Every `interval` the service broadcasts a query datagram:
//!
//! ```json
//! {"type": "rcforge.discover", "version": 1}
//! ```
//!
//! Devices answer with an advertisement; the sender's IP becomes the
//! advertised address:
//!
//! ```json
//! {"device_id": "rx-2400-01", "name": "RX", "target": "RX_2400", "version": "3.4.0"}
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rcforge_core::{DeviceAdvert, DeviceId, EventBus, TargetId};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{announce, announce_lost, Discovery, PresenceTracker, TaskSlot, DEFAULT_PRESENCE_TIMEOUT};
use crate::error::DiscoveryError;

pub const DEFAULT_DISCOVERY_PORT: u16 = 47800;
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(2);

const QUERY_TYPE: &str = "rcforge.discover";
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Serialize, Deserialize)]
struct Query {
    #[serde(rename = "type")]
    kind: String,
    version: u32,
}

#[derive(Debug, Deserialize)]
struct AdvertMessage {
    device_id: DeviceId,
    name: String,
    #[serde(default)]
    target: Option<TargetId>,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LiveDiscoverySettings {
    /// Local address the socket binds to.
    pub bind: SocketAddr,
    /// Where queries are sent, normally the broadcast address.
    pub query_addr: SocketAddr,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for LiveDiscoverySettings {
    fn default() -> Self {
        Self::broadcast(DEFAULT_DISCOVERY_PORT)
    }
}

impl LiveDiscoverySettings {
    pub fn broadcast(port: u16) -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            query_addr: SocketAddr::from((Ipv4Addr::BROADCAST, port)),
            interval: DEFAULT_QUERY_INTERVAL,
            timeout: DEFAULT_PRESENCE_TIMEOUT,
        }
    }
}

pub struct LiveDiscovery {
    bus: EventBus,
    settings: LiveDiscoverySettings,
    tracker: Arc<Mutex<PresenceTracker>>,
    task: TaskSlot,
}

impl LiveDiscovery {
    pub fn new(bus: EventBus, settings: LiveDiscoverySettings) -> Self {
        let tracker = PresenceTracker::new(settings.timeout);
        Self {
            bus,
            settings,
            tracker: Arc::new(Mutex::new(tracker)),
            task: TaskSlot::default(),
        }
    }
}

struct Listener {
    socket: UdpSocket,
    query: Vec<u8>,
    query_addr: SocketAddr,
    interval: Duration,
    bus: EventBus,
    tracker: Arc<Mutex<PresenceTracker>>,
}

impl Listener {
    fn tracker(&self) -> std::sync::MutexGuard<'_, PresenceTracker> {
        self.tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.socket.send_to(&self.query, self.query_addr).await {
                        debug!(error = %e, addr = %self.query_addr, "discovery query not sent");
                    }
                    self.sweep();
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle(&buf[..len], from),
                    Err(e) => debug!(error = %e, "discovery receive failed"),
                },
            }
        }
        debug!("live discovery stopped");
    }

    fn handle(&self, datagram: &[u8], from: SocketAddr) {
        let message: AdvertMessage = match serde_json::from_slice(datagram) {
            Ok(message) => message,
            Err(e) => {
                // Our own broadcast query comes back on some networks.
                debug!(error = %e, from = %from, "ignoring datagram");
                return;
            }
        };
        let advert = DeviceAdvert {
            device_id: message.device_id,
            name: message.name,
            address: from.ip().to_string(),
            target: message.target,
            version: message.version,
        };
        let observation = self.tracker().observe(advert.clone(), Instant::now());
        announce(&self.bus, advert, observation);
    }

    fn sweep(&self) {
        let lost = self.tracker().expire(Instant::now());
        for device_id in lost {
            announce_lost(&self.bus, device_id);
        }
    }
}

#[async_trait]
impl Discovery for LiveDiscovery {
    async fn start(&self) -> Result<(), DiscoveryError> {
        let socket = UdpSocket::bind(self.settings.bind)
            .await
            .map_err(|e| DiscoveryError::Socket(format!("bind {}: {e}", self.settings.bind)))?;
        socket.set_broadcast(true)?;
        let query = serde_json::to_vec(&Query {
            kind: QUERY_TYPE.to_string(),
            version: 1,
        })
        .map_err(|e| DiscoveryError::Socket(e.to_string()))?;
        let local = socket.local_addr()?;

        let listener = Listener {
            socket,
            query,
            query_addr: self.settings.query_addr,
            interval: self.settings.interval,
            bus: self.bus.clone(),
            tracker: self.tracker.clone(),
        };
        self.task
            .launch(|cancel| tokio::spawn(listener.run(cancel)))?;
        info!(local = %local, query = %self.settings.query_addr, "live discovery started");
        Ok(())
    }

    async fn stop(&self) {
        self.task.stop().await;
    }

    fn seen(&self) -> Vec<DeviceAdvert> {
        self.tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .seen()
    }

    fn describe(&self) -> String {
        format!("live:{}", self.settings.query_addr)
    }
}
