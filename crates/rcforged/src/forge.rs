//! The outward surface a transport layer drives.

use std::sync::Arc;
use std::time::Duration;

use rcforge_build::{
    BuildError, BuildHandle, BuildOrchestrator, BuildRequest, ConfigSource, Toolchain,
    DEFAULT_GRACE_PERIOD,
};
use rcforge_core::{
    Device, DeviceAdvert, DeviceId, DeviceRegistry, EventBus, ParameterSet, RegistryError,
    RegistrySource, Subscription, TargetId, Topic, METRICS,
};
use rcforge_devices::{Discovery, DiscoveryError, SerialError, SerialMonitor, SerialParams, SerialTransport};
use tracing::{info, warn};

/// Time on top of the toolchain grace period for a hard kill and output drain.
pub const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

/// All rcforge components wired together around one event bus.
pub struct Forge {
    bus: EventBus,
    orchestrator: BuildOrchestrator,
    discovery: Arc<dyn Discovery>,
    serial: SerialMonitor,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for Forge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forge")
            .field("orchestrator", &self.orchestrator)
            .field("discovery", &self.discovery.describe())
            .finish()
    }
}

impl Forge {
    /// `discovery` must already publish on `bus`.
    pub fn new(
        bus: EventBus,
        registry: Arc<DeviceRegistry>,
        config: Arc<dyn ConfigSource>,
        toolchain: Arc<dyn Toolchain>,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn SerialTransport>,
    ) -> Self {
        let orchestrator = BuildOrchestrator::new(registry, config, toolchain, bus.clone());
        let serial = SerialMonitor::new(transport, bus.clone());
        Self {
            bus,
            orchestrator,
            discovery,
            serial,
            shutdown_timeout: DEFAULT_GRACE_PERIOD + SHUTDOWN_MARGIN,
        }
    }

    /// How long [`Forge::shutdown`] waits for cancelled builds to finish.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn orchestrator(&self) -> &BuildOrchestrator {
        &self.orchestrator
    }

    pub async fn start(&self) -> Result<(), DiscoveryError> {
        self.discovery.start().await?;
        info!(discovery = %self.discovery.describe(), "rcforge started");
        Ok(())
    }

    pub async fn submit_build(
        &self,
        target: impl Into<TargetId>,
        overrides: ParameterSet,
    ) -> Result<BuildHandle, BuildError> {
        self.orchestrator
            .submit(BuildRequest::new(target).with_overrides(overrides))
            .await
    }

    pub fn cancel_build(&self, target: &TargetId) -> Result<(), BuildError> {
        self.orchestrator.cancel_build(target)
    }

    pub fn subscribe_events(&self, topic: Topic) -> Subscription {
        self.bus.subscribe(topic)
    }

    /// Every device in the catalog, ordered by target id.
    pub fn list_devices(&self) -> Vec<Arc<Device>> {
        self.orchestrator.registry().list()
    }

    /// Replace the device catalog. On error the current catalog stays.
    pub async fn reload_registry(&self, source: &dyn RegistrySource) -> Result<usize, RegistryError> {
        self.orchestrator.registry().load(source).await
    }

    /// Devices discovery currently considers present.
    pub fn seen_devices(&self) -> Vec<DeviceAdvert> {
        self.discovery.seen()
    }

    pub fn open_serial(&self, device: &DeviceId, params: &SerialParams) -> Result<(), SerialError> {
        self.serial.open(device, params)
    }

    pub fn write_serial(&self, device: &DeviceId, bytes: &[u8]) -> Result<(), SerialError> {
        self.serial.write(device, bytes)
    }

    pub fn close_serial(&self, device: &DeviceId) -> Result<(), SerialError> {
        self.serial.close(device)
    }

    pub fn serial_ports(&self) -> Result<Vec<String>, SerialError> {
        self.serial.available_ports()
    }

    /// Stop discovery, cancel running builds and wait for them to finish,
    /// release serial ports, then end every subscription.
    ///
    /// Subscribers see each cancelled build's terminal state before their
    /// subscription closes.
    pub async fn shutdown(&self) {
        self.discovery.stop().await;
        for target in self.orchestrator.running() {
            if let Err(e) = self.orchestrator.cancel_build(&target) {
                warn!(target = %target, error = %e, "cancel on shutdown failed");
            }
        }
        if !self.orchestrator.wait_idle(self.shutdown_timeout).await {
            warn!(
                still_running = ?self.orchestrator.running(),
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "builds did not finish before shutdown"
            );
        }
        self.serial.close_all();
        METRICS.flush();
        self.bus.shutdown();
        info!("rcforge stopped");
    }
}
