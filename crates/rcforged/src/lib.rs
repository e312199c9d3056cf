//! rcforge daemon
//!
//! [`assemble`] turns [`Settings`] into a running [`Forge`]: every component
//! is constructed here and handed its collaborators directly.

pub mod forge;
pub mod settings;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rcforge_build::{
    ConfigSource, GitConfigSource, HttpConfigSource, ProcessToolchain, ProcessToolchainSettings,
};
use rcforge_core::{DeviceRegistry, EventBus, JsonFileSource};
use rcforge_devices::{
    Discovery, LiveDiscovery, LiveDiscoverySettings, SerialportTransport, SimulatedDiscovery,
    SimulationScript,
};
use tracing::{info, warn};

pub use forge::{Forge, SHUTDOWN_MARGIN};
pub use settings::{ConfigSourceKind, DiscoveryKind, Settings};

/// Build the device registry, loading the catalog file if one is configured.
pub async fn load_registry(settings: &Settings) -> Result<Arc<DeviceRegistry>> {
    let registry = DeviceRegistry::new();
    match &settings.registry {
        Some(path) => {
            registry
                .load(&JsonFileSource::new(path))
                .await
                .with_context(|| format!("Failed to load device registry from {}", path.display()))?;
        }
        None => warn!("no device registry configured, every build will be rejected"),
    }
    Ok(Arc::new(registry))
}

pub fn config_source(settings: &Settings) -> Result<Arc<dyn ConfigSource>> {
    let source: Arc<dyn ConfigSource> = match settings.config_source {
        ConfigSourceKind::Git => {
            let Some(repo) = &settings.config_repo else {
                bail!("--config-repo is required for the git configuration source");
            };
            let mut git = GitConfigSource::new(repo.clone(), settings.config_cache_dir.clone());
            if let Some(git_ref) = &settings.config_ref {
                git = git.with_ref(git_ref.clone());
            }
            if let Some(document) = &settings.config_document {
                git = git.with_document(document.clone());
            }
            Arc::new(git)
        }
        ConfigSourceKind::Http => {
            let Some(url) = &settings.config_url else {
                bail!("--config-url is required for the http configuration source");
            };
            Arc::new(HttpConfigSource::new(url.clone()).context("Failed to create HTTP client")?)
        }
    };
    Ok(source)
}

pub fn process_toolchain(settings: &Settings) -> ProcessToolchain {
    let mut toolchain = ProcessToolchainSettings::new(
        settings.toolchain_program.clone(),
        settings.artifact_dir.clone(),
    );
    toolchain.args = settings.toolchain_args.clone();
    toolchain.work_dir = settings.toolchain_workdir.clone();
    toolchain.grace_period = settings.grace_period();
    toolchain.deadline = settings.build_deadline();
    ProcessToolchain::new(toolchain)
}

pub async fn discovery_service(settings: &Settings, bus: &EventBus) -> Result<Arc<dyn Discovery>> {
    let discovery: Arc<dyn Discovery> = match settings.discovery {
        DiscoveryKind::Live => {
            let mut live = LiveDiscoverySettings::broadcast(settings.discovery_port);
            live.interval = settings.discovery_interval();
            live.timeout = settings.discovery_timeout();
            Arc::new(LiveDiscovery::new(bus.clone(), live))
        }
        DiscoveryKind::Simulated => {
            let script = match &settings.simulation_script {
                Some(path) => {
                    let raw = tokio::fs::read(path)
                        .await
                        .with_context(|| format!("Failed to read simulation script {}", path.display()))?;
                    SimulationScript::from_json(&raw)
                        .with_context(|| format!("Malformed simulation script {}", path.display()))?
                }
                None => SimulationScript::demo(),
            };
            Arc::new(
                SimulatedDiscovery::new(bus.clone(), script)
                    .with_timeout(settings.discovery_timeout()),
            )
        }
    };
    Ok(discovery)
}

/// Construct every component from `settings`. Nothing is started yet.
pub async fn assemble(settings: &Settings) -> Result<Forge> {
    let bus = EventBus::new();
    let registry = load_registry(settings).await?;
    let config = config_source(settings)?;
    let toolchain = Arc::new(process_toolchain(settings));
    let discovery = discovery_service(settings, &bus).await?;

    info!(
        devices = registry.len(),
        config = %config.describe(),
        toolchain = %settings.toolchain_program,
        discovery = %discovery.describe(),
        "components assembled"
    );
    Ok(Forge::new(
        bus,
        registry,
        config,
        toolchain,
        discovery,
        Arc::new(SerialportTransport),
    )
    .with_shutdown_timeout(settings.grace_period() + SHUTDOWN_MARGIN))
}
