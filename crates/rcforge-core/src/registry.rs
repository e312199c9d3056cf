//! In-memory catalog of known hardware targets.
//!
//! The catalog is an immutable `BTreeMap` behind an `Arc`. Loading builds a
//! complete new catalog and swaps the `Arc` in one step, so readers see
//! either the old or the new catalog and never a mix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use crate::error::{RegistryError, Result};
use crate::model::{Device, TargetId};

/// Where a device catalog comes from.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    /// Read the raw device list.
    async fn fetch(&self) -> Result<Vec<Device>>;

    /// Short label used in logs.
    fn describe(&self) -> String;
}

/// JSON array of devices stored on disk.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RegistrySource for JsonFileSource {
    async fn fetch(&self) -> Result<Vec<Device>> {
        let raw = tokio::fs::read(&self.path).await.map_err(|e| {
            RegistryError::Unreadable(format!("{}: {e}", self.path.display()))
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Devices supplied directly by the caller.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    devices: Vec<Device>,
}

impl StaticSource {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl RegistrySource for StaticSource {
    async fn fetch(&self) -> Result<Vec<Device>> {
        Ok(self.devices.clone())
    }

    fn describe(&self) -> String {
        format!("static:{} devices", self.devices.len())
    }
}

type Catalog = BTreeMap<TargetId, Arc<Device>>;

/// Read-mostly device catalog.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    catalog: RwLock<Arc<Catalog>>,
    generation: AtomicU64,
}

impl DeviceRegistry {
    /// An empty registry; call [`DeviceRegistry::load`] before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from an already validated device list.
    pub fn from_devices(devices: Vec<Device>) -> Result<Self> {
        let registry = Self::new();
        registry.install(build_catalog(devices)?);
        Ok(registry)
    }

    /// Load `source` and replace the entire catalog. On error the previous
    /// catalog stays in place.
    pub async fn load(&self, source: &dyn RegistrySource) -> Result<usize> {
        let devices = source.fetch().await?;
        let catalog = build_catalog(devices)?;
        let count = catalog.len();
        self.install(catalog);
        info!(source = %source.describe(), devices = count, generation = self.generation(), "device registry loaded");
        Ok(count)
    }

    fn install(&self, catalog: Catalog) {
        let mut guard = self
            .catalog
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(catalog);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, target: &TargetId) -> Result<Arc<Device>> {
        self.snapshot()
            .get(target)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(target.to_string()))
    }

    /// All devices, ordered by target id.
    pub fn list(&self) -> Vec<Arc<Device>> {
        self.snapshot().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Number of completed loads.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

fn build_catalog(devices: Vec<Device>) -> Result<Catalog> {
    let mut catalog = Catalog::new();
    for device in devices {
        validate(&device)?;
        let id = device.target.id.clone();
        if catalog.insert(id.clone(), Arc::new(device)).is_some() {
            return Err(RegistryError::DuplicateTarget(id.to_string()));
        }
    }
    Ok(catalog)
}

fn validate(device: &Device) -> Result<()> {
    let invalid = |reason: &str| RegistryError::InvalidDevice {
        target: device.target.id.to_string(),
        reason: reason.to_string(),
    };
    if device.target.id.as_str().trim().is_empty() {
        return Err(invalid("empty target id"));
    }
    if device.target.platform.trim().is_empty() {
        return Err(invalid("empty platform"));
    }
    if device.product_name.trim().is_empty() {
        return Err(invalid("empty product name"));
    }
    Ok(())
}
