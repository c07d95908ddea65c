//! Devices and the shared runtime state that outlives a single schedule.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::config::RuntimeConfig;
use crate::core::device::{BackendType, DeviceId};
use crate::core::sketch::SketchRegistry;
use crate::core::task::SchedulableTask;
use crate::core::value::Primitive;
use crate::error::{Error, Result};

pub mod cache;
pub mod host;
pub mod kernel;

pub use cache::{ProgramCache, ProgramKey};
pub use host::{DeviceOp, HostArg, HostDevice, KernelFrame};
pub use kernel::CodeCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferId(pub u64);

/// Opaque completion handle returned by a device operation. Only meaningful
/// to the device that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum KernelArg {
    Buffer(BufferId),
    Scalar(Primitive),
}

/// Driver-side view of one compute device.
///
/// Operations are enqueued and return an [`Event`]; `wait` lists only ever
/// contain events previously returned by the same device.
pub trait Device: Send + Sync + fmt::Debug {
    fn name(&self) -> String;

    fn backend(&self) -> BackendType;

    /// Brings up the device context. Called once per context at VM setup.
    fn ensure_loaded(&self) -> Result<()>;

    fn install_code(&self, task: &SchedulableTask) -> Result<KernelId>;

    fn allocate(&self, bytes: usize) -> Result<BufferId>;

    /// Host to device.
    fn write(&self, buffer: BufferId, data: &[u8], wait: &[Event]) -> Result<Event>;

    /// Device to host. A blocking read returns after the data has landed.
    fn read(&self, buffer: BufferId, out: &mut [u8], wait: &[Event], blocking: bool) -> Result<Event>;

    fn launch(&self, kernel: KernelId, args: &[KernelArg], wait: &[Event]) -> Result<Event>;

    fn barrier(&self, wait: &[Event]) -> Result<Event>;

    /// Blocks until `event` has completed.
    fn resolve(&self, event: Event) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct Driver {
    pub name: String,
    pub devices: Vec<Arc<dyn Device>>,
}

/// Installed drivers, addressed as `driver:device`.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    drivers: Vec<Driver>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a driver and returns its index.
    pub fn add_driver(&mut self, name: impl Into<String>, devices: Vec<Arc<dyn Device>>) -> usize {
        let name = name.into();
        tracing::info!(driver = %name, devices = devices.len(), "driver registered");
        self.drivers.push(Driver { name, devices });
        self.drivers.len() - 1
    }

    pub fn drivers(&self) -> &[Driver] {
        &self.drivers
    }

    pub fn check(&self, id: DeviceId) -> Result<()> {
        let driver = self.drivers.get(id.driver).ok_or_else(|| {
            Error::config(format!(
                "driver index {} out of range ({} drivers installed)",
                id.driver,
                self.drivers.len()
            ))
        })?;
        if id.device >= driver.devices.len() {
            return Err(Error::config(format!(
                "device index {} out of range for driver `{}` ({} devices)",
                id.device,
                driver.name,
                driver.devices.len()
            )));
        }
        Ok(())
    }

    pub fn resolve(&self, id: DeviceId) -> Result<Arc<dyn Device>> {
        self.check(id)?;
        Ok(Arc::clone(&self.drivers[id.driver].devices[id.device]))
    }

    /// Parses a `driver:device` string and checks it against the installed
    /// drivers.
    pub fn resolve_str(&self, s: &str) -> Result<DeviceId> {
        let id: DeviceId = s.parse()?;
        self.check(id)?;
        Ok(id)
    }
}

/// Process-wide state shared by every schedule: devices, sketches, caches and
/// configuration.
#[derive(Debug)]
pub struct RuntimeManager {
    pub registry: DeviceRegistry,
    pub sketches: SketchRegistry,
    pub code_cache: CodeCache,
    pub programs: RwLock<ProgramCache>,
    pub config: RuntimeConfig,
}

impl RuntimeManager {
    pub fn new(registry: DeviceRegistry, config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sketches: SketchRegistry::new(),
            code_cache: CodeCache::new(),
            programs: RwLock::new(ProgramCache::new()),
            config,
        })
    }

    /// A runtime with one `host` driver exposing the given devices.
    pub fn with_host_devices(devices: Vec<Arc<HostDevice>>, config: RuntimeConfig) -> Arc<Self> {
        let mut registry = DeviceRegistry::new();
        registry.add_driver(
            "host",
            devices.into_iter().map(|d| d as Arc<dyn Device>).collect(),
        );
        Self::new(registry, config)
    }

    /// A host-only runtime with `devices` fresh host devices.
    pub fn host(devices: usize, config: RuntimeConfig) -> Arc<Self> {
        Self::with_host_devices((0..devices).map(|i| HostDevice::new(format!("host-{i}"))).collect(), config)
    }

    pub fn device(&self, id: DeviceId) -> Result<Arc<dyn Device>> {
        self.registry.resolve(id)
    }

    pub fn install(&self, id: DeviceId, task: &SchedulableTask) -> Result<KernelId> {
        let device = self.device(id)?;
        self.code_cache.get_or_install(id, device.as_ref(), task)
    }
}
