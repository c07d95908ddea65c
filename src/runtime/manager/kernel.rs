use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use parking_lot::Mutex;

use super::{Device, KernelId};
use crate::core::device::DeviceId;
use crate::core::task::{SchedulableTask, TaskKind};
use crate::error::Result;

/// Installed device code, keyed by device and task code.
///
/// Guarantees that a method is installed at most once per device for the
/// lifetime of the cache, however many schedules or executions ask for it.
#[derive(Debug, Default)]
pub struct CodeCache {
    installed: Mutex<HashMap<(DeviceId, String), KernelId>>,
    installs: Mutex<u64>,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for a task. Prebuilt code is keyed by entry point and source
    /// hash so that two kernels sharing a name do not collide.
    pub fn cache_key(task: &SchedulableTask) -> String {
        match task.kind() {
            TaskKind::Compilable { method } => method.clone(),
            TaskKind::Prebuilt {
                entry_point, source, ..
            } => {
                let mut hasher = DefaultHasher::new();
                source.hash(&mut hasher);
                format!("{}_{:x}", entry_point, hasher.finish())
            }
        }
    }

    pub fn get(&self, device: DeviceId, task: &SchedulableTask) -> Option<KernelId> {
        self.installed
            .lock()
            .get(&(device, Self::cache_key(task)))
            .copied()
    }

    pub fn get_or_install(&self, id: DeviceId, device: &dyn Device, task: &SchedulableTask) -> Result<KernelId> {
        let key = (id, Self::cache_key(task));
        let mut installed = self.installed.lock();
        if let Some(kernel) = installed.get(&key) {
            return Ok(*kernel);
        }

        let start = Instant::now();
        let kernel = device.install_code(task)?;
        tracing::debug!(
            task = task.id(),
            code = %key.1,
            device = %id,
            elapsed_s = start.elapsed().as_secs_f64(),
            "installed code"
        );
        installed.insert(key, kernel);
        *self.installs.lock() += 1;
        Ok(kernel)
    }

    /// Number of installations performed so far.
    pub fn installs(&self) -> u64 {
        *self.installs.lock()
    }

    pub fn len(&self) -> usize {
        self.installed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.installed.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Access;
    use crate::runtime::manager::HostDevice;

    #[test]
    fn installs_once_per_device() {
        let device = HostDevice::new("host");
        device.register_kernel("noop", |_| Ok(()));
        let cache = CodeCache::new();
        let task = SchedulableTask::prebuilt("t0", "noop", "void noop() {}", vec![], vec![]);

        let a = cache.get_or_install(DeviceId::new(0, 0), device.as_ref(), &task).unwrap();
        let b = cache.get_or_install(DeviceId::new(0, 0), device.as_ref(), &task).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.installs(), 1);

        cache.get_or_install(DeviceId::new(0, 1), device.as_ref(), &task).unwrap();
        assert_eq!(cache.installs(), 2);
    }

    #[test]
    fn prebuilt_keys_include_source() {
        let a = SchedulableTask::prebuilt("a", "k", "v1", vec![], vec![Access::Read]);
        let b = SchedulableTask::prebuilt("b", "k", "v2", vec![], vec![Access::Read]);
        assert_ne!(CodeCache::cache_key(&a), CodeCache::cache_key(&b));
        assert!(CodeCache::cache_key(&a).starts_with("k_"));
    }
}
