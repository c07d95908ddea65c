use std::collections::HashMap;
use std::sync::Arc;

use crate::core::config::CopyOutPolicy;
use crate::core::device::DeviceId;
use crate::core::task::Access;
use crate::runtime::plan::CompiledProgram;

/// Identifies a compiled program: the recorded invocation stream, the
/// resolved accesses and object flags that shape the graph, the device
/// assignment, and the config knobs that change codegen.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ProgramKey {
    pub stream: Vec<u8>,
    pub accesses: Vec<Vec<Access>>,
    /// `(stream_in, stream_out)` per object slot.
    pub object_flags: Vec<(bool, bool)>,
    pub devices: Vec<DeviceId>,
    pub task_to_device: Vec<Option<usize>>,
    pub copy_out_policy: CopyOutPolicy,
    pub blocking_final_stream_out: bool,
}

#[derive(Debug, Default)]
pub struct ProgramCache {
    cache: HashMap<ProgramKey, Arc<CompiledProgram>>,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ProgramKey) -> Option<Arc<CompiledProgram>> {
        self.cache.get(key).cloned()
    }

    pub fn insert(&mut self, key: ProgramKey, program: Arc<CompiledProgram>) {
        self.cache.insert(key, program);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}
