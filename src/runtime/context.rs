//! Per-schedule tables: tasks, constants, objects, devices and the task to
//! device assignment.
//!
//! The compiled program addresses everything by slot into these tables, so the
//! de-duplication rules here decide what the bytecode means: primitives share
//! a slot when their values are equal, objects when they are the same
//! allocation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::config::RuntimeConfig;
use crate::core::device::DeviceId;
use crate::core::task::SchedulableTask;
use crate::core::value::{ObjectRef, Primitive, Value};
use crate::error::{Error, Result};
use crate::runtime::manager::{BufferId, DeviceRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableSlot {
    Constant(usize),
    Object(usize),
}

/// Residency of one object on one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceObjectState {
    pub buffer: Option<BufferId>,
    /// The device copy matches the latest contents.
    pub valid: bool,
    /// The device copy was written by a kernel and the host copy is stale.
    pub modified: bool,
}

/// Host-side flags and per-device residency of one object.
#[derive(Debug, Clone, Default)]
pub struct ObjectState {
    /// Copied to the device on every execution.
    pub stream_in: bool,
    /// Copied back to the host after its last writer.
    pub stream_out: bool,
    /// Re-streamed even after a device task has written it.
    pub forced_stream_in: bool,
    devices: BTreeMap<DeviceId, DeviceObjectState>,
}

impl ObjectState {
    pub fn device(&self, id: DeviceId) -> Option<&DeviceObjectState> {
        self.devices.get(&id)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> &mut DeviceObjectState {
        self.devices.entry(id).or_default()
    }

    pub fn is_valid_on(&self, id: DeviceId) -> bool {
        self.devices.get(&id).map_or(false, |s| s.valid)
    }

    /// Records a kernel write on `id`: that copy becomes the only valid one.
    pub fn mark_written(&mut self, id: DeviceId) {
        for (device, state) in self.devices.iter_mut() {
            if *device != id {
                state.valid = false;
                state.modified = false;
            }
        }
        let state = self.device_mut(id);
        state.valid = true;
        state.modified = true;
    }

    /// Forgets all device copies, keeping the buffers for reuse.
    pub fn invalidate(&mut self) {
        for state in self.devices.values_mut() {
            state.valid = false;
            state.modified = false;
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = (&DeviceId, &DeviceObjectState)> {
        self.devices.iter()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    name: String,
    tasks: Vec<SchedulableTask>,
    constants: Vec<Primitive>,
    objects: Vec<ObjectRef>,
    object_states: Vec<ObjectState>,
    devices: Vec<DeviceId>,
    task_to_device: Vec<Option<usize>>,
    next_gtid: usize,
}

impl ExecutionContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: Vec::new(),
            constants: Vec::new(),
            objects: Vec::new(),
            object_states: Vec::new(),
            devices: Vec::new(),
            task_to_device: Vec::new(),
            next_gtid: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert_variable(&mut self, value: &Value) -> VariableSlot {
        match value {
            Value::Primitive(p) => VariableSlot::Constant(self.insert_constant(*p)),
            Value::Object(o) => VariableSlot::Object(self.register(o)),
        }
    }

    pub fn insert_constant(&mut self, value: Primitive) -> usize {
        match self.constants.iter().position(|c| *c == value) {
            Some(slot) => slot,
            None => {
                self.constants.push(value);
                self.constants.len() - 1
            }
        }
    }

    /// Slot of `object`, registering it with a fresh state on first sight.
    pub fn register(&mut self, object: &ObjectRef) -> usize {
        match self.slot_of(object) {
            Some(slot) => slot,
            None => {
                self.objects.push(Arc::clone(object));
                self.object_states.push(ObjectState::default());
                self.objects.len() - 1
            }
        }
    }

    pub fn slot_of(&self, object: &ObjectRef) -> Option<usize> {
        self.objects.iter().position(|o| Arc::ptr_eq(o, object))
    }

    pub fn state_of(&self, slot: usize) -> Option<&ObjectState> {
        self.object_states.get(slot)
    }

    pub fn state_of_mut(&mut self, slot: usize) -> Option<&mut ObjectState> {
        self.object_states.get_mut(slot)
    }

    /// Puts `new` in the slot held by `old`. Device copies of the slot are
    /// dropped; the stream flags are kept.
    pub fn replace_variable(&mut self, old: &ObjectRef, new: &ObjectRef) -> Result<usize> {
        let slot = self
            .slot_of(old)
            .ok_or_else(|| Error::precondition(format!("object `{}` is not registered", old.name())))?;
        self.objects[slot] = Arc::clone(new);
        let state = &mut self.object_states[slot];
        state.devices.clear();
        Ok(slot)
    }

    pub fn mark_stream_in(&mut self, object: &ObjectRef) -> usize {
        let slot = self.register(object);
        self.object_states[slot].stream_in = true;
        slot
    }

    pub fn mark_stream_out(&mut self, object: &ObjectRef) -> usize {
        let slot = self.register(object);
        self.object_states[slot].stream_out = true;
        slot
    }

    pub fn force_stream_in(&mut self, object: &ObjectRef) -> usize {
        let slot = self.mark_stream_in(object);
        self.object_states[slot].forced_stream_in = true;
        slot
    }

    pub fn add_task(&mut self, task: SchedulableTask) -> usize {
        match self.tasks.iter().position(|t| *t == task) {
            Some(index) => index,
            None => {
                self.tasks.push(task);
                self.task_to_device.push(None);
                self.tasks.len() - 1
            }
        }
    }

    /// Global id of the next recorded invocation.
    pub fn next_global_task_id(&mut self) -> usize {
        let gtid = self.next_gtid;
        self.next_gtid += 1;
        gtid
    }

    pub fn global_task_count(&self) -> usize {
        self.next_gtid
    }

    pub fn tasks(&self) -> &[SchedulableTask] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> Option<&SchedulableTask> {
        self.tasks.get(index)
    }

    pub fn task_by_id(&self, id: &str) -> Option<&SchedulableTask> {
        self.tasks.iter().find(|t| t.id() == id)
    }

    pub fn constants(&self) -> &[Primitive] {
        &self.constants
    }

    pub fn objects(&self) -> &[ObjectRef] {
        &self.objects
    }

    pub fn object(&self, slot: usize) -> Option<&ObjectRef> {
        self.objects.get(slot)
    }

    pub fn object_states(&self) -> &[ObjectState] {
        &self.object_states
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<DeviceId> {
        self.devices.get(index).copied()
    }

    pub fn task_to_device(&self) -> &[Option<usize>] {
        &self.task_to_device
    }

    /// Resolves a device for every unassigned task.
    ///
    /// Precedence: `config.task_devices[task id]`, then the device the task
    /// was mapped to, then `config.default_device`. Bad device strings and
    /// indices outside the installed drivers fail here, before anything is
    /// compiled.
    pub fn assign_to_devices(&mut self, registry: &DeviceRegistry, config: &RuntimeConfig) -> Result<()> {
        for index in 0..self.tasks.len() {
            if self.task_to_device[index].is_some() {
                continue;
            }
            let task = &self.tasks[index];
            let device = match config.task_devices.get(task.id()) {
                Some(spec) => registry.resolve_str(spec)?,
                None => match task.device() {
                    Some(id) => {
                        registry.check(id)?;
                        id
                    }
                    None => registry.resolve_str(&config.default_device)?,
                },
            };
            tracing::debug!(task = task.id(), device = %device, "task assigned");
            let device_index = self.add_device(device);
            self.task_to_device[index] = Some(device_index);
        }
        Ok(())
    }

    fn add_device(&mut self, device: DeviceId) -> usize {
        match self.devices.iter().position(|d| *d == device) {
            Some(index) => index,
            None => {
                self.devices.push(device);
                self.devices.len() - 1
            }
        }
    }

    /// Runs every task on `device`.
    pub fn map_all_to(&mut self, device: DeviceId) {
        self.devices = vec![device];
        for entry in self.task_to_device.iter_mut() {
            *entry = Some(0);
        }
        for task in self.tasks.iter_mut() {
            task.map_to(device);
        }
    }

    pub fn device_index_for_task(&self, task: usize) -> Result<usize> {
        self.task_to_device
            .get(task)
            .copied()
            .flatten()
            .ok_or_else(|| Error::precondition(format!("task {task} has not been assigned a device")))
    }

    pub fn device_for_task(&self, task: usize) -> Result<DeviceId> {
        let index = self.device_index_for_task(task)?;
        self.device(index)
            .ok_or_else(|| Error::internal(format!("task {task} mapped to missing device {index}")))
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "execution context `{}`", self.name)?;
        writeln!(f, "  tasks:")?;
        for (i, task) in self.tasks.iter().enumerate() {
            let device = match self.task_to_device.get(i).copied().flatten() {
                Some(d) => d.to_string(),
                None => "-".to_string(),
            };
            writeln!(f, "    [{i:2}] {task} -> device {device}")?;
        }
        writeln!(f, "  devices:")?;
        for (i, device) in self.devices.iter().enumerate() {
            writeln!(f, "    [{i:2}] {device}")?;
        }
        writeln!(f, "  constants:")?;
        for (i, c) in self.constants.iter().enumerate() {
            writeln!(f, "    [{i:2}] {c}")?;
        }
        writeln!(f, "  objects:")?;
        for (i, (object, state)) in self.objects.iter().zip(&self.object_states).enumerate() {
            write!(f, "    [{i:2}] {} ({} bytes)", object.name(), object.len())?;
            if state.stream_in {
                write!(f, " stream-in")?;
            }
            if state.forced_stream_in {
                write!(f, " forced")?;
            }
            if state.stream_out {
                write!(f, " stream-out")?;
            }
            for (device, s) in state.devices() {
                write!(f, " {device}:{}", if s.valid { "valid" } else { "stale" })?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Access;
    use crate::core::value::HostBuffer;
    use crate::runtime::manager::{Device, HostDevice};

    fn registry(devices: usize) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry.add_driver(
            "host",
            (0..devices)
                .map(|i| HostDevice::new(format!("host-{i}")) as Arc<dyn Device>)
                .collect(),
        );
        registry
    }

    fn task(id: &str, args: Vec<Value>) -> SchedulableTask {
        let accesses = vec![Access::Read; args.len()];
        SchedulableTask::prebuilt(id, "k", "", args, accesses)
    }

    #[test]
    fn constants_dedup_by_value() {
        let mut ctx = ExecutionContext::new("s0");
        let a = ctx.insert_variable(&Value::from(3i32));
        let b = ctx.insert_variable(&Value::from(3i32));
        let c = ctx.insert_variable(&Value::from(3.0f32));
        assert_eq!(a, VariableSlot::Constant(0));
        assert_eq!(a, b);
        assert_eq!(c, VariableSlot::Constant(1));
    }

    #[test]
    fn objects_dedup_by_identity() {
        let mut ctx = ExecutionContext::new("s0");
        let x = HostBuffer::from_f32("x", &[1.0]);
        let y = HostBuffer::from_f32("y", &[1.0]);
        let a = ctx.insert_variable(&Value::object(&x));
        let b = ctx.insert_variable(&Value::object(&x));
        let c = ctx.insert_variable(&Value::object(&y));
        assert_eq!(a, VariableSlot::Object(0));
        assert_eq!(a, b);
        assert_eq!(c, VariableSlot::Object(1));
        assert_eq!(ctx.object_states().len(), 2);
    }

    #[test]
    fn state_of_does_not_register() {
        let mut ctx = ExecutionContext::new("s0");
        let x = HostBuffer::zeroed("x", 4);
        assert!(ctx.slot_of(&x).is_none());
        assert!(ctx.state_of(0).is_none());
        let slot = ctx.register(&x);
        assert!(ctx.state_of(slot).is_some());
        assert_eq!(ctx.objects().len(), 1);
    }

    #[test]
    fn assignment_prefers_overrides_and_is_idempotent() {
        let registry = registry(3);
        let config = RuntimeConfig::default().with_task_device("t1", "0:2");
        let mut ctx = ExecutionContext::new("s0");
        ctx.add_task(task("t0", vec![]));
        ctx.add_task(task("t1", vec![]));
        ctx.add_task(task("t2", vec![]).with_device(DeviceId::new(0, 1)));
        ctx.assign_to_devices(&registry, &config).unwrap();

        assert_eq!(ctx.device_for_task(0).unwrap(), DeviceId::new(0, 0));
        assert_eq!(ctx.device_for_task(1).unwrap(), DeviceId::new(0, 2));
        assert_eq!(ctx.device_for_task(2).unwrap(), DeviceId::new(0, 1));
        assert_eq!(ctx.devices().len(), 3);

        let other = RuntimeConfig::default().with_task_device("t0", "0:1");
        ctx.assign_to_devices(&registry, &other).unwrap();
        assert_eq!(ctx.device_for_task(0).unwrap(), DeviceId::new(0, 0));
    }

    #[test]
    fn bad_device_strings_fail_at_assignment() {
        let registry = registry(1);
        let mut ctx = ExecutionContext::new("s0");
        ctx.add_task(task("t0", vec![]));
        for spec in ["0:1", "1:0", "gpu"] {
            let config = RuntimeConfig::default().with_task_device("t0", spec);
            assert!(matches!(
                ctx.assign_to_devices(&registry, &config),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn task_to_device_has_no_fixed_bound() {
        let registry = registry(1);
        let mut ctx = ExecutionContext::new("s0");
        for i in 0..250 {
            ctx.add_task(task(&format!("t{i}"), vec![Value::from(i)]));
        }
        ctx.assign_to_devices(&registry, &RuntimeConfig::default()).unwrap();
        assert_eq!(ctx.task_to_device().len(), 250);
        assert_eq!(ctx.device_index_for_task(249).unwrap(), 0);
    }

    #[test]
    fn map_all_to_collapses_devices() {
        let registry = registry(2);
        let config = RuntimeConfig::default().with_task_device("t1", "0:1");
        let mut ctx = ExecutionContext::new("s0");
        ctx.add_task(task("t0", vec![]));
        ctx.add_task(task("t1", vec![]));
        ctx.assign_to_devices(&registry, &config).unwrap();
        assert_eq!(ctx.devices().len(), 2);

        ctx.map_all_to(DeviceId::new(0, 1));
        assert_eq!(ctx.devices(), &[DeviceId::new(0, 1)]);
        assert_eq!(ctx.task_to_device(), &[Some(0), Some(0)]);
    }

    #[test]
    fn mark_written_invalidates_other_copies() {
        let mut state = ObjectState::default();
        let d0 = DeviceId::new(0, 0);
        let d1 = DeviceId::new(0, 1);
        state.device_mut(d0).valid = true;
        state.mark_written(d1);
        assert!(!state.is_valid_on(d0));
        assert!(state.is_valid_on(d1));
        assert!(state.device(d1).map_or(false, |s| s.modified));
    }

    #[test]
    fn replace_variable_keeps_slot() {
        let mut ctx = ExecutionContext::new("s0");
        let x = HostBuffer::zeroed("x", 4);
        let y = HostBuffer::zeroed("y", 4);
        let slot = ctx.mark_stream_out(&x);
        ctx.state_of_mut(slot).unwrap().device_mut(DeviceId::new(0, 0)).valid = true;
        assert_eq!(ctx.replace_variable(&x, &y).unwrap(), slot);
        assert!(ctx.slot_of(&x).is_none());
        assert_eq!(ctx.slot_of(&y), Some(slot));
        let state = ctx.state_of(slot).unwrap();
        assert!(state.stream_out);
        assert!(!state.is_valid_on(DeviceId::new(0, 0)));
    }
}
