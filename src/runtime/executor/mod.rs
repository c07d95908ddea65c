//! Bytecode interpreter.
//!
//! [`TaskGraphVm`] replays a [`CompiledProgram`] against the devices of a
//! [`RuntimeManager`] and the object tables of an [`ExecutionContext`]. Device
//! operations are issued in program order; a dependency list collects the
//! events an operation must wait for and is emptied when consumed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::device::DeviceId;
use crate::core::task::Access;
use crate::error::{Error, Result};
use crate::runtime::context::ExecutionContext;
use crate::runtime::manager::{BufferId, Device, Event, KernelArg, RuntimeManager};
use crate::runtime::plan::CompiledProgram;

pub mod decode;
pub mod events;

pub use decode::{decode_all, Decoder, Instruction};
pub use events::EventLists;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Completed `execute` calls.
    pub invocations: u64,
    /// Instructions interpreted, header excluded.
    pub bytecodes: u64,
    pub launches: u64,
    pub transfers: u64,
    /// Wall time spent issuing device operations.
    pub issue_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Execute,
    Warmup,
}

pub struct TaskGraphVm {
    runtime: Arc<RuntimeManager>,
    program: Arc<CompiledProgram>,
    /// Device of each declared context, in declaration order.
    contexts: Vec<DeviceId>,
    devices: Vec<Arc<dyn Device>>,
    /// Offset of the first instruction after `BEGIN`.
    body: usize,
    accesses: Vec<Vec<Access>>,
    events: EventLists,
    frames: Vec<Vec<KernelArg>>,
    use_dependencies: bool,
    stats: VmStats,
}

impl TaskGraphVm {
    /// Validates the program header and brings up every context's device.
    pub fn new(runtime: Arc<RuntimeManager>, program: Arc<CompiledProgram>, ctx: &ExecutionContext) -> Result<Self> {
        let mut decoder = Decoder::new(program.code());
        let (contexts_declared, stacks, dep_lists) = match decoder.next() {
            Some(Ok((
                _,
                Instruction::Setup {
                    contexts,
                    stacks,
                    dep_lists,
                },
            ))) => (contexts, stacks, dep_lists),
            Some(Err(e)) => return Err(e),
            _ => return Err(Error::bytecode(0, "program does not start with SETUP")),
        };

        let mut contexts = Vec::with_capacity(contexts_declared);
        let body = loop {
            match decoder.next() {
                Some(Ok((offset, Instruction::Context { device }))) => {
                    let id = match ctx.device(device) {
                        Some(id) => id,
                        None if ctx.devices().is_empty() && device == 0 => {
                            runtime.registry.resolve_str(&runtime.config.default_device)?
                        }
                        None => {
                            return Err(Error::bytecode(
                                offset,
                                format!("CONTEXT names device {device}, context has {}", ctx.devices().len()),
                            ))
                        }
                    };
                    contexts.push(id);
                }
                Some(Ok((_, Instruction::Begin))) => break decoder.position(),
                Some(Ok((offset, other))) => {
                    return Err(Error::bytecode(offset, format!("unexpected {other:?} in program header")))
                }
                Some(Err(e)) => return Err(e),
                None => return Err(Error::bytecode(decoder.position(), "program header is not closed by BEGIN")),
            }
        };
        if contexts.len() != contexts_declared {
            return Err(Error::bytecode(
                0,
                format!("SETUP declares {contexts_declared} contexts, header has {}", contexts.len()),
            ));
        }

        let mut devices = Vec::with_capacity(contexts.len());
        for &id in &contexts {
            let device = runtime.device(id)?;
            device.ensure_loaded()?;
            tracing::debug!(device = %id, name = %device.name(), "context loaded");
            devices.push(device);
        }

        let accesses = ctx
            .tasks()
            .iter()
            .map(|task| runtime.sketches.accesses_for(task))
            .collect::<Result<Vec<_>>>()?;

        let max_events = runtime.config.max_events;
        let use_dependencies = runtime.config.use_dependencies;
        Ok(Self {
            runtime,
            program,
            contexts,
            devices,
            body,
            accesses,
            events: EventLists::new(dep_lists, max_events),
            frames: vec![Vec::new(); stacks],
            use_dependencies,
            stats: VmStats::default(),
        })
    }

    pub fn program(&self) -> &Arc<CompiledProgram> {
        &self.program
    }

    pub fn contexts(&self) -> &[DeviceId] {
        &self.contexts
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    /// Arguments of the last launch of invocation `gtid`.
    pub fn frame(&self, gtid: usize) -> Option<&[KernelArg]> {
        self.frames.get(gtid).map(Vec::as_slice)
    }

    /// Runs the program once.
    pub fn execute(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        self.run(ctx, Mode::Execute)?;
        self.stats.invocations += 1;
        Ok(())
    }

    /// Installs the code of every launched task without moving data or
    /// launching anything.
    pub fn warmup(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        self.run(ctx, Mode::Warmup)
    }

    fn context(&self, index: usize, offset: usize) -> Result<(DeviceId, Arc<dyn Device>)> {
        match (self.contexts.get(index), self.devices.get(index)) {
            (Some(id), Some(device)) => Ok((*id, Arc::clone(device))),
            _ => Err(Error::bytecode(offset, format!("context {index} was not declared"))),
        }
    }

    /// Events of `dep` that `target` can wait on. Events of other devices are
    /// resolved here, on the host.
    fn wait_list(&mut self, dep: Option<usize>, target: DeviceId) -> Result<Vec<Event>> {
        let Some(list) = dep else {
            return Ok(Vec::new());
        };
        let entries = self.events.take(list);
        let mut wait = Vec::with_capacity(entries.len());
        for (device, event) in entries {
            if device == target {
                if self.use_dependencies {
                    wait.push(event);
                }
            } else {
                self.runtime.device(device)?.resolve(event)?;
            }
        }
        Ok(wait)
    }

    fn buffer(
        ctx: &mut ExecutionContext,
        object: usize,
        id: DeviceId,
        device: &dyn Device,
        allocate: bool,
    ) -> Result<BufferId> {
        let bytes = ctx
            .object(object)
            .map(|o| o.len())
            .ok_or_else(|| Error::execution(format!("object slot {object} does not exist")))?;
        let state = ctx
            .state_of_mut(object)
            .ok_or_else(|| Error::execution(format!("object slot {object} has no state")))?
            .device_mut(id);
        match state.buffer {
            Some(buffer) => Ok(buffer),
            None if allocate => {
                let buffer = device.allocate(bytes)?;
                state.buffer = Some(buffer);
                Ok(buffer)
            }
            None => Err(Error::execution(format!("object slot {object} is not resident on {id}"))),
        }
    }

    fn run(&mut self, ctx: &mut ExecutionContext, mode: Mode) -> Result<()> {
        let program = Arc::clone(&self.program);
        let start = Instant::now();
        let mut last: Option<(DeviceId, Event)> = None;
        let mut decoder = Decoder::at(program.code(), self.body);

        while let Some(item) = decoder.next() {
            let (offset, instruction) = item?;
            self.stats.bytecodes += 1;
            tracing::debug!(offset, ?instruction, "vm");

            match instruction {
                Instruction::End => break,
                Instruction::AddDep { list } => {
                    if let Some((device, event)) = last {
                        self.events.push(list, device, event)?;
                    }
                }
                Instruction::Launch {
                    gtid,
                    context,
                    task,
                    num_args,
                    dep,
                } => {
                    let (id, device) = self.context(context, offset)?;
                    let descriptor = ctx
                        .task(task)
                        .ok_or_else(|| Error::bytecode(offset, format!("LAUNCH of unknown task {task}")))?
                        .clone();
                    if gtid >= self.frames.len() {
                        return Err(Error::bytecode(offset, format!("invocation {gtid} exceeds {} stacks", self.frames.len())));
                    }

                    let mut references = Vec::new();
                    let mut args = Vec::with_capacity(num_args);
                    for index in 0..num_args {
                        match decoder.next() {
                            Some(Ok((_, Instruction::ConstantArg { slot }))) => {
                                let value = ctx.constants().get(slot).copied().ok_or_else(|| {
                                    Error::bytecode(offset, format!("constant slot {slot} does not exist"))
                                })?;
                                args.push(KernelArg::Scalar(value));
                            }
                            Some(Ok((_, Instruction::ReferenceArg { slot }))) => {
                                references.push((index, slot));
                                if mode == Mode::Execute {
                                    args.push(KernelArg::Buffer(Self::buffer(ctx, slot, id, device.as_ref(), false)?));
                                }
                            }
                            Some(Err(e)) => return Err(e),
                            _ => {
                                return Err(Error::bytecode(
                                    offset,
                                    format!("LAUNCH of task `{}` expects {num_args} arguments", descriptor.id()),
                                ))
                            }
                        }
                    }

                    let kernel = self.runtime.install(id, &descriptor)?;
                    if mode == Mode::Warmup {
                        continue;
                    }

                    let wait = self.wait_list(dep, id)?;
                    let event = device.launch(kernel, &args, &wait).map_err(|e| {
                        Error::execution(format!("launch of task `{}` on {id} failed: {e}", descriptor.id()))
                    })?;
                    let accesses = self.accesses.get(task).map_or(&[][..], Vec::as_slice);
                    for (index, slot) in references {
                        if accesses.get(index).map_or(true, |a| a.writes()) {
                            if let Some(state) = ctx.state_of_mut(slot) {
                                state.mark_written(id);
                            }
                        }
                    }
                    self.frames[gtid] = args;
                    self.stats.launches += 1;
                    last = Some((id, event));
                }
                Instruction::ConstantArg { .. } | Instruction::ReferenceArg { .. } => {
                    return Err(Error::bytecode(offset, "argument outside of LAUNCH"));
                }
                Instruction::Setup { .. } | Instruction::Context { .. } | Instruction::Begin => {
                    return Err(Error::bytecode(offset, "header instruction in program body"));
                }
                _ if mode == Mode::Warmup => {
                    last = None;
                }
                Instruction::Allocate { object, context } => {
                    let (id, device) = self.context(context, offset)?;
                    Self::buffer(ctx, object, id, device.as_ref(), true)?;
                    last = None;
                }
                Instruction::CopyIn { object, context, dep } | Instruction::StreamIn { object, context, dep } => {
                    let (id, device) = self.context(context, offset)?;
                    let buffer = Self::buffer(ctx, object, id, device.as_ref(), true)?;
                    let wait = self.wait_list(dep, id)?;
                    let copy = match ctx.state_of(object) {
                        // Stream-ins keep unsaved device results unless forced.
                        Some(s) if matches!(instruction, Instruction::StreamIn { .. }) => {
                            s.forced_stream_in || !s.device(id).map_or(false, |d| d.modified)
                        }
                        Some(s) => !s.is_valid_on(id),
                        None => true,
                    };
                    if copy {
                        let event = {
                            let host = ctx
                                .object(object)
                                .ok_or_else(|| Error::execution(format!("object slot {object} does not exist")))?
                                .read();
                            device.write(buffer, &host, &wait)?
                        };
                        if let Some(state) = ctx.state_of_mut(object) {
                            let device_state = state.device_mut(id);
                            device_state.valid = true;
                            device_state.modified = false;
                        }
                        self.stats.transfers += 1;
                        last = Some((id, event));
                    } else {
                        for event in wait {
                            device.resolve(event)?;
                        }
                        last = None;
                    }
                }
                Instruction::StreamOut { object, context, dep }
                | Instruction::StreamOutBlocking { object, context, dep } => {
                    let (id, device) = self.context(context, offset)?;
                    let buffer = Self::buffer(ctx, object, id, device.as_ref(), false)?;
                    let wait = self.wait_list(dep, id)?;
                    let blocking = matches!(instruction, Instruction::StreamOutBlocking { .. });
                    let event = {
                        let object_ref = ctx
                            .object(object)
                            .ok_or_else(|| Error::execution(format!("object slot {object} does not exist")))?;
                        let mut host = object_ref.write();
                        device.read(buffer, &mut host, &wait, blocking)?
                    };
                    if let Some(state) = ctx.state_of_mut(object) {
                        state.device_mut(id).modified = false;
                    }
                    self.stats.transfers += 1;
                    last = Some((id, event));
                }
                Instruction::Barrier { list } => {
                    let pending = self.events.take(list);
                    for (id, device) in self.contexts.iter().zip(&self.devices) {
                        let wait: Vec<Event> = pending.iter().filter(|(d, _)| d == id).map(|&(_, e)| e).collect();
                        let event = device.barrier(&wait)?;
                        device.resolve(event)?;
                    }
                    last = None;
                }
            }
        }

        for device in &self.devices {
            device.flush()?;
        }
        self.events.reset();
        self.stats.issue_time += start.elapsed();
        tracing::debug!(
            mode = ?mode,
            bytecodes = self.stats.bytecodes,
            launches = self.stats.launches,
            transfers = self.stats.transfers,
            "program replayed"
        );
        Ok(())
    }
}
