use std::fmt::Write as _;
use std::sync::Arc;

use crate::core::device::DeviceId;
use crate::core::graph::Graph;
use crate::core::task::SchedulableTask;
use crate::core::value::ObjectRef;
use crate::error::{Error, Result};
use crate::frontend::recorder::InvocationRecorder;
use crate::runtime::builder::GraphBuilder;
use crate::runtime::compiler::GraphCompiler;
use crate::runtime::context::ExecutionContext;
use crate::runtime::executor::{TaskGraphVm, VmStats};
use crate::runtime::manager::{ProgramKey, RuntimeManager};
use crate::runtime::plan::CompiledProgram;

/// A named sequence of task invocations, compiled once and executed many
/// times.
///
/// ```no_run
/// # use tessera::{HostBuffer, RuntimeConfig, RuntimeManager, SchedulableTask, TaskSchedule, Value, Access};
/// let runtime = RuntimeManager::host(1, RuntimeConfig::default());
/// let x = HostBuffer::from_f32("x", &[1.0, 2.0]);
/// let mut schedule = TaskSchedule::new("s0", runtime);
/// schedule
///     .task(SchedulableTask::prebuilt("t0", "scale", "", vec![Value::object(&x)], vec![Access::ReadWrite]))
///     .stream_out(&[&x]);
/// schedule.execute()?;
/// # Ok::<(), tessera::Error>(())
/// ```
pub struct TaskSchedule {
    id: String,
    runtime: Arc<RuntimeManager>,
    ctx: ExecutionContext,
    recorder: InvocationRecorder,
    mapped: Option<DeviceId>,
    graph: Option<Graph>,
    program: Option<Arc<CompiledProgram>>,
    vm: Option<TaskGraphVm>,
}

impl TaskSchedule {
    pub fn new(id: impl Into<String>, runtime: Arc<RuntimeManager>) -> Self {
        let id = id.into();
        Self {
            ctx: ExecutionContext::new(id.clone()),
            id,
            runtime,
            recorder: InvocationRecorder::new(),
            mapped: None,
            graph: None,
            program: None,
            vm: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn invalidate(&mut self) {
        self.graph = None;
        self.program = None;
        self.vm = None;
    }

    /// Appends one invocation of `task`.
    pub fn task(&mut self, task: SchedulableTask) -> &mut Self {
        self.recorder.record(&mut self.ctx, task);
        self.invalidate();
        self
    }

    /// Objects copied to the device on every execution.
    pub fn stream_in(&mut self, objects: &[&ObjectRef]) -> &mut Self {
        for object in objects {
            self.ctx.mark_stream_in(object);
        }
        self.invalidate();
        self
    }

    /// Like [`stream_in`](Self::stream_in), also after device writes.
    pub fn force_stream_in(&mut self, objects: &[&ObjectRef]) -> &mut Self {
        for object in objects {
            self.ctx.force_stream_in(object);
        }
        self.invalidate();
        self
    }

    /// Objects copied back to the host after their last writer.
    pub fn stream_out(&mut self, objects: &[&ObjectRef]) -> &mut Self {
        for object in objects {
            self.ctx.mark_stream_out(object);
        }
        self.invalidate();
        self
    }

    /// Runs every task of the schedule on `device`.
    pub fn map_all_to(&mut self, device: DeviceId) -> &mut Self {
        self.mapped = Some(device);
        self.invalidate();
        self
    }

    /// Swaps `old` for `new` in every task without recompiling.
    pub fn replace(&mut self, old: &ObjectRef, new: &ObjectRef) -> Result<()> {
        self.ctx.replace_variable(old, new)?;
        Ok(())
    }

    fn program_key(&self) -> Result<ProgramKey> {
        let accesses = self
            .ctx
            .tasks()
            .iter()
            .map(|task| self.runtime.sketches.accesses_for(task))
            .collect::<Result<Vec<_>>>()?;
        Ok(ProgramKey {
            stream: self.recorder.bytes().to_vec(),
            accesses,
            object_flags: self
                .ctx
                .object_states()
                .iter()
                .map(|s| (s.stream_in, s.stream_out))
                .collect(),
            devices: self.ctx.devices().to_vec(),
            task_to_device: self.ctx.task_to_device().to_vec(),
            copy_out_policy: self.runtime.config.copy_out_policy,
            blocking_final_stream_out: self.runtime.config.blocking_final_stream_out,
        })
    }

    /// Assigns devices, builds the graph and compiles it, reusing a cached
    /// program when an identical schedule was compiled before.
    pub fn compile(&mut self) -> Result<Arc<CompiledProgram>> {
        if let Some(program) = &self.program {
            return Ok(Arc::clone(program));
        }
        if let Some(device) = self.mapped {
            self.runtime.registry.check(device)?;
            self.ctx.map_all_to(device);
        }
        self.ctx.assign_to_devices(&self.runtime.registry, &self.runtime.config)?;

        let key = self.program_key()?;
        let cached = self.runtime.programs.read().get(&key);
        let program = match cached {
            Some(program) => {
                tracing::debug!(schedule = %self.id, "program cache hit");
                program
            }
            None => {
                let config = &self.runtime.config;
                let graph = GraphBuilder::new(&self.ctx, &self.runtime.sketches, config).build(self.recorder.bytes())?;
                let program = Arc::new(GraphCompiler::new(config).compile(&graph, &self.ctx)?);
                self.graph = Some(graph);
                self.runtime.programs.write().insert(key, Arc::clone(&program));
                program
            }
        };
        self.program = Some(Arc::clone(&program));
        self.vm = None;

        if self.runtime.config.dump_schedule {
            tracing::info!(schedule = %self.id, "\n{}", self.dump());
        }
        Ok(program)
    }

    fn ensure_vm(&mut self) -> Result<()> {
        let program = self.compile()?;
        if self.vm.is_none() {
            self.vm = Some(TaskGraphVm::new(Arc::clone(&self.runtime), program, &self.ctx)?);
        }
        Ok(())
    }

    /// Compiles on first use, then runs the program.
    pub fn execute(&mut self) -> Result<VmStats> {
        self.ensure_vm()?;
        let vm = self.vm.as_mut().ok_or_else(|| Error::internal(format!("schedule `{}` has no vm", self.id)))?;
        vm.execute(&mut self.ctx)?;
        Ok(vm.stats())
    }

    /// Installs the code of every task without running anything.
    pub fn warmup(&mut self) -> Result<()> {
        self.ensure_vm()?;
        let vm = self.vm.as_mut().ok_or_else(|| Error::internal(format!("schedule `{}` has no vm", self.id)))?;
        vm.warmup(&mut self.ctx)
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Graph of the last compilation; `None` when the program came from the
    /// cache or nothing was compiled yet.
    pub fn graph(&self) -> Option<&Graph> {
        self.graph.as_ref()
    }

    pub fn program(&self) -> Option<&Arc<CompiledProgram>> {
        self.program.as_ref()
    }

    pub fn stats(&self) -> Option<VmStats> {
        self.vm.as_ref().map(TaskGraphVm::stats)
    }

    /// Context tables, graph and program as text.
    pub fn dump(&self) -> String {
        let mut out = self.ctx.to_string();
        if let Some(graph) = &self.graph {
            let _ = write!(out, "{graph}");
        }
        if let Some(program) = &self.program {
            let _ = writeln!(out, "program: {} bytes", program.len());
            out.push_str(&program.dump());
        }
        out
    }
}
