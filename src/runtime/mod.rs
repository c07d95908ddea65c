//! # Runtime
//!
//! From a recorded invocation stream to device operations:
//!
//! - **[`context`]:** per-schedule tables of tasks, constants, objects and devices.
//! - **[`builder`]:** decodes the invocation stream into a [`Graph`](crate::core::graph::Graph).
//! - **[`compiler`]:** schedules async nodes and emits bytecode.
//! - **[`plan`]:** the bytecode format and its assembler.
//! - **[`executor`]:** the VM that replays a program on devices.
//! - **[`manager`]:** devices, code and program caches shared across schedules.

pub mod builder;
pub mod compiler;
pub mod context;
pub mod executor;
pub mod manager;
pub mod plan;

pub use builder::GraphBuilder;
pub use compiler::GraphCompiler;
pub use context::{ExecutionContext, ObjectState, VariableSlot};
pub use executor::{TaskGraphVm, VmStats};
pub use manager::{BufferId, Device, DeviceRegistry, Event, HostDevice, KernelArg, KernelId, RuntimeManager};
pub use plan::{CompiledProgram, GraphAssembler, Opcode};
