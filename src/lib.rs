//! # Tessera: task-graph compiler and bytecode VM for heterogeneous devices
//!
//! Tessera records a sequence of kernel invocations, turns it into a
//! dependency graph, assigns every task to a device and compiles the graph
//! into a compact bytecode program. A small VM replays that program against
//! the installed devices, issuing transfers and launches that wait only on the
//! events they depend on.
//!
//! ## Modules
//!
//! - **[`core`]**: task graph, values, tasks, sketches, device ids and configuration.
//! - **[`runtime`]**: execution context, graph builder, scheduler, bytecode and VM.
//! - **[`frontend`]**: [`TaskSchedule`], the user-facing entry point.
//!
//! ## Logging
//!
//! Everything logs through `tracing`. Binaries and tests can call
//! [`init_logging`] to get a formatted subscriber honouring `RUST_LOG`.

pub mod core;
pub mod error;
pub mod frontend;
pub mod runtime;

pub use crate::core::config::{CopyOutPolicy, RuntimeConfig};
pub use crate::core::device::{BackendType, DeviceId};
pub use crate::core::graph::Graph;
pub use crate::core::node::{Node, NodeId, NodeKind, NodeTag};
pub use crate::core::sketch::{Sketch, SketchRegistry};
pub use crate::core::task::{Access, SchedulableTask, TaskKind};
pub use crate::core::value::{HostBuffer, ObjectRef, Primitive, Value};
pub use crate::error::{Error, Result};
pub use crate::frontend::{InvocationRecorder, TaskSchedule};
pub use crate::runtime::{
    CompiledProgram, ExecutionContext, GraphAssembler, GraphBuilder, GraphCompiler, HostDevice, RuntimeManager,
    TaskGraphVm, VmStats,
};

/// Installs a `tracing-subscriber` fmt subscriber filtered by `RUST_LOG`
/// (default `info`). Does nothing if a global subscriber is already set.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
