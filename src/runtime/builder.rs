//! Turns a recorded invocation stream into a task graph.
//!
//! The stream is a sequence of records, each an opcode byte followed by
//! little-endian `i32` operands:
//!
//! | record | operands |
//! |--------|----------|
//! | `CONTEXT` | global task id, task index |
//! | `ARG_LIST` | argument count |
//! | `LOAD_REF` | object slot |
//! | `LOAD_PRIM` | constant slot |
//! | `LAUNCH` | none |
//!
//! Decoding stops at the first byte that is not one of these opcodes.

use crate::core::config::{CopyOutPolicy, RuntimeConfig};
use crate::core::graph::Graph;
use crate::core::node::{NodeId, NodeKind, NodeTag};
use crate::core::sketch::SketchRegistry;
use crate::core::task::Access;
use crate::error::{Error, Result};
use crate::runtime::context::ExecutionContext;

pub const LOAD_REF: u8 = 8;
pub const LOAD_PRIM: u8 = 9;
pub const LAUNCH: u8 = 10;
pub const ARG_LIST: u8 = 11;
pub const CONTEXT: u8 = 12;

struct Cursor<'s> {
    bytes: &'s [u8],
    pos: usize,
}

impl<'s> Cursor<'s> {
    fn opcode(&mut self) -> Option<u8> {
        let op = *self.bytes.get(self.pos)?;
        match op {
            LOAD_REF | LOAD_PRIM | LAUNCH | ARG_LIST | CONTEXT => {
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn operand(&mut self) -> Result<usize> {
        let raw = self
            .bytes
            .get(self.pos..self.pos + 4)
            .ok_or_else(|| Error::precondition(format!("truncated operand at offset {}", self.pos)))?;
        let value = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let at = self.pos;
        self.pos += 4;
        usize::try_from(value).map_err(|_| Error::precondition(format!("negative operand {value} at offset {at}")))
    }
}

/// Task currently being assembled between `ARG_LIST` and `LAUNCH`.
struct PendingTask {
    size: usize,
    args: Vec<NodeId>,
    written: Vec<usize>,
}

struct Invocation {
    task: usize,
    gtid: usize,
    context: NodeId,
    accesses: Vec<Access>,
}

struct BuildState {
    graph: Graph,
    constants: Vec<NodeId>,
    parameters: Vec<NodeId>,
    /// Node holding the latest value of each object.
    current: Vec<NodeId>,
    /// Node that last brought each object's host copy up to date.
    host: Vec<NodeId>,
    invocation: Option<Invocation>,
    pending: Option<PendingTask>,
}

pub struct GraphBuilder<'a> {
    ctx: &'a ExecutionContext,
    sketches: &'a SketchRegistry,
    policy: CopyOutPolicy,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(ctx: &'a ExecutionContext, sketches: &'a SketchRegistry, config: &RuntimeConfig) -> Self {
        Self {
            ctx,
            sketches,
            policy: config.copy_out_policy,
        }
    }

    pub fn build(&self, stream: &[u8]) -> Result<Graph> {
        let mut graph = Graph::with_capacity(self.ctx.constants().len() + self.ctx.objects().len() + 4 * stream.len() / 9);
        let constants = (0..self.ctx.constants().len())
            .map(|slot| graph.add(NodeKind::Constant { slot }, vec![]))
            .collect();
        let parameters: Vec<NodeId> = (0..self.ctx.objects().len())
            .map(|object| graph.add(NodeKind::Parameter { object }, vec![]))
            .collect();

        let mut state = BuildState {
            graph,
            constants,
            current: parameters.clone(),
            host: parameters.clone(),
            parameters,
            invocation: None,
            pending: None,
        };

        let mut cursor = Cursor { bytes: stream, pos: 0 };
        while let Some(op) = cursor.opcode() {
            match op {
                CONTEXT => {
                    let gtid = cursor.operand()?;
                    let task = cursor.operand()?;
                    self.on_context(&mut state, gtid, task)?;
                }
                ARG_LIST => {
                    let size = cursor.operand()?;
                    self.on_arg_list(&mut state, size)?;
                }
                LOAD_REF => {
                    let object = cursor.operand()?;
                    self.on_load_ref(&mut state, object)?;
                }
                LOAD_PRIM => {
                    let slot = cursor.operand()?;
                    self.on_load_prim(&mut state, slot)?;
                }
                LAUNCH => self.on_launch(&mut state)?,
                _ => unreachable!("cursor only yields input opcodes"),
            }
        }
        if state.pending.is_some() {
            return Err(Error::precondition("stream ended between ARG_LIST and LAUNCH"));
        }

        self.finish(&mut state);
        tracing::debug!(nodes = state.graph.len(), bytes = cursor.pos, "graph built");
        Ok(state.graph)
    }

    fn on_context(&self, state: &mut BuildState, gtid: usize, task: usize) -> Result<()> {
        if state.pending.is_some() {
            return Err(Error::precondition("CONTEXT inside an unfinished ARG_LIST"));
        }
        let descriptor = self
            .ctx
            .task(task)
            .ok_or_else(|| Error::precondition(format!("CONTEXT names task {task}, context has {}", self.ctx.tasks().len())))?;
        let accesses = self.sketches.accesses_for(descriptor)?;
        let device = self.ctx.device_index_for_task(task)?;
        let context = state.graph.add_unique(NodeKind::DeviceContext { device }, vec![]);
        state.invocation = Some(Invocation {
            task,
            gtid,
            context,
            accesses,
        });
        Ok(())
    }

    fn on_arg_list(&self, state: &mut BuildState, size: usize) -> Result<()> {
        if state.invocation.is_none() {
            return Err(Error::precondition("ARG_LIST without a preceding CONTEXT"));
        }
        if state.pending.is_some() {
            return Err(Error::precondition("nested ARG_LIST"));
        }
        state.pending = Some(PendingTask {
            size,
            args: Vec::with_capacity(size),
            written: Vec::new(),
        });
        Ok(())
    }

    fn on_load_ref(&self, state: &mut BuildState, object: usize) -> Result<()> {
        let (context, access) = {
            let (invocation, pending) = match (&state.invocation, &state.pending) {
                (Some(i), Some(p)) => (i, p),
                _ => return Err(Error::precondition("LOAD_REF before CONTEXT and ARG_LIST")),
            };
            let index = pending.args.len();
            if index >= pending.size {
                return Err(Error::precondition(format!("LOAD_REF past the {} declared arguments", pending.size)));
            }
            let access = *invocation.accesses.get(index).ok_or_else(|| {
                Error::precondition(format!(
                    "argument {index} of task {} has no access mode ({} known)",
                    invocation.task,
                    invocation.accesses.len()
                ))
            })?;
            (invocation.context, access)
        };
        if object >= state.parameters.len() {
            return Err(Error::precondition(format!(
                "LOAD_REF of object {object}, context has {}",
                state.parameters.len()
            )));
        }

        let current = state.current[object];
        let node = match state.graph[current].kind.clone() {
            NodeKind::DependentRead { context: source, .. } if source != context => {
                let out = state.graph.add_unique(NodeKind::CopyOut { context: source, object }, vec![current]);
                state.host[object] = out;
                state.graph.add(
                    NodeKind::CopyIn {
                        context,
                        object,
                        exclusive: true,
                    },
                    vec![out],
                )
            }
            kind if kind.context() == Some(context) => current,
            _ => self.transfer_from_host(state, context, object, access),
        };
        state.current[object] = node;

        if let Some(pending) = state.pending.as_mut() {
            pending.args.push(node);
            if access.writes() && !pending.written.contains(&object) {
                pending.written.push(object);
            }
        }
        Ok(())
    }

    /// First use of the host copy of an object in `context`. Transfers take
    /// the node that last updated the host copy as input, so a shared copy is
    /// only reused for the same host version.
    ///
    /// An allocation for a pure write also takes the host version, plus the
    /// transfer that last read it elsewhere. The compiler orders the writer
    /// after both.
    fn transfer_from_host(&self, state: &mut BuildState, context: NodeId, object: usize, access: Access) -> NodeId {
        let host = state.host[object];
        let stream_in = self.ctx.state_of(object).map_or(false, |s| s.stream_in);
        if access == Access::Write {
            let current = state.current[object];
            let inputs = if current == host { vec![host] } else { vec![host, current] };
            state.graph.add_unique(NodeKind::Allocate { context, object }, inputs)
        } else if stream_in {
            state.graph.add_unique(NodeKind::StreamIn { context, object }, vec![host])
        } else if access.writes() {
            let kind = NodeKind::CopyIn {
                context,
                object,
                exclusive: true,
            };
            state.graph.add(kind, vec![host])
        } else {
            let kind = NodeKind::CopyIn {
                context,
                object,
                exclusive: false,
            };
            state.graph.add_unique(kind, vec![host])
        }
    }

    fn on_load_prim(&self, state: &mut BuildState, slot: usize) -> Result<()> {
        let pending = state
            .pending
            .as_mut()
            .ok_or_else(|| Error::precondition("LOAD_PRIM before ARG_LIST"))?;
        if pending.args.len() >= pending.size {
            return Err(Error::precondition(format!("LOAD_PRIM past the {} declared arguments", pending.size)));
        }
        let node = *state
            .constants
            .get(slot)
            .ok_or_else(|| Error::precondition(format!("LOAD_PRIM of constant {slot}, context has {}", state.constants.len())))?;
        pending.args.push(node);
        Ok(())
    }

    fn on_launch(&self, state: &mut BuildState) -> Result<()> {
        let pending = state
            .pending
            .take()
            .ok_or_else(|| Error::precondition("LAUNCH without ARG_LIST"))?;
        let invocation = state
            .invocation
            .take()
            .ok_or_else(|| Error::precondition("LAUNCH without CONTEXT"))?;
        if pending.args.len() != pending.size {
            return Err(Error::precondition(format!(
                "LAUNCH after {} of {} arguments",
                pending.args.len(),
                pending.size
            )));
        }

        let context = invocation.context;
        let graph = &mut state.graph;
        let task = graph.add(
            NodeKind::Task {
                context,
                task: invocation.task,
                gtid: invocation.gtid,
            },
            pending.args,
        );
        graph.push_chain(task);
        graph.add_use(context, task);

        for object in pending.written {
            let read = graph.add(
                NodeKind::DependentRead {
                    context,
                    object,
                    dependent: task,
                },
                vec![task],
            );
            state.current[object] = read;
            if self.policy == CopyOutPolicy::EveryWrite {
                let out = graph.add(NodeKind::CopyOut { context, object }, vec![read]);
                graph.push_chain(out);
                state.host[object] = out;
            }
        }
        Ok(())
    }

    fn finish(&self, state: &mut BuildState) {
        for object in 0..state.parameters.len() {
            let Some(flags) = self.ctx.state_of(object) else {
                continue;
            };
            let current = state.current[object];
            match state.graph[current].kind.clone() {
                NodeKind::DependentRead { context, .. }
                    if flags.stream_out && self.policy == CopyOutPolicy::StreamOutOnly =>
                {
                    let out = state.graph.add_unique(NodeKind::CopyOut { context, object }, vec![current]);
                    state.graph.push_chain(out);
                }
                NodeKind::Parameter { .. } if flags.stream_in => {
                    let first_context = state.graph.filter_kind(NodeTag::DeviceContext).ones().next();
                    if let Some(index) = first_context {
                        let context = NodeId(index as u32);
                        state.graph.add_unique(NodeKind::StreamIn { context, object }, vec![current]);
                    }
                }
                _ => {}
            }
        }
    }
}
