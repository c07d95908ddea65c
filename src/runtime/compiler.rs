//! Scheduler: lowers a task graph to a bytecode program.
//!
//! Every async node gets a dependency set, the async nodes it reads from.
//! Nodes are emitted by a fixed-point pass in ascending id order: a node goes
//! out once all of its dependencies have, and right after it one `ADD_DEP` is
//! written for each waiting node that depends on it. The resulting order is
//! deterministic for a given graph; no critical-path or load heuristics apply.

use std::time::Instant;

use fixedbitset::FixedBitSet;

use crate::core::config::RuntimeConfig;
use crate::core::graph::Graph;
use crate::core::node::{Node, NodeId, NodeKind, NodeTag};
use crate::error::{Error, Result};
use crate::runtime::context::ExecutionContext;
use crate::runtime::plan::{CompiledProgram, GraphAssembler, Opcode, NO_DEP};

#[derive(Debug, Clone)]
pub struct GraphCompiler {
    multi_context: bool,
    blocking_final_stream_out: bool,
}

struct AsyncNode {
    id: NodeId,
    deps: Vec<NodeId>,
    slot: Option<usize>,
}

impl AsyncNode {
    fn dep(&self) -> i32 {
        self.slot.map_or(NO_DEP, |s| s as i32)
    }
}

impl GraphCompiler {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            multi_context: config.multi_context,
            blocking_final_stream_out: config.blocking_final_stream_out,
        }
    }

    /// Compiles `graph`, spanning as many device contexts as it uses.
    pub fn compile(&self, graph: &Graph, ctx: &ExecutionContext) -> Result<CompiledProgram> {
        let contexts = Self::contexts(graph);
        if contexts.len() > 1 && !self.multi_context {
            return Err(Error::unsupported(format!(
                "graph spans {} device contexts and multi-context scheduling is disabled",
                contexts.len()
            )));
        }
        self.schedule(graph, ctx, &contexts)
    }

    /// Compiles a graph whose tasks all share one device.
    pub fn compile_single_context(&self, graph: &Graph, ctx: &ExecutionContext) -> Result<CompiledProgram> {
        let contexts = Self::contexts(graph);
        if contexts.len() > 1 {
            return Err(Error::unsupported(format!(
                "single-context compilation of a graph spanning {} device contexts",
                contexts.len()
            )));
        }
        self.schedule(graph, ctx, &contexts)
    }

    /// Context nodes with their device index, ordered by device.
    fn contexts(graph: &Graph) -> Vec<(NodeId, usize)> {
        let mut contexts = Vec::new();
        graph.papply(&graph.filter_kind(NodeTag::DeviceContext), |node| {
            if let NodeKind::DeviceContext { device } = node.kind {
                contexts.push((node.id, device));
            }
        });
        contexts.sort_by_key(|&(_, device)| device);
        contexts
    }

    /// Async node whose event stands for `input`, if any.
    fn event_source(graph: &Graph, input: NodeId) -> Option<NodeId> {
        match graph.get(input) {
            Some(Node {
                kind: NodeKind::DependentRead { dependent, .. },
                ..
            }) => Some(*dependent),
            Some(n) if n.is_async() => Some(input),
            _ => None,
        }
    }

    /// `ALLOCATE` waits on nothing and signals nothing, so a consumer of an
    /// allocation also waits on whatever the allocation was ordered after.
    fn dependencies(graph: &Graph, node: &Node) -> Vec<NodeId> {
        if let NodeKind::Allocate { .. } = node.kind {
            return Vec::new();
        }
        let mut deps = Vec::new();
        for &input in &node.inputs {
            deps.extend(Self::event_source(graph, input));
            if let Some(Node {
                kind: NodeKind::Allocate { .. },
                inputs,
                ..
            }) = graph.get(input)
            {
                deps.extend(inputs.iter().filter_map(|&i| Self::event_source(graph, i)));
            }
        }
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    fn schedule(&self, graph: &Graph, ctx: &ExecutionContext, contexts: &[(NodeId, usize)]) -> Result<CompiledProgram> {
        let start = Instant::now();

        let mut nodes = Vec::new();
        let mut slots = 0;
        graph.papply(&graph.async_nodes(), |node| {
            let deps = Self::dependencies(graph, node);
            let slot = if deps.is_empty() {
                None
            } else {
                slots += 1;
                Some(slots - 1)
            };
            nodes.push(AsyncNode { id: node.id, deps, slot });
        });
        let num_tasks = graph.filter_kind(NodeTag::Task).count_ones(..);
        let num_contexts = contexts.len().max(1);

        let mut asm = GraphAssembler::with_capacity(32 + 24 * nodes.len());
        asm.setup(num_contexts, num_tasks, slots + 1);
        if contexts.is_empty() {
            asm.context(0);
        }
        for &(_, device) in contexts {
            asm.context(device);
        }
        asm.begin();

        let context_index = |id: NodeId| -> Result<usize> {
            contexts
                .iter()
                .position(|&(c, _)| c == id)
                .ok_or_else(|| Error::internal(format!("node refers to unknown context {id}")))
        };

        let mut scheduled = FixedBitSet::with_capacity(graph.id_bound());
        let mut done = vec![false; nodes.len()];
        let mut remaining = nodes.len();
        let mut last: Option<(usize, Opcode)> = None;
        while remaining > 0 {
            let mut progressed = false;
            for i in 0..nodes.len() {
                if done[i] || nodes[i].deps.iter().any(|d| !scheduled.contains(d.index())) {
                    continue;
                }
                last = Some(self.emit(&mut asm, graph, ctx, &nodes[i], &context_index)?);
                let id = nodes[i].id;
                for (j, waiting) in nodes.iter().enumerate() {
                    if done[j] || j == i || !waiting.deps.contains(&id) {
                        continue;
                    }
                    if let Some(slot) = waiting.slot {
                        asm.add_dep(slot);
                    }
                }
                done[i] = true;
                scheduled.insert(id.index());
                remaining -= 1;
                progressed = true;
            }
            if !progressed {
                let stuck: Vec<String> = nodes
                    .iter()
                    .zip(&done)
                    .filter(|(_, d)| !**d)
                    .map(|(n, _)| n.id.to_string())
                    .collect();
                return Err(Error::internal(format!(
                    "scheduling made no progress; unscheduled nodes {}",
                    stuck.join(", ")
                )));
            }
        }

        // A blocking read only drains its own context, so other contexts keep the barrier.
        match last {
            Some((at, Opcode::StreamOut)) if self.blocking_final_stream_out && num_contexts == 1 => {
                asm.patch_opcode(at, Opcode::StreamOutBlocking);
            }
            _ => {
                asm.barrier(slots);
            }
        }
        asm.end();

        tracing::info!(
            contexts = num_contexts,
            tasks = num_tasks,
            async_nodes = nodes.len(),
            dep_lists = slots + 1,
            bytes = asm.position(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "compiled task graph"
        );
        Ok(asm.finish(num_contexts, num_tasks, slots + 1))
    }

    fn emit<F>(
        &self,
        asm: &mut GraphAssembler,
        graph: &Graph,
        ctx: &ExecutionContext,
        node: &AsyncNode,
        context_index: &F,
    ) -> Result<(usize, Opcode)>
    where
        F: Fn(NodeId) -> Result<usize>,
    {
        let dep = node.dep();
        let emitted = match graph[node.id].kind {
            NodeKind::CopyIn { context, object, .. } => (asm.copy_in(object, context_index(context)?, dep), Opcode::CopyIn),
            NodeKind::CopyOut { context, object } => {
                (asm.stream_out(object, context_index(context)?, dep), Opcode::StreamOut)
            }
            NodeKind::Allocate { context, object } => (asm.allocate(object, context_index(context)?), Opcode::Allocate),
            NodeKind::StreamIn { context, object } => {
                (asm.stream_in(object, context_index(context)?, dep), Opcode::StreamIn)
            }
            NodeKind::Task { context, task, gtid } => {
                let inputs = &graph[node.id].inputs;
                if ctx.task(task).is_none() {
                    return Err(Error::internal(format!("task node {} refers to missing task {task}", node.id)));
                }
                let at = asm.launch(gtid, context_index(context)?, task, inputs.len(), dep);
                for &input in inputs {
                    match graph[input].kind {
                        NodeKind::Constant { slot } => {
                            asm.constant_arg(slot);
                        }
                        ref kind => {
                            let object = kind.object().ok_or_else(|| {
                                Error::internal(format!("task {} argument {input} is {kind}", node.id))
                            })?;
                            asm.reference_arg(object);
                        }
                    }
                }
                (at, Opcode::Launch)
            }
            NodeKind::Parameter { .. }
            | NodeKind::Constant { .. }
            | NodeKind::DeviceContext { .. }
            | NodeKind::DependentRead { .. } => {
                return Err(Error::internal(format!("node {} is not async", node.id)));
            }
        };
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{Access, SchedulableTask};
    use crate::core::value::{HostBuffer, Value};
    use crate::runtime::executor::decode::{decode_all, Instruction};

    fn context_with(objects: usize, tasks: usize) -> ExecutionContext {
        let mut ctx = ExecutionContext::new("test");
        for i in 0..objects {
            ctx.register(&HostBuffer::zeroed(format!("o{i}"), 4));
        }
        for i in 0..tasks {
            ctx.add_task(SchedulableTask::prebuilt(format!("t{i}"), "k", "", vec![], vec![Access::Read]));
        }
        ctx
    }

    /// Params 0..3, context 3, two reads and an allocation, one task, its
    /// dependent read and copy-out.
    fn read_read_write() -> Graph {
        let mut g = Graph::new();
        let p: Vec<NodeId> = (0..3).map(|object| g.add(NodeKind::Parameter { object }, vec![])).collect();
        let c = g.add_unique(NodeKind::DeviceContext { device: 0 }, vec![]);
        let a = g.add_unique(
            NodeKind::CopyIn {
                context: c,
                object: 0,
                exclusive: false,
            },
            vec![p[0]],
        );
        let b = g.add_unique(
            NodeKind::CopyIn {
                context: c,
                object: 1,
                exclusive: false,
            },
            vec![p[1]],
        );
        let out = g.add_unique(NodeKind::Allocate { context: c, object: 2 }, vec![p[2]]);
        let t = g.add(
            NodeKind::Task {
                context: c,
                task: 0,
                gtid: 0,
            },
            vec![a, b, out],
        );
        let dr = g.add(
            NodeKind::DependentRead {
                context: c,
                object: 2,
                dependent: t,
            },
            vec![t],
        );
        g.add(NodeKind::CopyOut { context: c, object: 2 }, vec![dr]);
        g
    }

    #[test]
    fn single_task_program_is_exact() {
        let graph = read_read_write();
        let ctx = context_with(3, 1);
        let program = GraphCompiler::new(&RuntimeConfig::default()).compile(&graph, &ctx).unwrap();

        let mut expected = GraphAssembler::new();
        expected.setup(1, 1, 3);
        expected.context(0);
        expected.begin();
        expected.copy_in(0, 0, NO_DEP);
        expected.add_dep(0);
        expected.copy_in(1, 0, NO_DEP);
        expected.add_dep(0);
        expected.allocate(2, 0);
        expected.add_dep(0);
        expected.launch(0, 0, 0, 3, 0);
        expected.reference_arg(0);
        expected.reference_arg(1);
        expected.reference_arg(2);
        expected.add_dep(1);
        expected.stream_out(2, 0, 1);
        expected.barrier(2);
        expected.end();
        assert_eq!(program.code(), expected.bytes());
        assert_eq!(program.num_dep_lists(), 3);
    }

    #[test]
    fn empty_graph_is_minimal() {
        let program = GraphCompiler::new(&RuntimeConfig::default())
            .compile(&Graph::new(), &ExecutionContext::new("empty"))
            .unwrap();
        let mut expected = GraphAssembler::new();
        expected.setup(1, 0, 1);
        expected.context(0);
        expected.begin();
        expected.barrier(0);
        expected.end();
        assert_eq!(program.code(), expected.bytes());
    }

    #[test]
    fn blocking_final_stream_out_replaces_barrier() {
        let graph = read_read_write();
        let ctx = context_with(3, 1);
        let config = RuntimeConfig {
            blocking_final_stream_out: true,
            ..RuntimeConfig::default()
        };
        let program = GraphCompiler::new(&config).compile(&graph, &ctx).unwrap();
        let ops = decode_all(program.code()).unwrap();
        let tail: Vec<&Instruction> = ops.iter().rev().take(2).collect();
        assert_eq!(*tail[0], Instruction::End);
        assert!(matches!(tail[1], Instruction::StreamOutBlocking { object: 2, .. }));
        assert!(!ops.iter().any(|op| matches!(op, Instruction::Barrier { .. })));

        // Same tail, plus an unrelated task on a second device.
        let mut g = Graph::new();
        let p = g.add(NodeKind::Parameter { object: 0 }, vec![]);
        let c0 = g.add_unique(NodeKind::DeviceContext { device: 0 }, vec![]);
        let c1 = g.add_unique(NodeKind::DeviceContext { device: 1 }, vec![]);
        let alloc = g.add_unique(NodeKind::Allocate { context: c0, object: 0 }, vec![p]);
        let t0 = g.add(
            NodeKind::Task {
                context: c0,
                task: 0,
                gtid: 0,
            },
            vec![alloc],
        );
        g.add(
            NodeKind::Task {
                context: c1,
                task: 1,
                gtid: 1,
            },
            vec![],
        );
        let dr = g.add(
            NodeKind::DependentRead {
                context: c0,
                object: 0,
                dependent: t0,
            },
            vec![t0],
        );
        g.add(NodeKind::CopyOut { context: c0, object: 0 }, vec![dr]);

        let program = GraphCompiler::new(&config).compile(&g, &context_with(1, 2)).unwrap();
        let ops = decode_all(program.code()).unwrap();
        assert_eq!(ops[ops.len() - 1], Instruction::End);
        assert!(matches!(ops[ops.len() - 2], Instruction::Barrier { .. }));
        assert!(ops.iter().any(|op| matches!(op, Instruction::StreamOut { object: 0, .. })));
        assert!(!ops.iter().any(|op| matches!(op, Instruction::StreamOutBlocking { .. })));
    }

    #[test]
    fn allocation_passes_its_ordering_to_the_writer() {
        let mut g = Graph::new();
        let p = g.add(NodeKind::Parameter { object: 0 }, vec![]);
        let c = g.add_unique(NodeKind::DeviceContext { device: 0 }, vec![]);
        let first = g.add_unique(NodeKind::Allocate { context: c, object: 0 }, vec![p]);
        let t0 = g.add(
            NodeKind::Task {
                context: c,
                task: 0,
                gtid: 0,
            },
            vec![first],
        );
        let dr = g.add(
            NodeKind::DependentRead {
                context: c,
                object: 0,
                dependent: t0,
            },
            vec![t0],
        );
        let out = g.add(NodeKind::CopyOut { context: c, object: 0 }, vec![dr]);
        let second = g.add_unique(NodeKind::Allocate { context: c, object: 0 }, vec![out]);
        assert_ne!(first, second);
        let t1 = g.add(
            NodeKind::Task {
                context: c,
                task: 0,
                gtid: 1,
            },
            vec![second],
        );

        assert!(GraphCompiler::dependencies(&g, &g[second]).is_empty());
        assert_eq!(GraphCompiler::dependencies(&g, &g[t1]), vec![out, second]);
    }

    #[test]
    fn constant_arguments_use_constant_slots() {
        let mut ctx = context_with(1, 1);
        ctx.insert_variable(&Value::from(2.5f32));
        let mut g = Graph::new();
        let k = g.add(NodeKind::Constant { slot: 0 }, vec![]);
        let p = g.add(NodeKind::Parameter { object: 0 }, vec![]);
        let c = g.add_unique(NodeKind::DeviceContext { device: 0 }, vec![]);
        let x = g.add(
            NodeKind::CopyIn {
                context: c,
                object: 0,
                exclusive: true,
            },
            vec![p],
        );
        g.add(
            NodeKind::Task {
                context: c,
                task: 0,
                gtid: 0,
            },
            vec![x, k],
        );
        let program = GraphCompiler::new(&RuntimeConfig::default()).compile(&g, &ctx).unwrap();
        let ops = decode_all(program.code()).unwrap();
        let launch = ops.iter().position(|op| matches!(op, Instruction::Launch { .. })).unwrap();
        assert_eq!(ops[launch + 1], Instruction::ReferenceArg { slot: 0 });
        assert_eq!(ops[launch + 2], Instruction::ConstantArg { slot: 0 });
    }

    #[test]
    fn two_contexts_respect_configuration() {
        let mut g = Graph::new();
        let c0 = g.add_unique(NodeKind::DeviceContext { device: 1 }, vec![]);
        let c1 = g.add_unique(NodeKind::DeviceContext { device: 0 }, vec![]);
        for (gtid, context) in [c0, c1].into_iter().enumerate() {
            g.add(NodeKind::Task { context, task: gtid, gtid }, vec![]);
        }
        let ctx = context_with(0, 2);

        let single = GraphCompiler::new(&RuntimeConfig::default()).compile_single_context(&g, &ctx);
        assert!(matches!(single, Err(Error::Unsupported(_))));

        let disabled = RuntimeConfig {
            multi_context: false,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            GraphCompiler::new(&disabled).compile(&g, &ctx),
            Err(Error::Unsupported(_))
        ));

        let program = GraphCompiler::new(&RuntimeConfig::default()).compile(&g, &ctx).unwrap();
        let ops = decode_all(program.code()).unwrap();
        assert_eq!(
            &ops[..3],
            &[
                Instruction::Setup {
                    contexts: 2,
                    stacks: 2,
                    dep_lists: 1
                },
                Instruction::Context { device: 0 },
                Instruction::Context { device: 1 },
            ]
        );
        // Task 0 lives on device 1, which is declared second.
        assert!(ops.iter().any(|op| matches!(op, Instruction::Launch { task: 0, context: 1, .. })));
    }

    #[test]
    fn cycles_are_internal_errors() {
        let mut g = Graph::new();
        let c = g.add_unique(NodeKind::DeviceContext { device: 0 }, vec![]);
        let a = g.add(
            NodeKind::Task {
                context: c,
                task: 0,
                gtid: 0,
            },
            vec![NodeId(2)],
        );
        g.add(
            NodeKind::Task {
                context: c,
                task: 0,
                gtid: 1,
            },
            vec![a],
        );
        let ctx = context_with(0, 1);
        assert!(matches!(
            GraphCompiler::new(&RuntimeConfig::default()).compile(&g, &ctx),
            Err(Error::Internal(_))
        ));
    }
}
