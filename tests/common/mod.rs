#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tessera::runtime::executor::{decode_all, Instruction};
use tessera::runtime::manager::{Device, DeviceRegistry, HostDevice};
use tessera::{
    CompiledProgram, ExecutionContext, Graph, GraphBuilder, GraphCompiler, InvocationRecorder, RuntimeConfig,
    SchedulableTask, SketchRegistry,
};

pub fn registry(devices: usize) -> DeviceRegistry {
    let mut registry = DeviceRegistry::new();
    registry.add_driver(
        "host",
        (0..devices)
            .map(|i| HostDevice::new(format!("host-{i}")) as Arc<dyn Device>)
            .collect(),
    );
    registry
}

/// A schedule recorded by hand, without a runtime.
pub struct Recording {
    pub ctx: ExecutionContext,
    pub recorder: InvocationRecorder,
    pub sketches: SketchRegistry,
    pub config: RuntimeConfig,
    pub devices: usize,
}

impl Recording {
    pub fn new(devices: usize) -> Self {
        Self::with_config(devices, RuntimeConfig::default())
    }

    pub fn with_config(devices: usize, config: RuntimeConfig) -> Self {
        Self {
            ctx: ExecutionContext::new("test"),
            recorder: InvocationRecorder::new(),
            sketches: SketchRegistry::new(),
            config,
            devices,
        }
    }

    pub fn task(&mut self, task: SchedulableTask) -> usize {
        self.recorder.record(&mut self.ctx, task)
    }

    pub fn graph(&mut self) -> tessera::Result<Graph> {
        self.ctx.assign_to_devices(&registry(self.devices), &self.config)?;
        GraphBuilder::new(&self.ctx, &self.sketches, &self.config).build(self.recorder.bytes())
    }

    pub fn compile(&mut self) -> tessera::Result<CompiledProgram> {
        let graph = self.graph()?;
        GraphCompiler::new(&self.config).compile(&graph, &self.ctx)
    }
}

/// Checks the dependency-list invariants of a program:
/// every list index is declared by SETUP, every ADD_DEP into a list happens
/// before the single instruction that consumes it.
pub fn check_dependency_lists(program: &CompiledProgram) -> Vec<Instruction> {
    let ops = decode_all(program.code()).expect("program decodes");
    let declared = match ops.first() {
        Some(Instruction::Setup { dep_lists, .. }) => *dep_lists,
        other => panic!("program starts with {other:?}"),
    };
    let mut consumed = HashSet::new();
    for op in &ops {
        let dep = match *op {
            Instruction::CopyIn { dep, .. }
            | Instruction::StreamIn { dep, .. }
            | Instruction::StreamOut { dep, .. }
            | Instruction::StreamOutBlocking { dep, .. }
            | Instruction::Launch { dep, .. } => dep,
            Instruction::AddDep { list } => {
                assert!(list < declared, "ADD_DEP({list}) beyond {declared} lists");
                assert!(!consumed.contains(&list), "ADD_DEP({list}) after the list was consumed");
                None
            }
            Instruction::Barrier { list } => {
                assert!(list < declared, "BARRIER({list}) beyond {declared} lists");
                None
            }
            _ => None,
        };
        if let Some(list) = dep {
            assert!(list < declared, "dependency list {list} beyond {declared}");
            assert!(consumed.insert(list), "dependency list {list} consumed twice");
        }
    }
    assert_eq!(ops.last(), Some(&Instruction::End));
    ops
}

pub fn launch_position(ops: &[Instruction], task: usize) -> usize {
    ops.iter()
        .position(|op| matches!(op, Instruction::Launch { task: t, .. } if *t == task))
        .unwrap_or_else(|| panic!("no LAUNCH of task {task}"))
}

/// Instructions whose event an `ADD_DEP(list)` captures, in program order.
pub fn list_producers(ops: &[Instruction], list: usize) -> Vec<Instruction> {
    let mut producers = Vec::new();
    let mut last: Option<&Instruction> = None;
    for op in ops {
        match *op {
            Instruction::AddDep { list: l } => {
                if let (true, Some(producer)) = (l == list, last) {
                    producers.push(*producer);
                }
            }
            Instruction::ConstantArg { .. } | Instruction::ReferenceArg { .. } => {}
            Instruction::CopyIn { .. }
            | Instruction::StreamIn { .. }
            | Instruction::StreamOut { .. }
            | Instruction::StreamOutBlocking { .. }
            | Instruction::Launch { .. } => last = Some(op),
            _ => last = None,
        }
    }
    producers
}

/// For every LAUNCH, keyed by global task id, the global ids of the launches
/// it transitively waits on through dependency lists.
pub fn launch_ancestors(ops: &[Instruction]) -> HashMap<usize, HashSet<usize>> {
    let mut lists: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut reach: Vec<HashSet<usize>> = vec![HashSet::new(); ops.len()];
    let mut last: Option<usize> = None;
    for (i, op) in ops.iter().enumerate() {
        let dep = match *op {
            Instruction::AddDep { list } => {
                if let Some(producer) = last {
                    lists.entry(list).or_default().push(producer);
                }
                continue;
            }
            Instruction::ConstantArg { .. } | Instruction::ReferenceArg { .. } => continue,
            Instruction::CopyIn { dep, .. }
            | Instruction::StreamIn { dep, .. }
            | Instruction::StreamOut { dep, .. }
            | Instruction::StreamOutBlocking { dep, .. }
            | Instruction::Launch { dep, .. } => dep,
            _ => {
                last = None;
                continue;
            }
        };
        let mut set = HashSet::new();
        for &producer in dep.and_then(|l| lists.get(&l)).into_iter().flatten() {
            set.extend(reach[producer].iter().copied());
            if let Instruction::Launch { gtid, .. } = ops[producer] {
                set.insert(gtid);
            }
        }
        reach[i] = set;
        last = Some(i);
    }
    ops.iter()
        .zip(reach)
        .filter_map(|(op, set)| match *op {
            Instruction::Launch { gtid, .. } => Some((gtid, set)),
            _ => None,
        })
        .collect()
}
