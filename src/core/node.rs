use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable handle of a node inside its [`Graph`](crate::core::graph::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Node variants. `object` and `slot` fields index the execution context's
/// object and constant tables; `context` fields point at a `DeviceContext` node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Parameter { object: usize },
    Constant { slot: usize },
    /// Host-to-device copy. Exclusive copies are never shared between readers.
    CopyIn { context: NodeId, object: usize, exclusive: bool },
    /// Device-to-host copy.
    CopyOut { context: NodeId, object: usize },
    Allocate { context: NodeId, object: usize },
    /// Host-to-device copy performed on every execution.
    StreamIn { context: NodeId, object: usize },
    Task { context: NodeId, task: usize, gtid: usize },
    DeviceContext { device: usize },
    /// The value of `object` as left behind by the `dependent` task.
    DependentRead { context: NodeId, object: usize, dependent: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeTag {
    Parameter,
    Constant,
    CopyIn,
    CopyOut,
    Allocate,
    StreamIn,
    Task,
    DeviceContext,
    DependentRead,
}

impl NodeKind {
    pub fn tag(&self) -> NodeTag {
        match self {
            NodeKind::Parameter { .. } => NodeTag::Parameter,
            NodeKind::Constant { .. } => NodeTag::Constant,
            NodeKind::CopyIn { .. } => NodeTag::CopyIn,
            NodeKind::CopyOut { .. } => NodeTag::CopyOut,
            NodeKind::Allocate { .. } => NodeTag::Allocate,
            NodeKind::StreamIn { .. } => NodeTag::StreamIn,
            NodeKind::Task { .. } => NodeTag::Task,
            NodeKind::DeviceContext { .. } => NodeTag::DeviceContext,
            NodeKind::DependentRead { .. } => NodeTag::DependentRead,
        }
    }

    /// Async nodes have a device-visible side effect and appear in the
    /// compiled program.
    pub fn is_async(&self) -> bool {
        match self {
            NodeKind::CopyIn { .. }
            | NodeKind::CopyOut { .. }
            | NodeKind::Allocate { .. }
            | NodeKind::StreamIn { .. }
            | NodeKind::Task { .. } => true,
            NodeKind::Parameter { .. }
            | NodeKind::Constant { .. }
            | NodeKind::DeviceContext { .. }
            | NodeKind::DependentRead { .. } => false,
        }
    }

    pub fn context(&self) -> Option<NodeId> {
        match *self {
            NodeKind::CopyIn { context, .. }
            | NodeKind::CopyOut { context, .. }
            | NodeKind::Allocate { context, .. }
            | NodeKind::StreamIn { context, .. }
            | NodeKind::Task { context, .. }
            | NodeKind::DependentRead { context, .. } => Some(context),
            NodeKind::Parameter { .. } | NodeKind::Constant { .. } | NodeKind::DeviceContext { .. } => None,
        }
    }

    /// Object slot this node carries, if it is object-backed.
    pub fn object(&self) -> Option<usize> {
        match *self {
            NodeKind::Parameter { object }
            | NodeKind::CopyIn { object, .. }
            | NodeKind::CopyOut { object, .. }
            | NodeKind::Allocate { object, .. }
            | NodeKind::StreamIn { object, .. }
            | NodeKind::DependentRead { object, .. } => Some(object),
            NodeKind::Constant { .. } | NodeKind::Task { .. } | NodeKind::DeviceContext { .. } => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Parameter { object } => write!(f, "param(obj={object})"),
            NodeKind::Constant { slot } => write!(f, "const(slot={slot})"),
            NodeKind::CopyIn {
                context,
                object,
                exclusive,
            } => write!(
                f,
                "copy-in(obj={object}, ctx={context}{})",
                if *exclusive { ", exclusive" } else { "" }
            ),
            NodeKind::CopyOut { context, object } => write!(f, "copy-out(obj={object}, ctx={context})"),
            NodeKind::Allocate { context, object } => write!(f, "allocate(obj={object}, ctx={context})"),
            NodeKind::StreamIn { context, object } => write!(f, "stream-in(obj={object}, ctx={context})"),
            NodeKind::Task { context, task, gtid } => write!(f, "task(task={task}, gtid={gtid}, ctx={context})"),
            NodeKind::DeviceContext { device } => write!(f, "context(device={device})"),
            NodeKind::DependentRead {
                context,
                object,
                dependent,
            } => write!(f, "dependent-read(obj={object}, after={dependent}, ctx={context})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub inputs: Vec<NodeId>,
    /// Nodes registered as users of this one (device contexts track the ops
    /// issued on them). Not part of structural equality.
    pub uses: Vec<NodeId>,
}

impl Node {
    pub fn same_shape(&self, kind: &NodeKind, inputs: &[NodeId]) -> bool {
        self.kind == *kind && self.inputs == inputs
    }

    pub fn is_async(&self) -> bool {
        self.kind.is_async()
    }
}
