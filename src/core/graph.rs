//! Arena-backed task graph.
//!
//! Nodes live in a single growable table owned by the [`Graph`] and refer to
//! each other by [`NodeId`] only. Ids are handed out in insertion order and
//! are never reused, so a deleted node leaves a tombstone behind and every
//! later insertion still gets a strictly larger id.

use std::fmt;
use std::ops::Index;

use fixedbitset::FixedBitSet;

use crate::core::node::{Node, NodeId, NodeKind, NodeTag};

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    live: FixedBitSet,
    chain: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            live: FixedBitSet::with_capacity(capacity),
            chain: Vec::new(),
        }
    }

    pub fn add(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        let index = self.nodes.len();
        let id = NodeId(u32::try_from(index).unwrap_or_else(|_| panic!("graph exceeds {} nodes", u32::MAX)));
        self.nodes.push(Some(Node {
            id,
            kind,
            inputs,
            uses: Vec::new(),
        }));
        if self.live.len() <= index {
            self.live.grow((index + 1).max(self.live.len() * 2));
        }
        self.live.insert(index);
        id
    }

    /// Returns an existing live node with the same kind and inputs, or inserts
    /// a new one.
    pub fn add_unique(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        let existing = self
            .live
            .ones()
            .filter_map(|i| self.nodes[i].as_ref())
            .find(|n| n.same_shape(&kind, &inputs))
            .map(|n| n.id);
        match existing {
            Some(id) => id,
            None => self.add(kind, inputs),
        }
    }

    pub fn delete(&mut self, id: NodeId) {
        let index = id.index();
        assert!(self.is_live(id), "delete of dead or unknown node {id}");
        self.live.set(index, false);
        self.nodes[index] = None;
        self.chain.retain(|n| *n != id);
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        id.index() < self.nodes.len() && self.live.contains(id.index())
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn add_use(&mut self, node: NodeId, user: NodeId) {
        match self.nodes.get_mut(node.index()).and_then(Option::as_mut) {
            Some(n) => n.uses.push(user),
            None => panic!("add_use on dead or unknown node {node}"),
        }
    }

    /// Appends a node to the fixed control-flow chain.
    pub fn push_chain(&mut self, id: NodeId) {
        self.chain.push(id);
    }

    pub fn chain(&self) -> &[NodeId] {
        &self.chain
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.live.count_ones(..)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest id ever handed out plus one.
    pub fn id_bound(&self) -> usize {
        self.nodes.len()
    }

    pub fn filter<P>(&self, mut predicate: P) -> FixedBitSet
    where
        P: FnMut(&Node) -> bool,
    {
        let mut set = FixedBitSet::with_capacity(self.nodes.len());
        for i in self.live.ones() {
            if let Some(node) = &self.nodes[i] {
                if predicate(node) {
                    set.insert(i);
                }
            }
        }
        set
    }

    pub fn filter_kind(&self, tag: NodeTag) -> FixedBitSet {
        self.filter(|n| n.kind.tag() == tag)
    }

    pub fn async_nodes(&self) -> FixedBitSet {
        self.filter(Node::is_async)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> + '_ {
        self.live.ones().filter_map(move |i| self.nodes[i].as_ref())
    }

    pub fn apply<F>(&self, consumer: F)
    where
        F: FnMut(&Node),
    {
        self.iter().for_each(consumer);
    }

    /// Visits the live members of `set` in ascending id order.
    pub fn papply<F>(&self, set: &FixedBitSet, mut consumer: F)
    where
        F: FnMut(&Node),
    {
        for i in set.ones() {
            if let Some(Some(node)) = self.nodes.get(i) {
                consumer(node);
            }
        }
    }
}

impl Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => panic!("node {id} is deleted or out of range"),
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph: {} live nodes", self.len())?;
        for node in self.iter() {
            write!(f, "  {:>4} {}", node.id, node.kind)?;
            if !node.inputs.is_empty() {
                let inputs: Vec<String> = node.inputs.iter().map(NodeId::to_string).collect();
                write!(f, " <- [{}]", inputs.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
