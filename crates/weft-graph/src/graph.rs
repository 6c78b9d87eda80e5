//! Arena-based operation graph.

use std::collections::{HashMap, HashSet};

use crate::node::{DeviceId, OpId, OpKind, OpMeta, OpNode};

/// Arena of operation nodes addressed by stable `OpId`s.
///
/// Names are unique within a graph and double as the wire identity of a
/// node. Back/forward references between nodes (e.g. a gather wrapper and
/// the node it wraps) are plain id lookups in the arena, never owning
/// pointers, so shared and cyclic references cost nothing in ownership
/// terms.
#[derive(Clone)]
pub struct OpGraph {
    nodes: Vec<OpNode>,
    by_name: HashMap<String, OpId>,
}

impl OpGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Total number of nodes in the graph.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up the node for an OpId.
    #[inline]
    pub fn node(&self, id: OpId) -> &OpNode {
        &self.nodes[id.0 as usize]
    }

    /// Mutable access to a node.
    #[inline]
    pub fn node_mut(&mut self, id: OpId) -> &mut OpNode {
        &mut self.nodes[id.0 as usize]
    }

    /// Look up a node id by its stable name.
    pub fn by_name(&self, name: &str) -> Option<OpId> {
        self.by_name.get(name).copied()
    }

    /// Insert a node. Panics on a duplicate name — names are identities.
    pub fn insert(&mut self, node: OpNode) -> OpId {
        assert!(
            !self.by_name.contains_key(&node.name),
            "duplicate op name: {}",
            node.name
        );
        let id = OpId(self.nodes.len() as u32);
        self.by_name.insert(node.name.clone(), id);
        self.nodes.push(node);
        id
    }

    /// Declare a parameter node.
    pub fn parameter(&mut self, name: &str, shape: &[u32]) -> OpId {
        self.insert(OpNode {
            name: name.to_string(),
            kind: OpKind::Parameter,
            args: Vec::new(),
            shape: shape.to_vec(),
            meta: OpMeta::default(),
        })
    }

    /// Create a constant node.
    pub fn constant(&mut self, name: &str, v: f64, shape: &[u32]) -> OpId {
        self.insert(OpNode {
            name: name.to_string(),
            kind: OpKind::constant(v),
            args: Vec::new(),
            shape: shape.to_vec(),
            meta: OpMeta::default(),
        })
    }

    /// Elementwise addition. Shape follows the first argument.
    pub fn add(&mut self, name: &str, a: OpId, b: OpId) -> OpId {
        let shape = self.node(a).shape.clone();
        self.insert(OpNode {
            name: name.to_string(),
            kind: OpKind::Add,
            args: vec![a, b],
            shape,
            meta: OpMeta::default(),
        })
    }

    /// Elementwise multiplication. Shape follows the first argument.
    pub fn mul(&mut self, name: &str, a: OpId, b: OpId) -> OpId {
        let shape = self.node(a).shape.clone();
        self.insert(OpNode {
            name: name.to_string(),
            kind: OpKind::Mul,
            args: vec![a, b],
            shape,
            meta: OpMeta::default(),
        })
    }

    /// Elementwise negation.
    pub fn neg(&mut self, name: &str, a: OpId) -> OpId {
        let shape = self.node(a).shape.clone();
        self.insert(OpNode {
            name: name.to_string(),
            kind: OpKind::Neg,
            args: vec![a],
            shape,
            meta: OpMeta::default(),
        })
    }

    /// Set the device hint on a node (builder-style convenience).
    pub fn on_device(&mut self, id: OpId, device: &str, device_id: DeviceId) -> OpId {
        let meta = &mut self.node_mut(id).meta;
        meta.device = Some(device.to_string());
        meta.device_id = device_id;
        id
    }

    /// Insert a synthetic send node shipping `src` off-device.
    ///
    /// Bound to the producer's device by the communication pass; the
    /// generated name is derived from the arena position so it is unique
    /// and stable for the life of the graph.
    pub fn send(&mut self, src: OpId) -> OpId {
        let shape = self.node(src).shape.clone();
        let name = format!("send.{}", self.nodes.len());
        self.insert(OpNode {
            name,
            kind: OpKind::Send,
            args: vec![src],
            shape,
            meta: OpMeta::default(),
        })
    }

    /// Insert a synthetic receive node referencing a send.
    pub fn recv(&mut self, send: OpId) -> OpId {
        let shape = self.node(send).shape.clone();
        let name = format!("recv.{}", self.nodes.len());
        self.insert(OpNode {
            name,
            kind: OpKind::Recv,
            args: vec![send],
            shape,
            meta: OpMeta::default(),
        })
    }

    /// Insert a gather wrapper merging a split output.
    ///
    /// Records the wrapper ↔ wrapped back/forward references so result
    /// matching can map the wrapper back to the caller-visible node.
    pub fn gather(&mut self, wrapped: OpId) -> OpId {
        let shape = self.node(wrapped).shape.clone();
        let name = format!("gather.{}", self.nodes.len());
        let id = self.insert(OpNode {
            name,
            kind: OpKind::Gather,
            args: vec![wrapped],
            shape,
            meta: OpMeta::default(),
        });
        self.node_mut(id).meta.replaces = Some(wrapped);
        self.node_mut(wrapped).meta.replaced_by = Some(id);
        id
    }

    /// Replace occurrences of `from` in `consumer`'s argument list.
    pub fn replace_arg(&mut self, consumer: OpId, from: OpId, to: OpId) {
        for arg in &mut self.nodes[consumer.0 as usize].args {
            if *arg == from {
                *arg = to;
            }
        }
    }

    /// The closure of nodes reachable from `roots`, in deterministic
    /// reference-discovery order (pre-order from each root, deduplicated).
    ///
    /// This order is the serialization order: consumers are discovered
    /// before the producers they reference, and edges are recorded by
    /// position in this sequence.
    pub fn all_op_references(&self, roots: &[OpId]) -> Vec<OpId> {
        let mut seen: HashSet<OpId> = HashSet::new();
        let mut order = Vec::new();
        let mut stack: Vec<OpId> = Vec::new();
        for &root in roots {
            if seen.insert(root) {
                order.push(root);
                stack.push(root);
            }
            while let Some(id) = stack.pop() {
                // Pre-order: the node itself is already recorded; push args
                // in declaration order.
                let args = self.node(id).args.clone();
                for arg in args {
                    if seen.insert(arg) {
                        order.push(arg);
                        stack.push(arg);
                    }
                }
            }
        }
        order
    }
}

impl Default for OpGraph {
    fn default() -> Self {
        Self::new()
    }
}
