//! Wire protocol: graph topology chunked into bounded transport messages.
//!
//! `OpDescriptor`/`EdgeDescriptor` mirror `weft_graph::OpNode` with serde
//! derives, keeping weft-graph dependency-free. A finalized subgraph
//! serializes once into an ordered sequence of `GraphChunk`s that is
//! shared verbatim by every worker; edges are recorded by position in the
//! serialization order, so reassembly must reproduce that order exactly.

use serde::{Deserialize, Serialize};
use weft_graph::{DeviceId, OpGraph, OpId, OpKind, OpMeta, OpNode};

use crate::error::DistError;

/// Protocol version. Incremented on breaking wire format changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum operation descriptors per transport chunk.
pub const OPS_PER_CHUNK: usize = 10;

/// Wire mirror of `OpKind`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireKind {
    Parameter,
    Constant(u64),
    Add,
    Mul,
    Neg,
    Send,
    Recv,
    Gather,
}

impl WireKind {
    pub fn from_kind(kind: OpKind) -> Self {
        match kind {
            OpKind::Parameter => WireKind::Parameter,
            OpKind::Constant(bits) => WireKind::Constant(bits),
            OpKind::Add => WireKind::Add,
            OpKind::Mul => WireKind::Mul,
            OpKind::Neg => WireKind::Neg,
            OpKind::Send => WireKind::Send,
            OpKind::Recv => WireKind::Recv,
            OpKind::Gather => WireKind::Gather,
        }
    }

    pub fn to_kind(self) -> OpKind {
        match self {
            WireKind::Parameter => OpKind::Parameter,
            WireKind::Constant(bits) => OpKind::Constant(bits),
            WireKind::Add => OpKind::Add,
            WireKind::Mul => OpKind::Mul,
            WireKind::Neg => OpKind::Neg,
            WireKind::Send => OpKind::Send,
            WireKind::Recv => OpKind::Recv,
            WireKind::Gather => OpKind::Gather,
        }
    }
}

/// One operation on the wire: identity, kind, shape, device assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpDescriptor {
    pub name: String,
    pub kind: WireKind,
    pub shape: Vec<u32>,
    pub device: String,
    /// One entry for single ownership, several for a split output.
    pub device_id: Vec<u32>,
}

/// One argument edge, by position in the serialization order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    /// Position of the consuming op.
    pub consumer: u32,
    /// Argument slot on the consumer.
    pub arg: u32,
    /// Position of the producing op.
    pub producer: u32,
}

/// A bounded unit of serialized graph topology.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphChunk {
    /// Protocol version for forward compatibility.
    pub version: u32,
    /// At most `OPS_PER_CHUNK` operation descriptors.
    pub ops: Vec<OpDescriptor>,
    /// Edges whose consumer lives in this chunk.
    pub edges: Vec<EdgeDescriptor>,
}

impl GraphChunk {
    /// Serialize to postcard bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Deserialize from postcard bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

fn descriptor_for(node: &OpNode) -> OpDescriptor {
    let device_id = match &node.meta.device_id {
        DeviceId::Unset => Vec::new(),
        DeviceId::Single(i) => vec![*i],
        DeviceId::Split(ids) => ids.clone(),
    };
    OpDescriptor {
        name: node.name.clone(),
        kind: WireKind::from_kind(node.kind),
        shape: node.shape.clone(),
        device: node.meta.device.clone().unwrap_or_default(),
        device_id,
    }
}

/// Serialize `order` (a closure of reachable nodes) into transport chunks.
///
/// Produces exactly ⌈N / OPS_PER_CHUNK⌉ chunks; concatenating their op
/// lists reproduces `order`. Every argument of every op in `order` must
/// itself be in `order`.
pub fn chunk_graph(graph: &OpGraph, order: &[OpId]) -> Vec<GraphChunk> {
    let mut position = std::collections::HashMap::with_capacity(order.len());
    for (i, &id) in order.iter().enumerate() {
        position.insert(id, i as u32);
    }

    let mut chunks = Vec::with_capacity(order.len().div_ceil(OPS_PER_CHUNK));
    let mut ops = Vec::new();
    let mut edges = Vec::new();

    for (i, &id) in order.iter().enumerate() {
        let node = graph.node(id);
        ops.push(descriptor_for(node));
        for (a, &arg) in node.args.iter().enumerate() {
            edges.push(EdgeDescriptor {
                consumer: i as u32,
                arg: a as u32,
                producer: position[&arg],
            });
        }
        if ops.len() == OPS_PER_CHUNK || i == order.len() - 1 {
            chunks.push(GraphChunk {
                version: PROTOCOL_VERSION,
                ops: std::mem::take(&mut ops),
                edges: std::mem::take(&mut edges),
            });
        }
    }
    chunks
}

/// Reassemble a chunk sequence into an operation graph.
///
/// Two-phase: all ops are inserted first (argument lists empty), then the
/// positional edges are wired up, so an edge may reference a producer that
/// appears later in the stream.
pub fn assemble(chunks: &[GraphChunk]) -> Result<OpGraph, DistError> {
    let mut graph = OpGraph::new();
    let mut ids: Vec<OpId> = Vec::new();

    for chunk in chunks {
        if chunk.version != PROTOCOL_VERSION {
            return Err(DistError::Serde(format!(
                "protocol version mismatch: expected {PROTOCOL_VERSION}, got {}",
                chunk.version
            )));
        }
        for desc in &chunk.ops {
            let device_id = match desc.device_id.as_slice() {
                [] => DeviceId::Unset,
                [i] => DeviceId::Single(*i),
                ids => DeviceId::Split(ids.to_vec()),
            };
            let device = (!desc.device.is_empty()).then(|| desc.device.clone());
            let owners = match (&device, &device_id) {
                (Some(d), DeviceId::Single(i)) => vec![format!("{d}{i}")],
                (Some(d), DeviceId::Split(members)) => {
                    members.iter().map(|i| format!("{d}{i}")).collect()
                }
                _ => Vec::new(),
            };
            ids.push(graph.insert(OpNode {
                name: desc.name.clone(),
                kind: desc.kind.to_kind(),
                args: Vec::new(),
                shape: desc.shape.clone(),
                meta: OpMeta {
                    device,
                    device_id,
                    owners,
                    replaced_by: None,
                    replaces: None,
                },
            }));
        }
    }

    let total = ids.len() as u32;
    for chunk in chunks {
        for edge in &chunk.edges {
            if edge.consumer >= total || edge.producer >= total {
                return Err(DistError::Serde(format!(
                    "edge ({}, {}, {}) references a position past the end of the stream",
                    edge.consumer, edge.arg, edge.producer
                )));
            }
            let consumer = ids[edge.consumer as usize];
            let producer = ids[edge.producer as usize];
            let args = &mut graph.node_mut(consumer).args;
            let slot = edge.arg as usize;
            if args.len() <= slot {
                args.resize(slot + 1, producer);
            }
            args[slot] = producer;
        }
    }

    Ok(graph)
}
