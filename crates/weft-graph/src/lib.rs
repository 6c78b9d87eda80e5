//! weft-graph — Typed dataflow graph model.
//!
//! An arena of operation nodes addressed by stable `OpId`s. Nodes carry
//! device metadata (`device` hint, single or split `device_id`, resolved
//! owner names) that the distribution passes in `weft-mesh` read and
//! rewrite. This crate is deliberately dependency-free; serializable wire
//! mirrors of these types live in `weft-mesh`.

pub mod computation;
pub mod graph;
pub mod node;

// Re-exports
pub use computation::{Computation, Returns};
pub use graph::OpGraph;
pub use node::{DeviceId, OpId, OpKind, OpMeta, OpNode};
