//! weft-mesh — Heterogeneous distributed graph execution.
//!
//! Partitions one operation graph across a fleet of device workers. The
//! assignment pass resolves every node to a concrete device, the
//! communication pass bridges cross-device edges with send/recv pairs,
//! and the orchestrator ships the whole chunked graph to every worker,
//! relays send values between them per invocation, and merges results
//! back into the caller-declared shape.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator                     Workers
//! ┌───────────┐    GraphChunks     ┌──────────┐
//! │ assign    │ ─────────────────→ │ assemble │
//! │ + bridge  │    send values     │ compile  │
//! │ + relay   │ ←────────────────→ │ execute  │
//! └───────────┘     results        └──────────┘
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use weft_graph::{Computation, DeviceId, OpGraph, Returns};
//! use weft_mesh::Orchestrator;
//!
//! let mut graph = OpGraph::new();
//! let x = graph.parameter("x", &[4]);
//! let y = graph.neg("y", x);
//! graph.on_device(y, "cpu", DeviceId::Single(1));
//!
//! let mut orch = Orchestrator::new("cpu");
//! let dist = orch
//!     .build(&mut graph, &Computation::new(vec![x], Returns::Single(y)))
//!     .await?;
//! let result = dist.call(&[vec![1.0, 2.0, 3.0, 4.0]]).await?;
//! orch.close().await;
//! ```

pub mod assign;
pub mod comm;
pub mod error;
pub mod executor;
pub mod launcher;
pub mod orchestrator;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod worker;

// Re-exports
pub use assign::DeviceAssignPass;
pub use comm::CommunicationPass;
pub use error::DistError;
pub use executor::{backend_for, LocalComputation, LocalTransformer, RefTransformer};
pub use launcher::{WorkerAddr, WorkerLauncher};
pub use orchestrator::{CallResult, DistributedComputation, Orchestrator};
pub use protocol::{
    chunk_graph, EdgeDescriptor, GraphChunk, OpDescriptor, OPS_PER_CHUNK, PROTOCOL_VERSION,
};
pub use proxy::{RemoteComputation, WorkerProxy};
pub use transport::{EndpointTransport, RpcStream, WorkerService, WorkerServiceClient, ALPN};
pub use worker::Worker;
