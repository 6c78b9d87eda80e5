//! Error types for weft-mesh.

use std::fmt;

/// Errors that can occur while distributing and running a computation.
#[derive(Debug)]
pub enum DistError {
    /// Unknown or unavailable device / backend, surfaced before launch.
    Config(String),
    /// A reachable node has no resolvable device.
    Partition(String),
    /// Worker process failed to start or never became reachable.
    Launch(String),
    /// A worker rejected its subgraph during remote creation.
    Build(String),
    /// A worker failed during feed/execute/collect.
    Invoke(String),
    /// Transport-level error (iroh/QUIC).
    Transport(String),
    /// RPC call failed.
    Rpc(String),
    /// Serialization/deserialization error.
    Serde(String),
    /// No worker registered for a device.
    WorkerNotFound(String),
    /// No workers available.
    NoWorkers,
    /// The orchestrator has already been closed.
    Closed,
}

impl fmt::Display for DistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Partition(msg) => write!(f, "partition error: {msg}"),
            Self::Launch(msg) => write!(f, "launch error: {msg}"),
            Self::Build(msg) => write!(f, "remote build failed: {msg}"),
            Self::Invoke(msg) => write!(f, "invocation failed: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc error: {msg}"),
            Self::Serde(msg) => write!(f, "serialization error: {msg}"),
            Self::WorkerNotFound(owner) => write!(f, "no worker registered for {owner}"),
            Self::NoWorkers => write!(f, "no workers available"),
            Self::Closed => write!(f, "orchestrator already closed"),
        }
    }
}

impl std::error::Error for DistError {}

impl From<postcard::Error> for DistError {
    fn from(e: postcard::Error) -> Self {
        Self::Serde(e.to_string())
    }
}

impl From<iroh::endpoint::ConnectError> for DistError {
    fn from(e: iroh::endpoint::ConnectError) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<iroh::endpoint::ConnectionError> for DistError {
    fn from(e: iroh::endpoint::ConnectionError) -> Self {
        Self::Transport(e.to_string())
    }
}
