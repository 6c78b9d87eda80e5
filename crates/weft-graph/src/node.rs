//! Operation node types and the OpId handle.

use std::fmt;

/// Handle into the operation graph. Lightweight (4 bytes), Copy.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub(crate) u32);

impl OpId {
    /// Create an OpId from a raw index.
    #[inline]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// The raw index of this operation in the graph.
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.0.cmp(&other.0))
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

/// What an operation node computes.
///
/// `Parameter`/`Constant` are the leaf kinds. `Add`/`Mul`/`Neg` stand in for
/// the numeric surface (the real kernel set lives in the execution engine,
/// which consumes assigned subgraphs opaquely). `Send`/`Recv`/`Gather` are
/// synthetic kinds inserted by the distribution passes and never written by
/// user code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Declared input, bound to a value at invocation time.
    Parameter,
    /// Literal f64 value stored as bits for Hash/Eq.
    Constant(u64),
    /// Elementwise addition.
    Add,
    /// Elementwise multiplication.
    Mul,
    /// Elementwise negation.
    Neg,
    /// Synthetic: ships its argument's value off-device.
    Send,
    /// Synthetic: materializes the value of a remote `Send`.
    Recv,
    /// Synthetic: merges a device-split output into one value.
    Gather,
}

impl OpKind {
    /// Create a `Constant` from an f64 value.
    #[inline]
    pub fn constant(v: f64) -> Self {
        Self::Constant(v.to_bits())
    }

    /// Extract the f64 value from a `Constant`, or `None`.
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Constant(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    /// Whether this kind is inserted by the distribution passes.
    #[inline]
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Send | Self::Recv | Self::Gather)
    }
}

/// Declared device ownership of a node's output.
///
/// `Split` means the output is logically split across several device
/// indices; the communication pass interprets it as split ownership, not
/// single ownership, so it is never normalized to one index.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum DeviceId {
    /// No declaration; the assignment pass fills in the default.
    #[default]
    Unset,
    /// The node lives on exactly one device index.
    Single(u32),
    /// The node's output is split across these device indices.
    Split(Vec<u32>),
}

/// Per-node distribution metadata.
#[derive(Clone, Debug, Default)]
pub struct OpMeta {
    /// Device name hint (e.g. "cpu"). `None` inherits the pass default.
    pub device: Option<String>,
    /// Device index declaration.
    pub device_id: DeviceId,
    /// Resolved owner names ("cpu0", "cpu1", ...), filled by the assignment
    /// pass. More than one entry for split outputs and broadcast parameters.
    pub owners: Vec<String>,
    /// Forward reference from a wrapped node to its gather wrapper.
    pub replaced_by: Option<OpId>,
    /// Back reference from a gather wrapper to the node it wraps.
    pub replaces: Option<OpId>,
}

/// A node in the operation graph.
///
/// Arguments are arena ids, never owning pointers — a node may be read by
/// many downstream consumers.
#[derive(Clone, Debug)]
pub struct OpNode {
    /// Stable unique name; the identity used on the wire.
    pub name: String,
    pub kind: OpKind,
    /// Ordered argument list.
    pub args: Vec<OpId>,
    /// Output shape.
    pub shape: Vec<u32>,
    pub meta: OpMeta,
}
