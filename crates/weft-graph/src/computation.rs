//! Computation declaration: parameters plus a shaped returns specification.

use crate::node::OpId;

/// What a computation returns.
///
/// The shape of the declaration (single value, ordered sequence, or set)
/// is preserved through distribution and reproduced in the merged result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Returns {
    /// One value, returned bare.
    Single(OpId),
    /// An ordered sequence of values.
    Sequence(Vec<OpId>),
    /// An unordered set of values, returned as a table keyed by identity.
    Set(Vec<OpId>),
}

impl Returns {
    /// The requested return ids, deduplicated, in declaration order.
    pub fn ids(&self) -> Vec<OpId> {
        let ids: &[OpId] = match self {
            Returns::Single(id) => std::slice::from_ref(id),
            Returns::Sequence(ids) | Returns::Set(ids) => ids,
        };
        let mut out = Vec::new();
        for &id in ids {
            if !out.contains(&id) {
                out.push(id);
            }
        }
        out
    }
}

/// A declared computation over an operation graph.
#[derive(Clone, Debug)]
pub struct Computation {
    /// Ordered parameter nodes; invocation values arrive in this order.
    pub parameters: Vec<OpId>,
    /// The returns specification.
    pub returns: Returns,
}

impl Computation {
    pub fn new(parameters: Vec<OpId>, returns: Returns) -> Self {
        Self {
            parameters,
            returns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_ids_dedup_preserves_order() {
        let a = OpId::from_index(0);
        let b = OpId::from_index(1);
        assert_eq!(Returns::Single(a).ids(), vec![a]);
        assert_eq!(Returns::Sequence(vec![b, a, b]).ids(), vec![b, a]);
        assert_eq!(Returns::Set(vec![a, b]).ids(), vec![a, b]);
    }
}
