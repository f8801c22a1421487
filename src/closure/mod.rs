//! # Closure Maintainer
//!
//! Keeps the closure consistent when a node is created or re-parented.
//!
//! Re-parenting rebuilds the moved node's ancestor chain from its new
//! parent's chain, then walks the subtree top-down with an explicit work
//! queue, rebuilding each child from its already-updated parent. Each node in
//! the subtree copies its new ancestor chain once, so the cost is
//! O(subtree size × depth).
//!
//! The chain arithmetic lives here as free functions so the in-memory
//! [`Forest`] and the store-backed `Hierarchy` share one definition of
//! "what a node's ancestors are".

pub mod forest;

pub use forest::Forest;

use crate::model::{ClosureRelationship, EdgePayload, NodeKey};

/// Full ancestor chain of `id` when attached under a parent whose chain is
/// `parent_chain`. The parent's reflexive edge is included in that chain.
///
/// The result holds `id`'s reflexive edge (default payload) plus one edge per
/// parent-chain entry, depth shifted by one. Inherited edges carry `payload`.
/// An empty `parent_chain` yields a root: just the reflexive edge.
pub fn ancestor_chain<'a, K, P, I>(id: &K, parent_chain: I, payload: &P) -> Vec<ClosureRelationship<K, P>>
where
    K: NodeKey,
    P: EdgePayload,
    I: IntoIterator<Item = &'a ClosureRelationship<K, P>>,
{
    let mut chain = vec![ClosureRelationship::reflexive(id.clone())];
    chain.extend(
        parent_chain
            .into_iter()
            .filter(|r| &r.ancestor_id != id)
            .map(|r| r.extend_to(id.clone(), payload.clone())),
    );
    chain
}

/// Counters reported by a re-parenting cascade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeStats {
    /// Nodes whose ancestor chain was rebuilt (the moved node included).
    pub nodes_rebuilt: u64,
    /// Ancestor/descendant pairs that did not exist before.
    pub edges_inserted: u64,
    /// Pairs that no longer hold after the move.
    pub edges_removed: u64,
}

impl CascadeStats {
    pub fn is_noop(&self) -> bool {
        self.edges_inserted == 0 && self.edges_removed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_of_root() {
        let no_parent: Vec<ClosureRelationship<&str>> = Vec::new();
        let chain = ancestor_chain(&"a", &no_parent, &());
        assert_eq!(chain.len(), 1);
        assert!(chain[0].is_reflexive());
    }

    #[test]
    fn test_chain_shifts_parent_edges() {
        let parent_chain = vec![
            ClosureRelationship::new("root", "p", 1, 0u8),
            ClosureRelationship::new("p", "p", 0, 0u8),
        ];
        let chain = ancestor_chain(&"c", &parent_chain, &5u8);

        let mut depths: Vec<(&str, u32, u8)> =
            chain.iter().map(|r| (r.ancestor_id, r.depth, r.payload)).collect();
        depths.sort();
        assert_eq!(depths, vec![("c", 0, 0), ("p", 1, 5), ("root", 2, 5)]);
        assert!(chain.iter().all(|r| r.descendant_id == "c"));
    }
}
