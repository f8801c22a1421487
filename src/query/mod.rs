//! # Query Layer
//!
//! Stateless reads over a collection of closure relationships. Every
//! function assumes the closure is consistent; none of them walk the tree.
//!
//! The same `RelationshipFilter` is what stores receive through
//! `ClosureStore::load_relationships`, so the in-memory answers here and
//! the persisted answers from `Hierarchy` are computed from one predicate.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use crate::model::{ClosureRelationship, HierarchyNode, NodeKey};

// ============================================================================
// RelationshipFilter
// ============================================================================

/// Predicate over `{ancestor_id, descendant_id, depth}`.
///
/// Unset endpoints match anything; depth bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipFilter<K> {
    pub ancestor_id: Option<K>,
    pub descendant_id: Option<K>,
    pub min_depth: u32,
    pub max_depth: Option<u32>,
}

impl<K: NodeKey> RelationshipFilter<K> {
    /// Every relationship.
    pub fn all() -> Self {
        Self { ancestor_id: None, descendant_id: None, min_depth: 0, max_depth: None }
    }

    /// Edges ending at `id`: its ancestors, optionally including itself.
    pub fn ancestors_of(id: K, with_self: bool) -> Self {
        Self {
            ancestor_id: None,
            descendant_id: Some(id),
            min_depth: u32::from(!with_self),
            max_depth: None,
        }
    }

    /// Edges starting at `id`: its subtree, optionally including itself.
    pub fn descendants_of(id: K, with_self: bool) -> Self {
        Self {
            ancestor_id: Some(id),
            descendant_id: None,
            min_depth: u32::from(!with_self),
            max_depth: None,
        }
    }

    /// Depth-1 edges from `id`, i.e. its direct children.
    pub fn children_of(id: K) -> Self {
        Self { ancestor_id: Some(id), descendant_id: None, min_depth: 1, max_depth: Some(1) }
    }

    /// The single edge between two nodes, if any.
    pub fn between(ancestor_id: K, descendant_id: K) -> Self {
        Self {
            ancestor_id: Some(ancestor_id),
            descendant_id: Some(descendant_id),
            min_depth: 0,
            max_depth: None,
        }
    }

    pub fn matches<P>(&self, rel: &ClosureRelationship<K, P>) -> bool {
        self.ancestor_id.as_ref().is_none_or(|a| *a == rel.ancestor_id)
            && self.descendant_id.as_ref().is_none_or(|d| *d == rel.descendant_id)
            && rel.depth >= self.min_depth
            && self.max_depth.is_none_or(|max| rel.depth <= max)
    }
}

// ============================================================================
// Ancestors
// ============================================================================

/// True if `id` has at least one strict ancestor.
pub fn has_ancestors<'a, K, P, I>(rels: I, id: &K) -> bool
where
    K: NodeKey,
    P: 'a,
    I: IntoIterator<Item = &'a ClosureRelationship<K, P>>,
{
    rels.into_iter().any(|r| &r.descendant_id == id && r.depth > 0)
}

/// Number of strict ancestors of `id`, which is also its depth.
pub fn ancestors_count<'a, K, P, I>(rels: I, id: &K) -> usize
where
    K: NodeKey,
    P: 'a,
    I: IntoIterator<Item = &'a ClosureRelationship<K, P>>,
{
    rels.into_iter().filter(|r| &r.descendant_id == id && r.depth > 0).count()
}

/// Ids of the ancestors of `id`.
pub fn ancestor_ids<'a, K, P, I>(rels: I, id: &K, with_self: bool) -> BTreeSet<K>
where
    K: NodeKey,
    P: 'a,
    I: IntoIterator<Item = &'a ClosureRelationship<K, P>>,
{
    let filter = RelationshipFilter::ancestors_of(id.clone(), with_self);
    rels.into_iter()
        .filter(|r| filter.matches(r))
        .map(|r| r.ancestor_id.clone())
        .collect()
}

// ============================================================================
// Descendants
// ============================================================================

/// True if `id` has at least one strict descendant.
pub fn has_descendants<'a, K, P, I>(rels: I, id: &K) -> bool
where
    K: NodeKey,
    P: 'a,
    I: IntoIterator<Item = &'a ClosureRelationship<K, P>>,
{
    rels.into_iter().any(|r| &r.ancestor_id == id && r.depth > 0)
}

/// Number of nodes strictly below `id`.
pub fn descendants_count<'a, K, P, I>(rels: I, id: &K) -> usize
where
    K: NodeKey,
    P: 'a,
    I: IntoIterator<Item = &'a ClosureRelationship<K, P>>,
{
    rels.into_iter().filter(|r| &r.ancestor_id == id && r.depth > 0).count()
}

/// Ids of the subtree rooted at `id`.
pub fn descendant_ids<'a, K, P, I>(rels: I, id: &K, with_self: bool) -> BTreeSet<K>
where
    K: NodeKey,
    P: 'a,
    I: IntoIterator<Item = &'a ClosureRelationship<K, P>>,
{
    let filter = RelationshipFilter::descendants_of(id.clone(), with_self);
    rels.into_iter()
        .filter(|r| filter.matches(r))
        .map(|r| r.descendant_id.clone())
        .collect()
}

// ============================================================================
// Roots
// ============================================================================

/// Nodes without a parent.
pub fn roots<'a, N, I>(nodes: I) -> Vec<&'a N>
where
    N: HierarchyNode + 'a,
    I: IntoIterator<Item = &'a N>,
{
    nodes.into_iter().filter(|n| n.is_root()).collect()
}
