//! Ancestor/descendant relationship: one row of the closure table.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use super::NodeKey;

/// Opaque per-edge data carried by a relationship (edge weight, labels, ...).
///
/// Reflexive edges always carry `P::default()`.
pub trait EdgePayload: Clone + Default + std::fmt::Debug + Send + Sync + 'static {}

impl<T> EdgePayload for T where T: Clone + Default + std::fmt::Debug + Send + Sync + 'static {}

/// A materialized ancestor → descendant edge.
///
/// Identity is the `(ancestor_id, descendant_id)` pair: two records for the
/// same pair compare equal regardless of depth or payload. In a consistent
/// closure there is never more than one record per pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosureRelationship<K, P = ()> {
    pub ancestor_id: K,
    pub descendant_id: K,
    /// Number of parent links between the two nodes. Zero iff reflexive.
    pub depth: u32,
    pub payload: P,
}

impl<K: NodeKey, P: EdgePayload> ClosureRelationship<K, P> {
    pub fn new(ancestor_id: K, descendant_id: K, depth: u32, payload: P) -> Self {
        Self { ancestor_id, descendant_id, depth, payload }
    }

    /// The `(id, id, 0)` edge every node has to itself.
    pub fn reflexive(id: K) -> Self {
        Self {
            ancestor_id: id.clone(),
            descendant_id: id,
            depth: 0,
            payload: P::default(),
        }
    }

    pub fn is_reflexive(&self) -> bool {
        self.depth == 0
    }

    /// The `(ancestor_id, descendant_id)` pair this edge is keyed on.
    pub fn key(&self) -> (K, K) {
        (self.ancestor_id.clone(), self.descendant_id.clone())
    }

    /// True if `id` sits on either end of this edge.
    pub fn touches(&self, id: &K) -> bool {
        &self.ancestor_id == id || &self.descendant_id == id
    }

    /// Copy of this edge re-targeted at `descendant`, one link further away.
    ///
    /// This is the inheritance step of re-parenting: an edge `(a, parent, d)`
    /// becomes `(a, child, d + 1)`.
    pub fn extend_to(&self, descendant: K, payload: P) -> Self {
        Self {
            ancestor_id: self.ancestor_id.clone(),
            descendant_id: descendant,
            depth: self.depth + 1,
            payload,
        }
    }
}

impl<K: PartialEq, P> PartialEq for ClosureRelationship<K, P> {
    fn eq(&self, other: &Self) -> bool {
        self.ancestor_id == other.ancestor_id && self.descendant_id == other.descendant_id
    }
}

impl<K: Eq, P> Eq for ClosureRelationship<K, P> {}

impl<K: Hash, P> Hash for ClosureRelationship<K, P> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ancestor_id.hash(state);
        self.descendant_id.hash(state);
    }
}

impl<K: Ord, P> PartialOrd for ClosureRelationship<K, P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, P> Ord for ClosureRelationship<K, P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ancestor_id
            .cmp(&other.ancestor_id)
            .then_with(|| self.descendant_id.cmp(&other.descendant_id))
    }
}
