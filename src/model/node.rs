//! Nodes of the hierarchy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use super::{ClosureRelationship, EdgePayload, Navigation};
use crate::Result;

/// Bounds every node identity must satisfy.
///
/// Keys are compared and ordered for set membership, hashed for store
/// lookups, and cloned freely. Prefer cheap keys (integers, `&'static str`).
pub trait NodeKey: Clone + Ord + Hash + Debug + Send + Sync + 'static {}

impl<T> NodeKey for T where T: Clone + Ord + Hash + Debug + Send + Sync + 'static {}

/// Keys that can be generated: `first()`, then `next()` until the key
/// space runs out.
pub trait SequentialKey: NodeKey {
    fn first() -> Self;
    /// `None` once there is no key after `self`.
    fn next(&self) -> Option<Self>;
}

/// The key generated after `last`, or the first key when nothing was
/// generated yet.
pub(crate) fn next_key<K: SequentialKey>(last: Option<&K>) -> Result<K> {
    match last {
        None => Ok(K::first()),
        Some(k) => k
            .next()
            .ok_or_else(|| crate::Error::ConstraintViolation(format!("id space exhausted after {k:?}"))),
    }
}

/// Default node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequentialKey for NodeId {
    fn first() -> Self { NodeId(1) }
    fn next(&self) -> Option<Self> { self.0.checked_add(1).map(NodeId) }
}

macro_rules! sequential_int {
    ($($t:ty),*) => {
        $(impl SequentialKey for $t {
            fn first() -> Self { 1 }
            fn next(&self) -> Option<Self> { self.checked_add(1) }
        })*
    };
}

sequential_int!(u32, u64, usize, i64);

/// Capability shared by everything that sits in a hierarchy.
pub trait HierarchyNode {
    type Key;

    fn id(&self) -> &Self::Key;
    fn parent_id(&self) -> Option<&Self::Key>;

    fn is_root(&self) -> bool {
        self.parent_id().is_none()
    }
}

/// Flat, persisted form of a node: identity, parent pointer, payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord<K, P = ()> {
    pub id: K,
    pub parent_id: Option<K>,
    /// Payload the node was attached with. See `TreeNode::payload`.
    pub payload: P,
}

impl<K: NodeKey, P: EdgePayload> NodeRecord<K, P> {
    pub fn new(id: K, parent_id: Option<K>, payload: P) -> Self {
        Self { id, parent_id, payload }
    }
}

impl<K, P> HierarchyNode for NodeRecord<K, P> {
    type Key = K;

    fn id(&self) -> &K { &self.id }
    fn parent_id(&self) -> Option<&K> { self.parent_id.as_ref() }
}

/// A node together with its children and both halves of its closure.
///
/// `ancestor_relationships` is keyed by ancestor id, `descendant_relationships`
/// by descendant id, so each map holds at most one edge per pair.
#[derive(Debug, Clone)]
pub struct TreeNode<K, P = ()> {
    pub id: K,
    pub parent_id: Option<K>,
    /// Payload for every non-reflexive edge ending at this node.
    pub payload: P,
    pub(crate) children: Navigation<BTreeSet<K>>,
    pub(crate) ancestors: Navigation<BTreeMap<K, ClosureRelationship<K, P>>>,
    pub(crate) descendants: Navigation<BTreeMap<K, ClosureRelationship<K, P>>>,
}

impl<K: NodeKey, P: EdgePayload> TreeNode<K, P> {
    /// A fresh root: no children, closure = the reflexive edge on both sides.
    pub fn root(id: K, payload: P) -> Self {
        let reflexive = ClosureRelationship::reflexive(id.clone());
        let mut ancestors = BTreeMap::new();
        ancestors.insert(id.clone(), reflexive.clone());
        let mut descendants = BTreeMap::new();
        descendants.insert(id.clone(), reflexive);

        Self {
            id,
            parent_id: None,
            payload,
            children: Navigation::Loaded(BTreeSet::new()),
            ancestors: Navigation::Loaded(ancestors),
            descendants: Navigation::Loaded(descendants),
        }
    }

    /// A node read back from storage with no navigations loaded.
    pub fn from_record(record: NodeRecord<K, P>) -> Self {
        Self {
            id: record.id,
            parent_id: record.parent_id,
            payload: record.payload,
            children: Navigation::Unloaded,
            ancestors: Navigation::Unloaded,
            descendants: Navigation::Unloaded,
        }
    }

    pub fn record(&self) -> NodeRecord<K, P> {
        NodeRecord::new(self.id.clone(), self.parent_id.clone(), self.payload.clone())
    }

    // ========================================================================
    // Navigations
    // ========================================================================

    pub fn children(&self) -> Result<&BTreeSet<K>> {
        self.children.get("children")
    }

    pub fn is_parent(&self) -> Result<bool> {
        Ok(!self.children()?.is_empty())
    }

    pub fn ancestor_relationships(&self) -> Result<impl Iterator<Item = &ClosureRelationship<K, P>>> {
        Ok(self.ancestors.get("ancestor_relationships")?.values())
    }

    pub fn descendant_relationships(&self) -> Result<impl Iterator<Item = &ClosureRelationship<K, P>>> {
        Ok(self.descendants.get("descendant_relationships")?.values())
    }

    /// Ids of every ancestor. Ordered by key, not by depth.
    pub fn ancestor_ids(&self, with_self: bool) -> Result<BTreeSet<K>> {
        let min_depth = u32::from(!with_self);
        Ok(self
            .ancestor_relationships()?
            .filter(|r| r.depth >= min_depth)
            .map(|r| r.ancestor_id.clone())
            .collect())
    }

    pub fn descendant_ids(&self, with_self: bool) -> Result<BTreeSet<K>> {
        let min_depth = u32::from(!with_self);
        Ok(self
            .descendant_relationships()?
            .filter(|r| r.depth >= min_depth)
            .map(|r| r.descendant_id.clone())
            .collect())
    }

    /// Number of parent links to the root.
    pub fn depth(&self) -> Result<u32> {
        let len = self.ancestors.get("ancestor_relationships")?.len();
        Ok(u32::try_from(len.saturating_sub(1)).unwrap_or(u32::MAX))
    }

    // ========================================================================
    // Eager loading
    // ========================================================================

    pub fn load_children(&mut self, children: impl IntoIterator<Item = K>) {
        self.children = Navigation::Loaded(children.into_iter().collect());
    }

    pub fn load_ancestor_relationships(
        &mut self,
        rels: impl IntoIterator<Item = ClosureRelationship<K, P>>,
    ) {
        self.ancestors = Navigation::Loaded(
            rels.into_iter().map(|r| (r.ancestor_id.clone(), r)).collect(),
        );
    }

    pub fn load_descendant_relationships(
        &mut self,
        rels: impl IntoIterator<Item = ClosureRelationship<K, P>>,
    ) {
        self.descendants = Navigation::Loaded(
            rels.into_iter().map(|r| (r.descendant_id.clone(), r)).collect(),
        );
    }
}

impl<K, P> HierarchyNode for TreeNode<K, P> {
    type Key = K;

    fn id(&self) -> &K { &self.id }
    fn parent_id(&self) -> Option<&K> { self.parent_id.as_ref() }
}
