//! In-memory forest.
//!
//! Nodes live in one map keyed by id and carry both halves of their closure.
//! Every mutation takes `&mut self`, which gives the single-writer guarantee
//! the cascade relies on without any locking.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;

use tracing::{debug, trace};

use crate::model::node::next_key;
use crate::model::{ClosureRelationship, EdgePayload, NodeKey, SequentialKey, TreeNode};
use crate::query;
use crate::{Error, Result};
use super::{ancestor_chain, CascadeStats};

const CHILDREN: &str = "children";
const ANCESTORS: &str = "ancestor_relationships";
const DESCENDANTS: &str = "descendant_relationships";

/// A set of trees whose closure is maintained eagerly on every mutation.
#[derive(Debug, Clone)]
pub struct Forest<K, P = ()> {
    nodes: BTreeMap<K, TreeNode<K, P>>,
    max_depth: Option<u32>,
    last_generated: Option<K>,
}

impl<K: NodeKey, P: EdgePayload> Default for Forest<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: NodeKey, P: EdgePayload> Forest<K, P> {
    pub fn new() -> Self {
        Self { nodes: BTreeMap::new(), max_depth: None, last_generated: None }
    }

    /// Forest that rejects any mutation leaving a node deeper than `max_depth`.
    pub fn with_max_depth(max_depth: u32) -> Self {
        Self { max_depth: Some(max_depth), ..Self::new() }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &K) -> Option<&TreeNode<K, P>> {
        self.nodes.get(id)
    }

    pub fn node(&self, id: &K) -> Result<&TreeNode<K, P>> {
        self.nodes.get(id).ok_or_else(|| not_found(id))
    }

    fn node_mut(&mut self, id: &K) -> Result<&mut TreeNode<K, P>> {
        self.nodes.get_mut(id).ok_or_else(|| not_found(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TreeNode<K, P>> {
        self.nodes.values()
    }

    /// Every closure edge in the forest, each exactly once.
    pub fn relationships(&self) -> impl Iterator<Item = &ClosureRelationship<K, P>> {
        self.nodes
            .values()
            .filter_map(|n| n.ancestors.as_option())
            .flat_map(|m| m.values())
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// Add `id` as a new root, or under `parent`.
    pub fn insert(&mut self, id: K, parent: Option<K>, payload: P) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(Error::DuplicateNode(format!("{id:?}")));
        }
        if parent.as_ref() == Some(&id) {
            return Err(Error::SelfParent { id: format!("{id:?}") });
        }
        if let Some(p) = &parent {
            self.node(p)?;
        }

        self.nodes.insert(id.clone(), TreeNode::root(id.clone(), payload));
        if parent.is_some() {
            if let Err(e) = self.set_parent(&id, parent) {
                self.nodes.remove(&id);
                return Err(e);
            }
        }
        trace!(id = ?id, "node inserted");
        Ok(())
    }

    /// Add a node under a freshly generated id.
    pub fn create(&mut self, parent: Option<K>, payload: P) -> Result<K>
    where
        K: SequentialKey,
    {
        let mut id = next_key(self.last_generated.as_ref())?;
        while self.nodes.contains_key(&id) {
            id = next_key(Some(&id))?;
        }
        self.insert(id.clone(), parent, payload)?;
        self.last_generated = Some(id.clone());
        Ok(id)
    }

    // ========================================================================
    // Re-parenting
    // ========================================================================

    /// Move `id` (with its whole subtree) under `parent`, or make it a root.
    pub fn set_parent(&mut self, id: &K, parent: Option<K>) -> Result<CascadeStats> {
        self.reparent(id, parent, None)
    }

    /// Like [`set_parent`](Self::set_parent), also replacing the node's payload.
    pub fn set_parent_with(&mut self, id: &K, parent: Option<K>, payload: P) -> Result<CascadeStats> {
        self.reparent(id, parent, Some(payload))
    }

    fn reparent(&mut self, id: &K, parent: Option<K>, payload: Option<P>) -> Result<CascadeStats> {
        if parent.as_ref() == Some(id) {
            return Err(Error::SelfParent { id: format!("{id:?}") });
        }

        let node = self.node(id)?;
        let new_depth = match &parent {
            Some(p) => {
                let parent_node = self.node(p)?;
                if node.descendants.get(DESCENDANTS)?.contains_key(p) {
                    return Err(Error::Cycle { id: format!("{id:?}"), parent: format!("{p:?}") });
                }
                parent_node.depth()? + 1
            }
            None => 0,
        };
        if let Some(max) = self.max_depth {
            let height = node.descendant_relationships()?.map(|r| r.depth).max().unwrap_or(0);
            if new_depth + height > max {
                return Err(Error::DepthLimit { id: format!("{id:?}"), depth: new_depth + height, max });
            }
        }

        let old_parent = node.parent_id.clone();
        debug!(id = ?id, from = ?old_parent, to = ?parent, "set_parent");

        if old_parent != parent {
            if let Some(old) = &old_parent {
                self.node_mut(old)?.children.get_mut(CHILDREN)?.remove(id);
            }
            if let Some(new) = &parent {
                self.node_mut(new)?.children.get_mut(CHILDREN)?.insert(id.clone());
            }
        }

        let node = self.node_mut(id)?;
        node.parent_id = parent;
        if let Some(payload) = payload {
            node.payload = payload;
        }

        let stats = self.cascade(id)?;
        debug!(
            id = ?id,
            nodes = stats.nodes_rebuilt,
            inserted = stats.edges_inserted,
            removed = stats.edges_removed,
            "cascade complete"
        );
        Ok(stats)
    }

    /// Rebuild the ancestor chain of `start` and of everything below it,
    /// one level at a time, keeping the ancestors' descendant sets in step.
    fn cascade(&mut self, start: &K) -> Result<CascadeStats> {
        let mut stats = CascadeStats::default();
        let mut queue = VecDeque::from([start.clone()]);

        while let Some(current) = queue.pop_front() {
            let node = self.node(&current)?;
            let chain = match &node.parent_id {
                Some(p) => ancestor_chain(&current, self.node(p)?.ancestor_relationships()?, &node.payload),
                None => ancestor_chain(
                    &current,
                    std::iter::empty::<&ClosureRelationship<K, P>>(),
                    &node.payload,
                ),
            };
            queue.extend(node.children()?.iter().cloned());

            let new: BTreeMap<K, ClosureRelationship<K, P>> =
                chain.into_iter().map(|r| (r.ancestor_id.clone(), r)).collect();
            let old = std::mem::replace(
                self.node_mut(&current)?.ancestors.get_mut(ANCESTORS)?,
                new.clone(),
            );

            for stale in old.keys().filter(|a| !new.contains_key(*a)) {
                self.node_mut(stale)?.descendants.get_mut(DESCENDANTS)?.remove(&current);
                stats.edges_removed += 1;
            }
            for (ancestor, rel) in new {
                if !old.contains_key(&ancestor) {
                    stats.edges_inserted += 1;
                }
                self.node_mut(&ancestor)?
                    .descendants
                    .get_mut(DESCENDANTS)?
                    .insert(current.clone(), rel);
            }
            stats.nodes_rebuilt += 1;
        }

        Ok(stats)
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Remove a leaf and every edge that touches it.
    pub fn remove(&mut self, id: &K) -> Result<TreeNode<K, P>> {
        let node = self.node(id)?;
        if node.is_parent()? {
            return Err(Error::ConstraintViolation(format!(
                "Cannot remove node {id:?} with {} children. Remove the subtree instead.",
                node.children()?.len()
            )));
        }
        let mut removed = self.remove_subtree(id)?;
        removed.pop().ok_or_else(|| not_found(id))
    }

    /// Remove `id`, everything below it, and every edge touching any of them.
    pub fn remove_subtree(&mut self, id: &K) -> Result<Vec<TreeNode<K, P>>> {
        let node = self.node(id)?;
        let subtree = node.descendant_ids(true)?;
        let outer = node.ancestor_ids(false)?;
        let parent = node.parent_id.clone();

        if let Some(p) = &parent {
            self.node_mut(p)?.children.get_mut(CHILDREN)?.remove(id);
        }
        for ancestor in &outer {
            self.node_mut(ancestor)?
                .descendants
                .get_mut(DESCENDANTS)?
                .retain(|d, _| !subtree.contains(d));
        }

        let removed: Vec<TreeNode<K, P>> =
            subtree.iter().filter_map(|d| self.nodes.remove(d)).collect();
        debug!(id = ?id, removed = removed.len(), "subtree removed");
        Ok(removed)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn has_ancestors(&self, id: &K) -> Result<bool> {
        Ok(query::has_ancestors(self.node(id)?.ancestor_relationships()?, id))
    }

    pub fn ancestors_count(&self, id: &K) -> Result<usize> {
        Ok(query::ancestors_count(self.node(id)?.ancestor_relationships()?, id))
    }

    pub fn ancestors_of(&self, id: &K, with_self: bool) -> Result<Vec<&TreeNode<K, P>>> {
        let ids = query::ancestor_ids(self.node(id)?.ancestor_relationships()?, id, with_self);
        ids.iter().map(|a| self.node(a)).collect()
    }

    pub fn depth_of(&self, id: &K) -> Result<u32> {
        self.node(id)?.depth()
    }

    pub fn has_descendants(&self, id: &K) -> Result<bool> {
        Ok(query::has_descendants(self.node(id)?.descendant_relationships()?, id))
    }

    pub fn descendants_count(&self, id: &K) -> Result<usize> {
        Ok(query::descendants_count(self.node(id)?.descendant_relationships()?, id))
    }

    pub fn descendants_of(&self, id: &K, with_self: bool) -> Result<Vec<&TreeNode<K, P>>> {
        let ids = query::descendant_ids(self.node(id)?.descendant_relationships()?, id, with_self);
        ids.iter().map(|d| self.node(d)).collect()
    }

    pub fn children_of(&self, id: &K) -> Result<Vec<&TreeNode<K, P>>> {
        self.node(id)?.children()?.iter().map(|c| self.node(c)).collect()
    }

    pub fn parent_of(&self, id: &K) -> Result<Option<&TreeNode<K, P>>> {
        match &self.node(id)?.parent_id {
            Some(p) => self.node(p).map(Some),
            None => Ok(None),
        }
    }

    pub fn roots(&self) -> Vec<&TreeNode<K, P>> {
        query::roots(self.nodes.values())
    }

    // ========================================================================
    // Consistency check
    // ========================================================================

    /// Verify every closure invariant, returning the first violation found.
    pub fn check_invariants(&self) -> Result<()> {
        for node in self.nodes.values() {
            let id = &node.id;
            let ancestors = node.ancestors.get(ANCESTORS)?;
            let descendants = node.descendants.get(DESCENDANTS)?;

            match (ancestors.get(id), descendants.get(id)) {
                (Some(a), Some(d)) if a.depth == 0 && d.depth == 0 => {}
                _ => return Err(corrupt(format!("node {id:?} lacks its reflexive edge"))),
            }

            for rel in ancestors.values() {
                if &rel.descendant_id != id || (rel.depth == 0) != (&rel.ancestor_id == id) {
                    return Err(corrupt(format!("malformed ancestor edge {rel:?} on {id:?}")));
                }
                let mirrored = self
                    .nodes
                    .get(&rel.ancestor_id)
                    .and_then(|a| a.descendants.as_option())
                    .and_then(|m| m.get(id));
                if mirrored.map(|m| m.depth) != Some(rel.depth) {
                    return Err(corrupt(format!("edge {rel:?} missing on the descendant side")));
                }
            }

            for rel in descendants.values() {
                if &rel.ancestor_id != id || (rel.depth == 0) != (&rel.descendant_id == id) {
                    return Err(corrupt(format!("malformed descendant edge {rel:?} on {id:?}")));
                }
                let mirrored = self
                    .nodes
                    .get(&rel.descendant_id)
                    .and_then(|d| d.ancestors.as_option())
                    .and_then(|m| m.get(id));
                if mirrored.map(|m| m.depth) != Some(rel.depth) {
                    return Err(corrupt(format!("edge {rel:?} missing on the ancestor side")));
                }
            }

            match &node.parent_id {
                None if ancestors.len() != 1 => {
                    return Err(corrupt(format!("root {id:?} has inherited ancestors")));
                }
                None => {}
                Some(p) => {
                    let parent = self
                        .nodes
                        .get(p)
                        .ok_or_else(|| corrupt(format!("{id:?} points at missing parent {p:?}")))?;
                    if !parent.children()?.contains(id) {
                        return Err(corrupt(format!("{p:?} does not list child {id:?}")));
                    }
                    let parent_chain = parent.ancestors.get(ANCESTORS)?;
                    if ancestors.len() != parent_chain.len() + 1 {
                        return Err(corrupt(format!(
                            "{id:?} has {} ancestors, parent {p:?} has {}",
                            ancestors.len(),
                            parent_chain.len()
                        )));
                    }
                    for rel in parent_chain.values() {
                        if ancestors.get(&rel.ancestor_id).map(|r| r.depth) != Some(rel.depth + 1) {
                            return Err(corrupt(format!(
                                "{id:?} did not inherit {:?} from {p:?}",
                                rel.ancestor_id
                            )));
                        }
                    }
                }
            }

            for child in node.children()? {
                if self.nodes.get(child).and_then(|c| c.parent_id.as_ref()) != Some(id) {
                    return Err(corrupt(format!("{id:?} lists {child:?}, which has another parent")));
                }
            }
        }
        Ok(())
    }
}

fn not_found<K: Debug>(id: &K) -> Error {
    Error::NotFound(format!("Node {id:?}"))
}

fn corrupt(message: String) -> Error {
    Error::CorruptClosure(message)
}

// ============================================================================
// Tests
// ============================================================================
