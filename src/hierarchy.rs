//! Store-backed hierarchy handle.
//!
//! `Hierarchy` runs the closure maintainer against a `ClosureStore`. Every
//! structural mutation holds the hierarchy-wide mutation lock and runs in one
//! read-write transaction; reads run in their own read-only transaction and
//! never take the lock.

use std::collections::VecDeque;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::closure::{ancestor_chain, CascadeStats};
use crate::config::HierarchyConfig;
use crate::model::node::next_key;
use crate::model::*;
use crate::query::RelationshipFilter;
use crate::storage::{BackendConfig, ClosureStore, MemoryStore};
use crate::tx::TxMode;
use crate::{Error, Result};

type Record<S> = NodeRecord<<S as ClosureStore>::Key, <S as ClosureStore>::Payload>;
type Rel<S> = ClosureRelationship<<S as ClosureStore>::Key, <S as ClosureStore>::Payload>;

/// Which navigations `Hierarchy::load_node` should populate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Include {
    pub children: bool,
    pub ancestors: bool,
    pub descendants: bool,
}

impl Include {
    pub const NONE: Include = Include { children: false, ancestors: false, descendants: false };
    pub const ALL: Include = Include { children: true, ancestors: true, descendants: true };
}

// ============================================================================
// Hierarchy
// ============================================================================

/// The primary entry point: a closure-table hierarchy over a store.
pub struct Hierarchy<S: ClosureStore> {
    store: S,
    config: HierarchyConfig,
    mutation_lock: Mutex<()>,
    last_generated: parking_lot::Mutex<Option<S::Key>>,
}

impl<K: NodeKey, P: EdgePayload> Hierarchy<MemoryStore<K, P>> {
    /// In-memory hierarchy for testing and embedding.
    pub async fn open_memory() -> Result<Self> {
        Self::open(HierarchyConfig::default()).await
    }

    pub async fn open(config: HierarchyConfig) -> Result<Self> {
        let store = match config.backend {
            BackendConfig::Memory => MemoryStore::new(),
        };
        Ok(Self::with_config(store, config))
    }
}

impl<S: ClosureStore> Hierarchy<S> {
    pub fn with_store(store: S) -> Self {
        Self::with_config(store, HierarchyConfig::default())
    }

    pub fn with_config(store: S, config: HierarchyConfig) -> Self {
        Self {
            store,
            config,
            mutation_lock: Mutex::new(()),
            last_generated: parking_lot::Mutex::new(None),
        }
    }

    /// Access the underlying store (for advanced use).
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &HierarchyConfig {
        &self.config
    }

    /// Wait for in-flight mutations, then shut the store down.
    pub async fn shutdown(&self) -> Result<()> {
        let _lock = self.mutation_lock.lock().await;
        self.store.shutdown().await
    }

    /// Begin an explicit read-write transaction. Holds the mutation lock
    /// until committed, rolled back, or dropped.
    pub async fn begin(&self) -> Result<ExplicitTx<'_, S>> {
        let lock = self.mutation_lock.lock().await;
        let tx = self.store.begin_tx(TxMode::ReadWrite).await?;
        Ok(ExplicitTx { hierarchy: self, tx, poisoned: None, _lock: lock })
    }

    // ========================================================================
    // Mutations (one transaction each)
    // ========================================================================

    /// Add `id` as a root, or under `parent`.
    pub async fn insert(&self, id: S::Key, parent: Option<S::Key>, payload: S::Payload) -> Result<()> {
        let mut tx = self.begin().await?;
        let result = tx.insert(id, parent, payload).await;
        tx.finish(result).await
    }

    /// Add a node under a freshly generated id.
    pub async fn create(&self, parent: Option<S::Key>, payload: S::Payload) -> Result<S::Key>
    where
        S::Key: SequentialKey,
    {
        let mut tx = self.begin().await?;
        let result = tx.create(parent, payload).await;
        tx.finish(result).await
    }

    /// Move `id` and its subtree under `parent`, or make it a root.
    pub async fn set_parent(&self, id: &S::Key, parent: Option<S::Key>) -> Result<CascadeStats> {
        let mut tx = self.begin().await?;
        let result = tx.set_parent(id, parent).await;
        tx.finish(result).await
    }

    /// Like [`set_parent`](Self::set_parent), also replacing the node's payload.
    pub async fn set_parent_with(
        &self,
        id: &S::Key,
        parent: Option<S::Key>,
        payload: S::Payload,
    ) -> Result<CascadeStats> {
        let mut tx = self.begin().await?;
        let result = tx.set_parent_with(id, parent, payload).await;
        tx.finish(result).await
    }

    /// Delete a leaf and all of its relationships.
    pub async fn delete_node(&self, id: &S::Key) -> Result<()> {
        let mut tx = self.begin().await?;
        let result = tx.delete_node(id).await;
        tx.finish(result).await
    }

    /// Delete `id`, its whole subtree, and every relationship touching them.
    /// Returns the number of nodes removed.
    pub async fn delete_subtree(&self, id: &S::Key) -> Result<u64> {
        let mut tx = self.begin().await?;
        let result = tx.delete_subtree(id).await;
        tx.finish(result).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_node(&self, id: &S::Key) -> Result<Option<Record<S>>> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        let node = self.store.load_node(&tx, id).await?;
        self.store.commit_tx(tx).await?;
        Ok(node)
    }

    /// Load a node with the requested navigations populated. Navigations not
    /// requested stay unloaded and fail with `NavigationNotLoaded` on access.
    pub async fn load_node(&self, id: &S::Key, include: Include) -> Result<TreeNode<S::Key, S::Payload>> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        let record = self
            .store
            .load_node(&tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Node {id:?}")))?;
        let mut node = TreeNode::from_record(record);

        if include.children {
            let children = self.store.load_relationships(&tx, &RelationshipFilter::children_of(id.clone())).await?;
            node.load_children(children.into_iter().map(|r| r.descendant_id));
        }
        if include.ancestors {
            let rels = self.store.load_relationships(&tx, &RelationshipFilter::ancestors_of(id.clone(), true)).await?;
            node.load_ancestor_relationships(rels);
        }
        if include.descendants {
            let rels = self.store.load_relationships(&tx, &RelationshipFilter::descendants_of(id.clone(), true)).await?;
            node.load_descendant_relationships(rels);
        }
        self.store.commit_tx(tx).await?;
        Ok(node)
    }

    async fn any(&self, filter: RelationshipFilter<S::Key>) -> Result<bool> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        let found = self.store.any_relationship(&tx, &filter).await?;
        self.store.commit_tx(tx).await?;
        Ok(found)
    }

    async fn count(&self, filter: RelationshipFilter<S::Key>) -> Result<u64> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        let n = self.store.count_relationships(&tx, &filter).await?;
        self.store.commit_tx(tx).await?;
        Ok(n)
    }

    /// Resolve the far end of every matching relationship to its node.
    async fn resolve(
        &self,
        filter: RelationshipFilter<S::Key>,
        far_end: fn(Rel<S>) -> S::Key,
    ) -> Result<Vec<Record<S>>> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        let rels = self.store.load_relationships(&tx, &filter).await?;
        let mut nodes = Vec::with_capacity(rels.len());
        for rel in rels {
            let id = far_end(rel);
            let node = self
                .store
                .load_node(&tx, &id)
                .await?
                .ok_or_else(|| Error::CorruptClosure(format!("relationship points at missing node {id:?}")))?;
            nodes.push(node);
        }
        self.store.commit_tx(tx).await?;
        Ok(nodes)
    }

    pub async fn has_ancestors(&self, id: &S::Key) -> Result<bool> {
        self.any(RelationshipFilter::ancestors_of(id.clone(), false)).await
    }

    pub async fn ancestors_count(&self, id: &S::Key) -> Result<u64> {
        self.count(RelationshipFilter::ancestors_of(id.clone(), false)).await
    }

    /// Number of parent links between `id` and its root.
    pub async fn depth_of(&self, id: &S::Key) -> Result<u32> {
        if self.get_node(id).await?.is_none() {
            return Err(Error::NotFound(format!("Node {id:?}")));
        }
        let depth = self.ancestors_count(id).await?;
        u32::try_from(depth).map_err(|_| Error::CorruptClosure(format!("node {id:?} has {depth} ancestors")))
    }

    /// Ancestor nodes of `id`, unordered.
    pub async fn ancestors_of(&self, id: &S::Key, with_self: bool) -> Result<Vec<Record<S>>> {
        self.resolve(RelationshipFilter::ancestors_of(id.clone(), with_self), |r| r.ancestor_id).await
    }

    pub async fn has_descendants(&self, id: &S::Key) -> Result<bool> {
        self.any(RelationshipFilter::descendants_of(id.clone(), false)).await
    }

    pub async fn descendants_count(&self, id: &S::Key) -> Result<u64> {
        self.count(RelationshipFilter::descendants_of(id.clone(), false)).await
    }

    /// Descendant nodes of `id`, unordered.
    pub async fn descendants_of(&self, id: &S::Key, with_self: bool) -> Result<Vec<Record<S>>> {
        self.resolve(RelationshipFilter::descendants_of(id.clone(), with_self), |r| r.descendant_id).await
    }

    pub async fn children_of(&self, id: &S::Key) -> Result<Vec<Record<S>>> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        let children = self.store.children_of(&tx, id).await?;
        self.store.commit_tx(tx).await?;
        Ok(children)
    }

    pub async fn parent_of(&self, id: &S::Key) -> Result<Option<Record<S>>> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        let record = self
            .store
            .load_node(&tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Node {id:?}")))?;
        let parent = match &record.parent_id {
            Some(p) => self.store.load_node(&tx, p).await?,
            None => None,
        };
        self.store.commit_tx(tx).await?;
        Ok(parent)
    }

    pub async fn roots(&self) -> Result<Vec<Record<S>>> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        let roots = self.store.roots(&tx).await?;
        self.store.commit_tx(tx).await?;
        Ok(roots)
    }

    pub async fn node_count(&self) -> Result<u64> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        let n = self.store.node_count(&tx).await?;
        self.store.commit_tx(tx).await?;
        Ok(n)
    }

    pub async fn relationship_count(&self) -> Result<u64> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        let n = self.store.relationship_count(&tx).await?;
        self.store.commit_tx(tx).await?;
        Ok(n)
    }

    /// Check every node's ancestor chain against its parent's.
    pub async fn check_invariants(&self) -> Result<()> {
        let tx = self.store.begin_tx(TxMode::ReadOnly).await?;
        for node in self.store.all_nodes(&tx).await? {
            verify_chain(&self.store, &tx, &node).await?;
        }
        self.store.commit_tx(tx).await
    }
}

// ============================================================================
// ExplicitTx
// ============================================================================

/// Explicit read-write transaction. Several mutations commit or fail together.
/// Dropping it without `commit` discards every staged write.
///
/// A mutation that fails its checks stages nothing, so the transaction stays
/// usable. A mutation that fails after it started writing poisons the
/// transaction: `commit` then rolls back and returns `Error::TxError`.
pub struct ExplicitTx<'h, S: ClosureStore> {
    hierarchy: &'h Hierarchy<S>,
    tx: S::Tx,
    poisoned: Option<String>,
    _lock: MutexGuard<'h, ()>,
}

impl<'h, S: ClosureStore> ExplicitTx<'h, S> {
    fn store(&self) -> &'h S {
        &self.hierarchy.store
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub async fn commit(self) -> Result<()> {
        match self.poisoned {
            Some(reason) => {
                self.hierarchy.store.rollback_tx(self.tx).await?;
                Err(Error::TxError(format!(
                    "transaction rolled back, a mutation failed midway: {reason}"
                )))
            }
            None => self.hierarchy.store.commit_tx(self.tx).await,
        }
    }

    pub async fn rollback(self) -> Result<()> {
        self.hierarchy.store.rollback_tx(self.tx).await
    }

    /// Commit on success, roll back on failure.
    async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                warn!(error = %e, "mutation failed, rolling back");
                self.rollback().await?;
                Err(e)
            }
        }
    }

    /// Record a failure from the writing half of a mutation.
    fn poison_on_err<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(error = %e, "mutation failed after staging writes");
            self.poisoned.get_or_insert_with(|| e.to_string());
        }
        result
    }

    async fn require(&self, id: &S::Key) -> Result<Record<S>> {
        self.store()
            .load_node(&self.tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Node {id:?}")))
    }

    /// Full ancestor chain of `parent`, reflexive edge included.
    async fn parent_chain(&self, parent: &S::Key) -> Result<Vec<Rel<S>>> {
        self.require(parent).await?;
        self.store()
            .load_relationships(&self.tx, &RelationshipFilter::ancestors_of(parent.clone(), true))
            .await
    }

    /// Placing a subtree of `height` under `parent_chain` must stay within `max_depth`.
    fn check_depth(&self, id: &S::Key, parent_chain: &[Rel<S>], height: u32) -> Result<()> {
        if let Some(max) = self.hierarchy.config.max_depth {
            let depth = u32::try_from(parent_chain.len()).unwrap_or(u32::MAX).saturating_add(height);
            if depth > max {
                return Err(Error::DepthLimit { id: format!("{id:?}"), depth, max });
            }
        }
        Ok(())
    }

    pub async fn insert(&mut self, id: S::Key, parent: Option<S::Key>, payload: S::Payload) -> Result<()> {
        if parent.as_ref() == Some(&id) {
            return Err(Error::SelfParent { id: format!("{id:?}") });
        }
        if self.store().load_node(&self.tx, &id).await?.is_some() {
            return Err(Error::DuplicateNode(format!("{id:?}")));
        }
        let parent_chain = match &parent {
            Some(p) => self.parent_chain(p).await?,
            None => Vec::new(),
        };
        self.check_depth(&id, &parent_chain, 0)?;

        let written = self.write_insert(id.clone(), parent, payload, parent_chain).await;
        self.poison_on_err(written)?;
        trace!(id = ?id, "node inserted");
        Ok(())
    }

    async fn write_insert(
        &mut self,
        id: S::Key,
        parent: Option<S::Key>,
        payload: S::Payload,
        parent_chain: Vec<Rel<S>>,
    ) -> Result<()> {
        let store = self.store();
        store.insert_node(&mut self.tx, NodeRecord::new(id.clone(), parent, payload)).await?;
        // A new node has no children; the cascade only writes its own chain.
        self.cascade(id, parent_chain).await?;
        Ok(())
    }

    pub async fn create(&mut self, parent: Option<S::Key>, payload: S::Payload) -> Result<S::Key>
    where
        S::Key: SequentialKey,
    {
        let last = self.hierarchy.last_generated.lock().clone();
        let mut id = next_key(last.as_ref())?;
        while self.store().load_node(&self.tx, &id).await?.is_some() {
            id = next_key(Some(&id))?;
        }
        self.insert(id.clone(), parent, payload).await?;
        *self.hierarchy.last_generated.lock() = Some(id.clone());
        Ok(id)
    }

    pub async fn set_parent(&mut self, id: &S::Key, parent: Option<S::Key>) -> Result<CascadeStats> {
        self.reparent(id, parent, None).await
    }

    pub async fn set_parent_with(
        &mut self,
        id: &S::Key,
        parent: Option<S::Key>,
        payload: S::Payload,
    ) -> Result<CascadeStats> {
        self.reparent(id, parent, Some(payload)).await
    }

    async fn reparent(
        &mut self,
        id: &S::Key,
        parent: Option<S::Key>,
        payload: Option<S::Payload>,
    ) -> Result<CascadeStats> {
        if parent.as_ref() == Some(id) {
            return Err(Error::SelfParent { id: format!("{id:?}") });
        }
        let store = self.store();
        let record = self.require(id).await?;

        let parent_chain = match &parent {
            Some(p) => {
                if store.any_relationship(&self.tx, &RelationshipFilter::between(id.clone(), p.clone())).await? {
                    return Err(Error::Cycle { id: format!("{id:?}"), parent: format!("{p:?}") });
                }
                self.parent_chain(p).await?
            }
            None => Vec::new(),
        };

        if self.hierarchy.config.max_depth.is_some() {
            let subtree = store
                .load_relationships(&self.tx, &RelationshipFilter::descendants_of(id.clone(), false))
                .await?;
            let height = subtree.iter().map(|r| r.depth).max().unwrap_or(0);
            self.check_depth(id, &parent_chain, height)?;
        }

        let written = self.write_reparent(record, parent, payload, parent_chain).await;
        self.poison_on_err(written)
    }

    async fn write_reparent(
        &mut self,
        mut record: Record<S>,
        parent: Option<S::Key>,
        payload: Option<S::Payload>,
        parent_chain: Vec<Rel<S>>,
    ) -> Result<CascadeStats> {
        let id = record.id.clone();
        debug!(id = ?id, from = ?record.parent_id, to = ?parent, "set_parent");
        record.parent_id = parent;
        if let Some(payload) = payload {
            record.payload = payload;
        }
        self.store().update_node(&mut self.tx, record).await?;

        let stats = self.cascade(id.clone(), parent_chain).await?;
        debug!(
            id = ?id,
            nodes = stats.nodes_rebuilt,
            inserted = stats.edges_inserted,
            removed = stats.edges_removed,
            "cascade complete"
        );
        Ok(stats)
    }

    /// Top-down rebuild of the subtree at `start`, whose new parent chain is
    /// `start_chain`. Each queue entry carries the freshly computed chain of
    /// its parent, so no node re-reads an ancestor that was just rewritten.
    async fn cascade(&mut self, start: S::Key, start_chain: Vec<Rel<S>>) -> Result<CascadeStats> {
        let store = self.store();
        let mut stats = CascadeStats::default();
        let mut rebuilt = Vec::new();
        let mut queue = VecDeque::from([(start, start_chain)]);

        while let Some((current, parent_chain)) = queue.pop_front() {
            let record = self.require(&current).await?;
            let chain = ancestor_chain(&current, &parent_chain, &record.payload);

            let old = store
                .load_relationships(&self.tx, &RelationshipFilter::ancestors_of(current.clone(), false))
                .await?;
            let stale: Vec<(S::Key, S::Key)> = old
                .iter()
                .filter(|r| !chain.iter().any(|c| c.ancestor_id == r.ancestor_id))
                .map(|r| r.key())
                .collect();
            stats.edges_removed += store.delete_relationships(&mut self.tx, &stale).await?;
            stats.edges_inserted += chain
                .iter()
                .filter(|c| !c.is_reflexive() && !old.iter().any(|r| r.ancestor_id == c.ancestor_id))
                .count() as u64;
            store.upsert_relationships(&mut self.tx, chain.clone()).await?;

            let children = store
                .load_relationships(&self.tx, &RelationshipFilter::children_of(current.clone()))
                .await?;
            queue.extend(children.into_iter().map(|r| (r.descendant_id, chain.clone())));

            stats.nodes_rebuilt += 1;
            rebuilt.push(current);
        }

        if self.hierarchy.config.verify_after_mutation {
            for id in &rebuilt {
                let record = self.require(id).await?;
                verify_chain(store, &self.tx, &record).await?;
            }
        }
        Ok(stats)
    }

    pub async fn delete_node(&mut self, id: &S::Key) -> Result<()> {
        let store = self.store();
        self.require(id).await?;
        let below = store
            .count_relationships(&self.tx, &RelationshipFilter::children_of(id.clone()))
            .await?;
        if below > 0 {
            return Err(Error::ConstraintViolation(format!(
                "Cannot delete node {id:?} with {below} children. Delete the subtree instead."
            )));
        }
        let written = self.write_delete(std::slice::from_ref(id)).await;
        let edges = self.poison_on_err(written)?;
        debug!(id = ?id, edges, "node deleted");
        Ok(())
    }

    pub async fn delete_subtree(&mut self, id: &S::Key) -> Result<u64> {
        self.require(id).await?;
        let mut subtree = self
            .store()
            .load_relationships(&self.tx, &RelationshipFilter::descendants_of(id.clone(), true))
            .await?;
        // Deepest first, so every node is a leaf by the time it goes.
        subtree.sort_by(|a, b| b.depth.cmp(&a.depth));
        let doomed: Vec<S::Key> = subtree.into_iter().map(|r| r.descendant_id).collect();

        let written = self.write_delete(&doomed).await;
        self.poison_on_err(written)?;
        debug!(id = ?id, removed = doomed.len(), "subtree deleted");
        Ok(doomed.len() as u64)
    }

    /// Detach and delete `ids` in order. Returns how many edges went with them.
    async fn write_delete(&mut self, ids: &[S::Key]) -> Result<u64> {
        let store = self.store();
        let mut edges = 0;
        for id in ids {
            edges += store.delete_relationships_touching(&mut self.tx, id).await?;
            store.delete_node(&mut self.tx, id).await?;
        }
        Ok(edges)
    }
}

/// Check that `node`'s ancestor chain is its parent's chain shifted by one,
/// plus the reflexive edge.
async fn verify_chain<S: ClosureStore>(store: &S, tx: &S::Tx, node: &Record<S>) -> Result<()> {
    let id = &node.id;
    let chain = store.load_relationships(tx, &RelationshipFilter::ancestors_of(id.clone(), true)).await?;
    if !chain.iter().any(|r| &r.ancestor_id == id && r.depth == 0) {
        return Err(Error::CorruptClosure(format!("node {id:?} lacks its reflexive edge")));
    }

    let parent_chain = match &node.parent_id {
        Some(p) => store.load_relationships(tx, &RelationshipFilter::ancestors_of(p.clone(), true)).await?,
        None => Vec::new(),
    };
    if chain.len() != parent_chain.len() + 1 {
        return Err(Error::CorruptClosure(format!(
            "node {id:?} has {} ancestors, expected {}",
            chain.len(),
            parent_chain.len() + 1
        )));
    }
    for inherited in &parent_chain {
        let found = chain.iter().find(|r| r.ancestor_id == inherited.ancestor_id);
        if found.map(|r| r.depth) != Some(inherited.depth + 1) {
            return Err(Error::CorruptClosure(format!(
                "node {id:?} did not inherit {:?} at depth {}",
                inherited.ancestor_id,
                inherited.depth + 1
            )));
        }
    }
    Ok(())
}
