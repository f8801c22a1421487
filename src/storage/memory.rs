//! In-memory closure store.
//!
//! This is the reference implementation of `ClosureStore`.
//!
//! ## Transactions
//!
//! The committed state is an `Arc<MemoryState>` behind a `RwLock`. Each
//! transaction starts from a clone of that `Arc`, which is its snapshot:
//! reads never see another transaction's uncommitted writes, and never see
//! half of a cascade. The first write copies the state (`Arc::make_mut`).
//!
//! Commit publishes the working copy only if no other writer committed since
//! the snapshot was taken, otherwise it fails with `Error::TxError` and the
//! caller's work is discarded. Rollback just drops the working copy.
//!
//! Every write copies the whole state once per transaction. This is fine for
//! tests and embedding, not for large hierarchies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::model::*;
use crate::query::RelationshipFilter;
use crate::tx::{Transaction, TxId, TxMode};
use crate::{Error, Result};
use super::ClosureStore;

// ============================================================================
// MemoryState
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryState<K, P> {
    nodes: HashMap<K, NodeRecord<K, P>>,
    relationships: HashMap<(K, K), ClosureRelationship<K, P>>,
    /// ancestor → descendants with an edge from it
    by_ancestor: HashMap<K, HashSet<K>>,
    /// descendant → ancestors with an edge to it
    by_descendant: HashMap<K, HashSet<K>>,
    version: u64,
}

impl<K: NodeKey, P: EdgePayload> MemoryState<K, P> {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            relationships: HashMap::new(),
            by_ancestor: HashMap::new(),
            by_descendant: HashMap::new(),
            version: 0,
        }
    }

    fn insert_relationship(&mut self, rel: ClosureRelationship<K, P>) {
        self.by_ancestor
            .entry(rel.ancestor_id.clone())
            .or_default()
            .insert(rel.descendant_id.clone());
        self.by_descendant
            .entry(rel.descendant_id.clone())
            .or_default()
            .insert(rel.ancestor_id.clone());
        self.relationships.insert(rel.key(), rel);
    }

    fn remove_relationship(&mut self, ancestor: &K, descendant: &K) -> bool {
        let removed = self
            .relationships
            .remove(&(ancestor.clone(), descendant.clone()))
            .is_some();
        if removed {
            if let Some(set) = self.by_ancestor.get_mut(ancestor) {
                set.remove(descendant);
                if set.is_empty() {
                    self.by_ancestor.remove(ancestor);
                }
            }
            if let Some(set) = self.by_descendant.get_mut(descendant) {
                set.remove(ancestor);
                if set.is_empty() {
                    self.by_descendant.remove(descendant);
                }
            }
        }
        removed
    }

    fn touching(&self, id: &K) -> Vec<(K, K)> {
        let mut pairs = Vec::new();
        if let Some(descendants) = self.by_ancestor.get(id) {
            pairs.extend(descendants.iter().map(|d| (id.clone(), d.clone())));
        }
        if let Some(ancestors) = self.by_descendant.get(id) {
            pairs.extend(ancestors.iter().filter(|a| *a != id).map(|a| (a.clone(), id.clone())));
        }
        pairs
    }

    fn select(&self, filter: &RelationshipFilter<K>) -> Vec<ClosureRelationship<K, P>> {
        let candidates: Box<dyn Iterator<Item = &ClosureRelationship<K, P>> + '_> =
            match (&filter.ancestor_id, &filter.descendant_id) {
                (Some(a), Some(d)) => {
                    Box::new(self.relationships.get(&(a.clone(), d.clone())).into_iter())
                }
                (Some(a), None) => Box::new(
                    self.by_ancestor
                        .get(a)
                        .into_iter()
                        .flatten()
                        .filter_map(move |d| self.relationships.get(&(a.clone(), d.clone()))),
                ),
                (None, Some(d)) => Box::new(
                    self.by_descendant
                        .get(d)
                        .into_iter()
                        .flatten()
                        .filter_map(move |a| self.relationships.get(&(a.clone(), d.clone()))),
                ),
                (None, None) => Box::new(self.relationships.values()),
            };
        candidates.filter(|r| filter.matches(r)).cloned().collect()
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory closure table storage.
pub struct MemoryStore<K, P = ()> {
    inner: Arc<MemoryInner<K, P>>,
}

struct MemoryInner<K, P> {
    committed: RwLock<Arc<MemoryState<K, P>>>,
    next_tx_id: AtomicU64,
}

impl<K: NodeKey, P: EdgePayload> MemoryStore<K, P> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                committed: RwLock::new(Arc::new(MemoryState::new())),
                next_tx_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of commits that changed state.
    pub fn version(&self) -> u64 {
        self.inner.committed.read().version
    }
}

impl<K: NodeKey, P: EdgePayload> Default for MemoryStore<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> Clone for MemoryStore<K, P> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

// ============================================================================
// MemoryTx
// ============================================================================

/// Snapshot transaction over a `MemoryStore`.
pub struct MemoryTx<K, P = ()> {
    id: TxId,
    mode: TxMode,
    base_version: u64,
    state: Arc<MemoryState<K, P>>,
    dirty: bool,
}

impl<K: NodeKey, P: EdgePayload> MemoryTx<K, P> {
    fn write(&mut self) -> Result<&mut MemoryState<K, P>> {
        self.ensure_writable()?;
        self.dirty = true;
        Ok(Arc::make_mut(&mut self.state))
    }
}

impl<K: NodeKey, P: EdgePayload> Transaction for MemoryTx<K, P> {
    fn mode(&self) -> TxMode { self.mode }
    fn id(&self) -> TxId { self.id }
}

// ============================================================================
// ClosureStore impl
// ============================================================================

#[async_trait]
impl<K: NodeKey, P: EdgePayload> ClosureStore for MemoryStore<K, P> {
    type Key = K;
    type Payload = P;
    type Tx = MemoryTx<K, P>;

    async fn shutdown(&self) -> Result<()> { Ok(()) }

    async fn begin_tx(&self, mode: TxMode) -> Result<MemoryTx<K, P>> {
        let id = TxId(self.inner.next_tx_id.fetch_add(1, Ordering::Relaxed));
        let state = Arc::clone(&self.inner.committed.read());
        Ok(MemoryTx { id, mode, base_version: state.version, state, dirty: false })
    }

    async fn commit_tx(&self, tx: MemoryTx<K, P>) -> Result<()> {
        if !tx.dirty {
            return Ok(());
        }
        let mut committed = self.inner.committed.write();
        if committed.version != tx.base_version {
            warn!(tx = %tx.id, base = tx.base_version, current = committed.version, "commit conflict");
            return Err(Error::TxError(format!(
                "{} conflicts with a concurrent commit (snapshot v{}, now v{})",
                tx.id, tx.base_version, committed.version
            )));
        }
        let mut state = tx.state;
        Arc::make_mut(&mut state).version = tx.base_version + 1;
        *committed = state;
        debug!(tx = %tx.id, version = tx.base_version + 1, "committed");
        Ok(())
    }

    async fn rollback_tx(&self, tx: MemoryTx<K, P>) -> Result<()> {
        if tx.dirty {
            debug!(tx = %tx.id, "rolled back");
        }
        Ok(())
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    async fn load_node(&self, tx: &MemoryTx<K, P>, id: &K) -> Result<Option<NodeRecord<K, P>>> {
        Ok(tx.state.nodes.get(id).cloned())
    }

    async fn insert_node(&self, tx: &mut MemoryTx<K, P>, record: NodeRecord<K, P>) -> Result<()> {
        let state = tx.write()?;
        if state.nodes.contains_key(&record.id) {
            return Err(Error::DuplicateNode(format!("{:?}", record.id)));
        }
        state.nodes.insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_node(&self, tx: &mut MemoryTx<K, P>, record: NodeRecord<K, P>) -> Result<()> {
        let state = tx.write()?;
        let slot = state
            .nodes
            .get_mut(&record.id)
            .ok_or_else(|| Error::NotFound(format!("Node {:?}", record.id)))?;
        *slot = record;
        Ok(())
    }

    async fn delete_node(&self, tx: &mut MemoryTx<K, P>, id: &K) -> Result<bool> {
        let state = tx.write()?;
        let edges = state.by_ancestor.get(id).map_or(0, HashSet::len)
            + state.by_descendant.get(id).map_or(0, HashSet::len);
        if edges > 0 {
            return Err(Error::ConstraintViolation(format!(
                "Cannot delete node {id:?} with {edges} relationships. Delete relationships first."
            )));
        }
        Ok(state.nodes.remove(id).is_some())
    }

    async fn all_nodes(&self, tx: &MemoryTx<K, P>) -> Result<Vec<NodeRecord<K, P>>> {
        Ok(tx.state.nodes.values().cloned().collect())
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    async fn load_relationships(
        &self,
        tx: &MemoryTx<K, P>,
        filter: &RelationshipFilter<K>,
    ) -> Result<Vec<ClosureRelationship<K, P>>> {
        Ok(tx.state.select(filter))
    }

    async fn upsert_relationships(
        &self,
        tx: &mut MemoryTx<K, P>,
        rels: Vec<ClosureRelationship<K, P>>,
    ) -> Result<()> {
        let state = tx.write()?;
        for rel in rels {
            for end in [&rel.ancestor_id, &rel.descendant_id] {
                if !state.nodes.contains_key(end) {
                    return Err(Error::NotFound(format!("Node {end:?} for relationship {rel:?}")));
                }
            }
            state.insert_relationship(rel);
        }
        Ok(())
    }

    async fn delete_relationships(&self, tx: &mut MemoryTx<K, P>, pairs: &[(K, K)]) -> Result<u64> {
        let state = tx.write()?;
        Ok(pairs.iter().filter(|(a, d)| state.remove_relationship(a, d)).count() as u64)
    }

    async fn delete_relationships_touching(&self, tx: &mut MemoryTx<K, P>, id: &K) -> Result<u64> {
        let state = tx.write()?;
        let pairs = state.touching(id);
        Ok(pairs.iter().filter(|(a, d)| state.remove_relationship(a, d)).count() as u64)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    async fn node_count(&self, tx: &MemoryTx<K, P>) -> Result<u64> {
        Ok(tx.state.nodes.len() as u64)
    }

    async fn relationship_count(&self, tx: &MemoryTx<K, P>) -> Result<u64> {
        Ok(tx.state.relationships.len() as u64)
    }
}

// ============================================================================
// Tests
// ============================================================================
