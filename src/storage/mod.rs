//! # Closure Store Trait
//!
//! The contract between the closure maintainer and whatever durably holds
//! nodes and relationships. `Hierarchy` talks to storage only through this
//! trait.
//!
//! ## Implementations
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | `MemoryStore` | `memory` | Snapshot-isolated in-memory store for testing/embedding |

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::*;
use crate::query::{self, RelationshipFilter};
use crate::tx::{Transaction, TxMode};
use crate::Result;

pub use memory::{MemoryStore, MemoryTx};

// ============================================================================
// Backend Configuration
// ============================================================================

/// Which store a `Hierarchy` opens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-memory (no persistence)
    #[default]
    Memory,
}

// ============================================================================
// ClosureStore Trait
// ============================================================================

/// The persistence contract.
///
/// Writes are staged in the transaction and become visible to other
/// transactions only on `commit_tx`. Stores surface their own failures
/// (conflicts, constraint violations) as `Error::StorageError` /
/// `Error::TxError` and never retry.
#[async_trait]
pub trait ClosureStore: Send + Sync + 'static {
    type Key: NodeKey;
    type Payload: EdgePayload;
    /// The transaction type for this store.
    type Tx: Transaction;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Shut down the store, flushing any pending writes.
    async fn shutdown(&self) -> Result<()>;

    // ========================================================================
    // Transactions
    // ========================================================================

    async fn begin_tx(&self, mode: TxMode) -> Result<Self::Tx>;

    async fn commit_tx(&self, tx: Self::Tx) -> Result<()>;

    async fn rollback_tx(&self, tx: Self::Tx) -> Result<()>;

    // ========================================================================
    // Nodes
    // ========================================================================

    async fn load_node(
        &self,
        tx: &Self::Tx,
        id: &Self::Key,
    ) -> Result<Option<NodeRecord<Self::Key, Self::Payload>>>;

    /// Insert a new node. Fails with `DuplicateNode` if the id is taken.
    async fn insert_node(
        &self,
        tx: &mut Self::Tx,
        record: NodeRecord<Self::Key, Self::Payload>,
    ) -> Result<()>;

    /// Replace the parent pointer and payload of an existing node.
    async fn update_node(
        &self,
        tx: &mut Self::Tx,
        record: NodeRecord<Self::Key, Self::Payload>,
    ) -> Result<()>;

    /// Delete a node. Returns true if it existed.
    /// Fails while any relationship still touches it.
    async fn delete_node(&self, tx: &mut Self::Tx, id: &Self::Key) -> Result<bool>;

    /// Delete a node together with every relationship touching it.
    async fn detach_delete_node(&self, tx: &mut Self::Tx, id: &Self::Key) -> Result<bool> {
        self.delete_relationships_touching(tx, id).await?;
        self.delete_node(tx, id).await
    }

    async fn all_nodes(&self, tx: &Self::Tx) -> Result<Vec<NodeRecord<Self::Key, Self::Payload>>>;

    /// Nodes without a parent.
    async fn roots(&self, tx: &Self::Tx) -> Result<Vec<NodeRecord<Self::Key, Self::Payload>>> {
        let nodes = self.all_nodes(tx).await?;
        Ok(query::roots(&nodes).into_iter().cloned().collect())
    }

    /// Direct children, found through depth-1 relationships.
    async fn children_of(
        &self,
        tx: &Self::Tx,
        id: &Self::Key,
    ) -> Result<Vec<NodeRecord<Self::Key, Self::Payload>>> {
        let rels = self.load_relationships(tx, &RelationshipFilter::children_of(id.clone())).await?;
        let mut children = Vec::with_capacity(rels.len());
        for rel in &rels {
            if let Some(child) = self.load_node(tx, &rel.descendant_id).await? {
                children.push(child);
            }
        }
        Ok(children)
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    async fn load_relationships(
        &self,
        tx: &Self::Tx,
        filter: &RelationshipFilter<Self::Key>,
    ) -> Result<Vec<ClosureRelationship<Self::Key, Self::Payload>>>;

    /// Default: loads the matching relationships and counts them.
    async fn count_relationships(
        &self,
        tx: &Self::Tx,
        filter: &RelationshipFilter<Self::Key>,
    ) -> Result<u64> {
        Ok(self.load_relationships(tx, filter).await?.len() as u64)
    }

    /// Default: loads the matching relationships and checks for any.
    async fn any_relationship(
        &self,
        tx: &Self::Tx,
        filter: &RelationshipFilter<Self::Key>,
    ) -> Result<bool> {
        Ok(!self.load_relationships(tx, filter).await?.is_empty())
    }

    /// Insert, or replace by `(ancestor_id, descendant_id)`.
    async fn upsert_relationships(
        &self,
        tx: &mut Self::Tx,
        rels: Vec<ClosureRelationship<Self::Key, Self::Payload>>,
    ) -> Result<()>;

    /// Delete by `(ancestor_id, descendant_id)`. Returns how many existed.
    async fn delete_relationships(
        &self,
        tx: &mut Self::Tx,
        pairs: &[(Self::Key, Self::Key)],
    ) -> Result<u64>;

    /// Delete every relationship with `ancestor_id = id OR descendant_id = id`.
    async fn delete_relationships_touching(&self, tx: &mut Self::Tx, id: &Self::Key) -> Result<u64>;

    // ========================================================================
    // Introspection
    // ========================================================================

    async fn node_count(&self, tx: &Self::Tx) -> Result<u64>;

    async fn relationship_count(&self, tx: &Self::Tx) -> Result<u64>;
}
