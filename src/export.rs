//! JSON snapshot export: serialize a store's nodes and closure rows.
//!
//! ```text
//! ClosureStore → export_snapshot() → {"nodes": [...], "relationships": [...]}
//!   → import_snapshot() into an empty store
//! ```
//!
//! The snapshot carries the materialized closure as-is; importing does not
//! recompute it. Run `Hierarchy::check_invariants` afterwards when the
//! snapshot comes from an untrusted source.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::*;
use crate::storage::ClosureStore;
use crate::tx::TxMode;
use crate::{Error, Result};

/// Everything a store holds, in deterministic order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosureSnapshot<K, P = ()> {
    pub nodes: Vec<NodeRecord<K, P>>,
    pub relationships: Vec<ClosureRelationship<K, P>>,
}

/// Counts from a successful import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub nodes: u64,
    pub relationships: u64,
}

/// Read a consistent snapshot of the whole store.
pub async fn snapshot<S: ClosureStore>(store: &S) -> Result<ClosureSnapshot<S::Key, S::Payload>> {
    let tx = store.begin_tx(TxMode::ReadOnly).await?;
    let mut nodes = store.all_nodes(&tx).await?;
    let mut relationships = store
        .load_relationships(&tx, &crate::query::RelationshipFilter::all())
        .await?;
    store.commit_tx(tx).await?;

    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    relationships.sort();
    Ok(ClosureSnapshot { nodes, relationships })
}

/// Export the store as pretty-printed JSON.
pub async fn export_snapshot<S>(store: &S, writer: &mut dyn Write) -> Result<()>
where
    S: ClosureStore,
    S::Key: Serialize,
    S::Payload: Serialize,
{
    let snapshot = snapshot(store).await?;
    serde_json::to_writer_pretty(&mut *writer, &snapshot)?;
    writeln!(writer)?;
    info!(
        nodes = snapshot.nodes.len(),
        relationships = snapshot.relationships.len(),
        "snapshot exported"
    );
    Ok(())
}

/// Import a snapshot in one transaction. Fails with `DuplicateNode` if any
/// id already exists, leaving the store untouched.
pub async fn import_snapshot<S>(store: &S, reader: impl Read) -> Result<ImportStats>
where
    S: ClosureStore,
    S::Key: DeserializeOwned,
    S::Payload: DeserializeOwned,
{
    let snapshot: ClosureSnapshot<S::Key, S::Payload> = serde_json::from_reader(reader)?;
    load_snapshot(store, snapshot).await
}

/// Write an already-parsed snapshot into the store.
pub async fn load_snapshot<S: ClosureStore>(
    store: &S,
    snapshot: ClosureSnapshot<S::Key, S::Payload>,
) -> Result<ImportStats> {
    for rel in &snapshot.relationships {
        if rel.is_reflexive() != (rel.depth == 0) {
            return Err(Error::CorruptClosure(format!(
                "relationship {:?} -> {:?} has depth {}",
                rel.ancestor_id, rel.descendant_id, rel.depth
            )));
        }
    }

    let stats = ImportStats {
        nodes: snapshot.nodes.len() as u64,
        relationships: snapshot.relationships.len() as u64,
    };

    let mut tx = store.begin_tx(TxMode::ReadWrite).await?;
    let result = async {
        for node in snapshot.nodes {
            store.insert_node(&mut tx, node).await?;
        }
        store.upsert_relationships(&mut tx, snapshot.relationships).await
    }
    .await;

    match result {
        Ok(()) => {
            store.commit_tx(tx).await?;
            info!(nodes = stats.nodes, relationships = stats.relationships, "snapshot imported");
            Ok(stats)
        }
        Err(e) => {
            store.rollback_tx(tx).await?;
            Err(e)
        }
    }
}
