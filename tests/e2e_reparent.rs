//! End-to-end tests for structural mutations: re-parenting cascades,
//! rejected moves, deletes, and transaction atomicity.

use std::collections::BTreeSet;
use std::sync::Arc;

use closure_table::{
    ClosureRelationship, ClosureStore, Error, Hierarchy, HierarchyConfig, MemoryStore, MemoryTx,
    NodeId, NodeRecord, RelationshipFilter, TxMode,
};
use pretty_assertions::assert_eq;

type Tree = Hierarchy<MemoryStore<&'static str>>;

/// root → a → b → c, plus a second root x.
async fn chain() -> Tree {
    let h = Tree::open_memory().await.unwrap();
    h.insert("root", None, ()).await.unwrap();
    h.insert("a", Some("root"), ()).await.unwrap();
    h.insert("b", Some("a"), ()).await.unwrap();
    h.insert("c", Some("b"), ()).await.unwrap();
    h.insert("x", None, ()).await.unwrap();
    h
}

fn ids(nodes: Vec<NodeRecord<&'static str>>) -> BTreeSet<&'static str> {
    nodes.into_iter().map(|n| n.id).collect()
}

// ============================================================================
// 1. Cascade
// ============================================================================

#[tokio::test]
async fn test_move_subtree_under_other_root() {
    let h = chain().await;
    let stats = h.set_parent(&"a", Some("x")).await.unwrap();

    assert_eq!(stats.nodes_rebuilt, 3);
    // root loses a, b, c; x gains a, b, c.
    assert_eq!(stats.edges_removed, 3);
    assert_eq!(stats.edges_inserted, 3);

    assert_eq!(ids(h.ancestors_of(&"c", false).await.unwrap()), BTreeSet::from(["x", "a", "b"]));
    assert_eq!(h.descendants_count(&"root").await.unwrap(), 0);
    assert_eq!(h.descendants_count(&"x").await.unwrap(), 3);
    h.check_invariants().await.unwrap();
}

#[tokio::test]
async fn test_detach_to_root() {
    let h = chain().await;
    h.set_parent(&"b", None).await.unwrap();

    assert_eq!(ids(h.roots().await.unwrap()), BTreeSet::from(["root", "b", "x"]));
    assert_eq!(h.ancestors_count(&"c").await.unwrap(), 1);
    assert_eq!(ids(h.descendants_of(&"root", true).await.unwrap()), BTreeSet::from(["root", "a"]));
    h.check_invariants().await.unwrap();
}

#[tokio::test]
async fn test_move_to_same_parent_is_stable() {
    let h = chain().await;
    let before = h.relationship_count().await.unwrap();
    let stats = h.set_parent(&"b", Some("a")).await.unwrap();

    assert_eq!(stats.edges_inserted, 0);
    assert_eq!(stats.edges_removed, 0);
    assert_eq!(h.relationship_count().await.unwrap(), before);
}

#[tokio::test]
async fn test_depths_after_move() {
    let h = chain().await;
    h.set_parent(&"c", Some("root")).await.unwrap();

    let tx = h.store().begin_tx(TxMode::ReadOnly).await.unwrap();
    let rels = h
        .store()
        .load_relationships(&tx, &RelationshipFilter::ancestors_of("c", true))
        .await
        .unwrap();
    let depths: BTreeSet<(&str, u32)> = rels.iter().map(|r| (r.ancestor_id, r.depth)).collect();
    assert_eq!(depths, BTreeSet::from([("c", 0), ("root", 1)]));
}

// ============================================================================
// 2. Rejected moves leave everything untouched
// ============================================================================

#[tokio::test]
async fn test_self_parent_rejected() {
    let h = chain().await;
    let version = h.store().version();

    assert!(matches!(h.set_parent(&"b", Some("b")).await, Err(Error::SelfParent { .. })));
    assert!(matches!(h.insert("y", Some("y"), ()).await, Err(Error::SelfParent { .. })));
    assert_eq!(h.store().version(), version);
}

#[tokio::test]
async fn test_cycle_rejected() {
    let h = chain().await;
    let before = h.relationship_count().await.unwrap();

    match h.set_parent(&"a", Some("c")).await {
        Err(Error::Cycle { id, parent }) => {
            assert_eq!(id, "\"a\"");
            assert_eq!(parent, "\"c\"");
        }
        other => panic!("expected Cycle, got {other:?}"),
    }
    assert_eq!(h.relationship_count().await.unwrap(), before);
    assert_eq!(h.parent_of(&"a").await.unwrap().map(|n| n.id), Some("root"));
}

#[tokio::test]
async fn test_missing_parent_rejected() {
    let h = chain().await;
    assert!(matches!(h.set_parent(&"a", Some("nope")).await, Err(Error::NotFound(_))));
    assert!(matches!(h.insert("y", Some("nope"), ()).await, Err(Error::NotFound(_))));
    // The failed insert rolled back its node as well.
    assert!(h.get_node(&"y").await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_insert_rejected() {
    let h = chain().await;
    assert!(matches!(h.insert("a", None, ()).await, Err(Error::DuplicateNode(_))));
}

#[tokio::test]
async fn test_depth_limit() {
    let store = MemoryStore::<&'static str>::new();
    let h = Hierarchy::with_config(store, HierarchyConfig::default().with_max_depth(2));
    h.insert("r", None, ()).await.unwrap();
    h.insert("a", Some("r"), ()).await.unwrap();
    h.insert("b", Some("a"), ()).await.unwrap();

    match h.insert("c", Some("b"), ()).await {
        Err(Error::DepthLimit { depth, max, .. }) => {
            assert_eq!(depth, 3);
            assert_eq!(max, 2);
        }
        other => panic!("expected DepthLimit, got {other:?}"),
    }

    // Moving a two-deep subtree under a depth-1 node would reach depth 3.
    h.insert("s", None, ()).await.unwrap();
    h.insert("t", Some("s"), ()).await.unwrap();
    assert!(matches!(h.set_parent(&"a", Some("t")).await, Err(Error::DepthLimit { .. })));
    assert_eq!(h.ancestors_count(&"b").await.unwrap(), 2);
}

// ============================================================================
// 3. Payloads
// ============================================================================

#[tokio::test]
async fn test_payload_follows_attachment() {
    let h = Hierarchy::<MemoryStore<&'static str, u32>>::open_memory().await.unwrap();
    h.insert("r", None, 0).await.unwrap();
    h.insert("a", Some("r"), 7).await.unwrap();
    h.insert("b", Some("a"), 3).await.unwrap();

    let payload_of = |h: &Hierarchy<MemoryStore<&'static str, u32>>, a: &'static str, d: &'static str| {
        let store = h.store().clone();
        async move {
            let tx = store.begin_tx(TxMode::ReadOnly).await.unwrap();
            let rels = store.load_relationships(&tx, &RelationshipFilter::between(a, d)).await.unwrap();
            rels.first().map(|r| r.payload)
        }
    };

    assert_eq!(payload_of(&h, "b", "b").await, Some(0));
    assert_eq!(payload_of(&h, "a", "b").await, Some(3));
    assert_eq!(payload_of(&h, "r", "b").await, Some(3));

    h.set_parent_with(&"b", Some("r"), 9).await.unwrap();
    assert_eq!(payload_of(&h, "r", "b").await, Some(9));
    assert_eq!(payload_of(&h, "a", "b").await, None);
    assert_eq!(h.get_node(&"b").await.unwrap().map(|n| n.payload), Some(9));
}

// ============================================================================
// 4. Deletes
// ============================================================================

#[tokio::test]
async fn test_delete_leaf() {
    let h = chain().await;
    h.delete_node(&"c").await.unwrap();

    assert!(h.get_node(&"c").await.unwrap().is_none());
    assert_eq!(h.descendants_count(&"root").await.unwrap(), 2);
    h.check_invariants().await.unwrap();
}

#[tokio::test]
async fn test_delete_inner_node_rejected() {
    let h = chain().await;
    assert!(matches!(h.delete_node(&"a").await, Err(Error::ConstraintViolation(_))));
    assert_eq!(h.node_count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_delete_subtree() {
    let h = chain().await;
    assert_eq!(h.delete_subtree(&"a").await.unwrap(), 3);

    assert_eq!(h.node_count().await.unwrap(), 2);
    assert_eq!(h.relationship_count().await.unwrap(), 2);
    assert!(!h.has_descendants(&"root").await.unwrap());
}

// ============================================================================
// 5. Transactions
// ============================================================================

#[tokio::test]
async fn test_explicit_tx_commits_together() {
    let h = chain().await;
    let mut tx = h.begin().await.unwrap();
    tx.insert("y", Some("x"), ()).await.unwrap();
    tx.set_parent(&"a", Some("y")).await.unwrap();

    // Not visible before commit.
    assert!(h.get_node(&"y").await.unwrap().is_none());
    tx.commit().await.unwrap();

    assert_eq!(ids(h.ancestors_of(&"c", false).await.unwrap()), BTreeSet::from(["x", "y", "a", "b"]));
    h.check_invariants().await.unwrap();
}

#[tokio::test]
async fn test_explicit_tx_rollback_discards_everything() {
    let h = chain().await;
    let before = h.relationship_count().await.unwrap();

    let mut tx = h.begin().await.unwrap();
    tx.insert("y", Some("x"), ()).await.unwrap();
    tx.set_parent(&"a", Some("y")).await.unwrap();
    assert!(matches!(tx.set_parent(&"y", Some("c")).await, Err(Error::Cycle { .. })));
    tx.rollback().await.unwrap();

    assert!(h.get_node(&"y").await.unwrap().is_none());
    assert_eq!(h.relationship_count().await.unwrap(), before);
    assert_eq!(h.parent_of(&"a").await.unwrap().map(|n| n.id), Some("root"));
}

#[tokio::test]
async fn test_dropped_tx_is_discarded() {
    let h = chain().await;
    {
        let mut tx = h.begin().await.unwrap();
        tx.delete_subtree(&"root").await.unwrap();
    }
    assert_eq!(h.node_count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_rejected_insert_stages_nothing() {
    let h = chain().await;
    let mut tx = h.begin().await.unwrap();

    assert!(matches!(tx.insert("y", Some("nope"), ()).await, Err(Error::NotFound(_))));
    assert!(matches!(tx.insert("a", None, ()).await, Err(Error::DuplicateNode(_))));
    assert!(!tx.is_poisoned());
    tx.insert("z", Some("x"), ()).await.unwrap();
    tx.commit().await.unwrap();

    assert!(h.get_node(&"y").await.unwrap().is_none());
    assert_eq!(ids(h.roots().await.unwrap()), BTreeSet::from(["root", "x"]));
    assert_eq!(h.parent_of(&"z").await.unwrap().map(|n| n.id), Some("x"));
    h.check_invariants().await.unwrap();
}

#[tokio::test]
async fn test_insert_over_depth_limit_stages_nothing() {
    let store = MemoryStore::<&'static str>::new();
    let h = Hierarchy::with_config(store, HierarchyConfig::default().with_max_depth(1));
    h.insert("r", None, ()).await.unwrap();
    h.insert("a", Some("r"), ()).await.unwrap();

    let mut tx = h.begin().await.unwrap();
    assert!(matches!(tx.insert("c", Some("a"), ()).await, Err(Error::DepthLimit { .. })));
    tx.commit().await.unwrap();

    assert!(h.get_node(&"c").await.unwrap().is_none());
    assert_eq!(h.node_count().await.unwrap(), 2);
    assert_eq!(h.relationship_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_verified_mutations() {
    let store = MemoryStore::<&'static str>::new();
    let h = Hierarchy::with_config(store, HierarchyConfig::default().verified());
    h.insert("r", None, ()).await.unwrap();
    h.insert("a", Some("r"), ()).await.unwrap();
    h.insert("b", Some("a"), ()).await.unwrap();
    h.insert("s", None, ()).await.unwrap();
    h.set_parent(&"a", Some("s")).await.unwrap();
    assert_eq!(ids(h.ancestors_of(&"b", false).await.unwrap()), BTreeSet::from(["s", "a"]));
}

// ============================================================================
// 6. Generated ids and concurrent writers
// ============================================================================

#[tokio::test]
async fn test_create_generates_sequential_ids() {
    let h = Hierarchy::<MemoryStore<NodeId>>::open_memory().await.unwrap();
    let root = h.create(None, ()).await.unwrap();
    let child = h.create(Some(root), ()).await.unwrap();
    assert_eq!((root, child), (NodeId(1), NodeId(2)));

    // Generation skips ids taken by explicit inserts.
    h.insert(NodeId(3), None, ()).await.unwrap();
    assert_eq!(h.create(None, ()).await.unwrap(), NodeId(4));
}

#[tokio::test]
async fn test_concurrent_creates_serialize() {
    let h = Arc::new(Hierarchy::<MemoryStore<u64>>::open_memory().await.unwrap());
    let root = h.create(None, ()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let h = Arc::clone(&h);
        handles.push(tokio::spawn(async move { h.create(Some(root), ()).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.descendants_count(&root).await.unwrap(), 16);
    h.check_invariants().await.unwrap();
}

// ============================================================================
// 7. Store failures in the middle of a cascade
// ============================================================================

/// MemoryStore that fails any upsert landing on `fail_on`.
#[derive(Clone, Default)]
struct FailingStore {
    inner: MemoryStore<&'static str>,
    fail_on: Arc<parking_lot::Mutex<Option<&'static str>>>,
}

#[async_trait::async_trait]
impl ClosureStore for FailingStore {
    type Key = &'static str;
    type Payload = ();
    type Tx = MemoryTx<&'static str>;

    async fn shutdown(&self) -> closure_table::Result<()> {
        self.inner.shutdown().await
    }

    async fn begin_tx(&self, mode: TxMode) -> closure_table::Result<Self::Tx> {
        self.inner.begin_tx(mode).await
    }

    async fn commit_tx(&self, tx: Self::Tx) -> closure_table::Result<()> {
        self.inner.commit_tx(tx).await
    }

    async fn rollback_tx(&self, tx: Self::Tx) -> closure_table::Result<()> {
        self.inner.rollback_tx(tx).await
    }

    async fn load_node(&self, tx: &Self::Tx, id: &&'static str) -> closure_table::Result<Option<NodeRecord<&'static str>>> {
        self.inner.load_node(tx, id).await
    }

    async fn insert_node(&self, tx: &mut Self::Tx, record: NodeRecord<&'static str>) -> closure_table::Result<()> {
        self.inner.insert_node(tx, record).await
    }

    async fn update_node(&self, tx: &mut Self::Tx, record: NodeRecord<&'static str>) -> closure_table::Result<()> {
        self.inner.update_node(tx, record).await
    }

    async fn delete_node(&self, tx: &mut Self::Tx, id: &&'static str) -> closure_table::Result<bool> {
        self.inner.delete_node(tx, id).await
    }

    async fn all_nodes(&self, tx: &Self::Tx) -> closure_table::Result<Vec<NodeRecord<&'static str>>> {
        self.inner.all_nodes(tx).await
    }

    async fn load_relationships(
        &self,
        tx: &Self::Tx,
        filter: &RelationshipFilter<&'static str>,
    ) -> closure_table::Result<Vec<ClosureRelationship<&'static str>>> {
        self.inner.load_relationships(tx, filter).await
    }

    async fn upsert_relationships(
        &self,
        tx: &mut Self::Tx,
        rels: Vec<ClosureRelationship<&'static str>>,
    ) -> closure_table::Result<()> {
        let fail_on = *self.fail_on.lock();
        if let Some(target) = fail_on {
            if rels.iter().any(|r| r.descendant_id == target) {
                return Err(Error::StorageError(format!("write to {target} timed out")));
            }
        }
        self.inner.upsert_relationships(tx, rels).await
    }

    async fn delete_relationships(
        &self,
        tx: &mut Self::Tx,
        pairs: &[(&'static str, &'static str)],
    ) -> closure_table::Result<u64> {
        self.inner.delete_relationships(tx, pairs).await
    }

    async fn delete_relationships_touching(&self, tx: &mut Self::Tx, id: &&'static str) -> closure_table::Result<u64> {
        self.inner.delete_relationships_touching(tx, id).await
    }

    async fn node_count(&self, tx: &Self::Tx) -> closure_table::Result<u64> {
        self.inner.node_count(tx).await
    }

    async fn relationship_count(&self, tx: &Self::Tx) -> closure_table::Result<u64> {
        self.inner.relationship_count(tx).await
    }
}

async fn failing_chain() -> (Hierarchy<FailingStore>, FailingStore) {
    let store = FailingStore::default();
    let h = Hierarchy::with_store(store.clone());
    h.insert("root", None, ()).await.unwrap();
    h.insert("a", Some("root"), ()).await.unwrap();
    h.insert("b", Some("a"), ()).await.unwrap();
    h.insert("c", Some("b"), ()).await.unwrap();
    h.insert("x", None, ()).await.unwrap();
    (h, store)
}

#[tokio::test]
async fn test_failed_cascade_rolls_back() {
    let (h, store) = failing_chain().await;
    *store.fail_on.lock() = Some("c");

    assert!(matches!(h.set_parent(&"a", Some("x")).await, Err(Error::StorageError(_))));
    assert_eq!(h.parent_of(&"a").await.unwrap().map(|n| n.id), Some("root"));
    assert_eq!(h.descendants_count(&"x").await.unwrap(), 0);
    h.check_invariants().await.unwrap();
}

#[tokio::test]
async fn test_failed_cascade_poisons_explicit_tx() {
    let (h, store) = failing_chain().await;
    *store.fail_on.lock() = Some("c");

    let mut tx = h.begin().await.unwrap();
    tx.insert("y", None, ()).await.unwrap();
    assert!(matches!(tx.set_parent(&"a", Some("x")).await, Err(Error::StorageError(_))));
    assert!(tx.is_poisoned());
    assert!(matches!(tx.commit().await, Err(Error::TxError(_))));

    // Neither the half-done move nor the earlier insert survived.
    assert!(h.get_node(&"y").await.unwrap().is_none());
    assert_eq!(h.parent_of(&"a").await.unwrap().map(|n| n.id), Some("root"));
    h.check_invariants().await.unwrap();
}
