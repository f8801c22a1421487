//! Property tests: random insert / move / delete sequences keep the closure
//! consistent, and the in-memory `Forest` and the store-backed `Hierarchy`
//! agree on every answer.

use std::collections::BTreeSet;

use closure_table::{Forest, Hierarchy, MemoryStore};
use proptest::prelude::*;

const POOL: u64 = 10;

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, Option<u64>),
    Move(u64, Option<u64>),
    DeleteSubtree(u64),
}

fn op() -> impl Strategy<Value = Op> {
    let id = 0..POOL;
    let parent = proptest::option::of(0..POOL);
    prop_oneof![
        3 => (id.clone(), parent.clone()).prop_map(|(i, p)| Op::Insert(i, p)),
        3 => (id.clone(), parent).prop_map(|(i, p)| Op::Move(i, p)),
        1 => id.prop_map(Op::DeleteSubtree),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

proptest! {
    #[test]
    fn forest_stays_consistent(ops in proptest::collection::vec(op(), 1..60)) {
        let mut forest: Forest<u64> = Forest::new();
        for op in ops {
            let _ = match op {
                Op::Insert(id, parent) => forest.insert(id, parent, ()).map(|_| ()),
                Op::Move(id, parent) => forest.set_parent(&id, parent).map(|_| ()),
                Op::DeleteSubtree(id) => forest.remove_subtree(&id).map(|_| ()),
            };
            prop_assert!(forest.check_invariants().is_ok());
        }

        for node in forest.nodes() {
            let depth = node.depth().unwrap() as usize;
            prop_assert_eq!(forest.ancestors_count(&node.id).unwrap(), depth);
        }
    }

    #[test]
    fn hierarchy_matches_forest(ops in proptest::collection::vec(op(), 1..40)) {
        let rt = runtime();
        rt.block_on(async {
            let mut forest: Forest<u64> = Forest::new();
            let h = Hierarchy::<MemoryStore<u64>>::open_memory().await.unwrap();

            for op in ops {
                let (expected, actual) = match op.clone() {
                    Op::Insert(id, parent) => (
                        forest.insert(id, parent, ()).is_ok(),
                        h.insert(id, parent, ()).await.is_ok(),
                    ),
                    Op::Move(id, parent) => (
                        forest.set_parent(&id, parent).is_ok(),
                        h.set_parent(&id, parent).await.is_ok(),
                    ),
                    Op::DeleteSubtree(id) => (
                        forest.remove_subtree(&id).is_ok(),
                        h.delete_subtree(&id).await.is_ok(),
                    ),
                };
                assert_eq!(expected, actual, "diverged on {op:?}");
            }

            h.check_invariants().await.unwrap();
            assert_eq!(h.node_count().await.unwrap(), forest.len() as u64);
            for node in forest.nodes() {
                let from_forest: BTreeSet<u64> =
                    forest.ancestors_of(&node.id, true).unwrap().into_iter().map(|n| n.id).collect();
                let from_store: BTreeSet<u64> =
                    h.ancestors_of(&node.id, true).await.unwrap().into_iter().map(|n| n.id).collect();
                assert_eq!(from_forest, from_store);
            }
        });
    }
}
