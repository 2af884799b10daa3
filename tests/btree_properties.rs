//! Property tests: random insert/erase interleavings against a model map,
//! with full structural verification after every mutation batch.
//!
//! Keys straddle the fixed key width so a share of every run exercises the
//! extended-key path; the small fanout forces splits, shifts, merges and
//! root collapses within a few dozen operations.

use std::collections::BTreeMap;

use burrowdb::{Btree, InsertMode, PagerOptions, Txn};
use proptest::prelude::*;
use tempfile::tempdir;

#[derive(Debug, Clone)]
enum Op {
    Insert { key: Vec<u8>, record: u64 },
    Erase { key: Vec<u8> },
}

fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    // Few distinct byte values and mixed lengths: collisions are common and
    // lengths past 32 bytes produce extended keys.
    proptest::collection::vec(prop_oneof![Just(b'a'), Just(b'b'), Just(b'c')], 1..48)
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (arb_key(), any::<u64>()).prop_map(|(key, record)| Op::Insert { key, record }),
        arb_key().prop_map(|key| Op::Erase { key }),
    ]
}

fn apply(tree: &mut Btree, model: &mut BTreeMap<Vec<u8>, u64>, op: &Op) {
    match op {
        Op::Insert { key, record } => {
            tree.insert(key, *record, InsertMode::Overwrite).unwrap();
            model.insert(key.clone(), *record);
        }
        Op::Erase { key } => {
            let mut txn = Txn::begin();
            match tree.erase(&mut txn, key) {
                Ok(rec) => {
                    txn.commit(tree.pager_mut()).unwrap();
                    let expected = model.remove(key);
                    assert_eq!(expected, Some(rec.record_id), "erased record mismatch");
                }
                Err(e) => {
                    txn.abort();
                    assert!(burrowdb::is_key_not_found(&e), "unexpected erase error: {e}");
                    assert!(!model.contains_key(key), "tree lost a live key");
                }
            }
        }
    }
}

fn verify(tree: &mut Btree, model: &BTreeMap<Vec<u8>, u64>) {
    let stats = tree.check_integrity().unwrap();
    assert_eq!(stats.key_count, model.len() as u64);

    let extended = model.keys().filter(|k| k.len() > tree.key_size()).count();
    assert_eq!(stats.extended_keys, extended as u64, "live blob count drifted");

    for (key, record) in model {
        assert_eq!(tree.find(key).unwrap(), *record);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_mutations_preserve_every_invariant(ops in proptest::collection::vec(arb_op(), 1..120)) {
        let dir = tempdir().unwrap();
        let mut tree = Btree::create(
            dir.path().join("prop.db"),
            PagerOptions { max_keys: Some(4), ..PagerOptions::default() },
        ).unwrap();
        let mut model = BTreeMap::new();

        for (i, op) in ops.iter().enumerate() {
            apply(&mut tree, &mut model, op);
            // Verifying the whole tree after every step keeps shrunken
            // failures pointed at the exact mutation.
            if i % 8 == 7 {
                verify(&mut tree, &model);
            }
        }
        verify(&mut tree, &model);
    }

    #[test]
    fn draining_the_tree_returns_it_to_a_single_empty_leaf(
        ops in proptest::collection::vec(arb_op(), 1..80)
    ) {
        let dir = tempdir().unwrap();
        let mut tree = Btree::create(
            dir.path().join("drain.db"),
            PagerOptions { max_keys: Some(4), ..PagerOptions::default() },
        ).unwrap();
        let mut model = BTreeMap::new();

        for op in &ops {
            apply(&mut tree, &mut model, op);
        }

        let keys: Vec<Vec<u8>> = model.keys().cloned().collect();
        for key in keys {
            let mut txn = Txn::begin();
            tree.erase(&mut txn, &key).unwrap();
            txn.commit(tree.pager_mut()).unwrap();
            model.remove(&key);
            verify(&mut tree, &model);
        }

        let stats = tree.check_integrity().unwrap();
        prop_assert_eq!(stats.key_count, 0);
        prop_assert_eq!(stats.depth, 1);
        prop_assert_eq!(stats.extended_keys, 0);

        for op in &ops {
            let key = match op {
                Op::Insert { key, .. } | Op::Erase { key } => key,
            };
            prop_assert!(burrowdb::is_key_not_found(&tree.find(key).unwrap_err()));
        }
    }

    #[test]
    fn scans_match_the_model_order(ops in proptest::collection::vec(arb_op(), 1..100)) {
        let dir = tempdir().unwrap();
        let mut tree = Btree::create(
            dir.path().join("scan.db"),
            PagerOptions { max_keys: Some(4), ..PagerOptions::default() },
        ).unwrap();
        let mut model = BTreeMap::new();

        for op in &ops {
            apply(&mut tree, &mut model, op);
        }

        let cursor = tree.cursor();
        let mut scanned = Vec::new();
        if let Ok(rid) = cursor.move_to(&mut tree, burrowdb::CursorMove::First) {
            scanned.push(rid);
            while let Ok(rid) = cursor.move_to(&mut tree, burrowdb::CursorMove::Next) {
                scanned.push(rid);
            }
        }

        let expected: Vec<u64> = model.values().copied().collect();
        prop_assert_eq!(scanned, expected);
    }
}
