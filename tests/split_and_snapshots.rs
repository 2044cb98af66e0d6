//! Low-fanout split stress and multi-version snapshot/rollback scenarios.

use mvmap::{InMemoryStore, MapBuilder};

#[test]
fn low_fanout_forces_many_splits_and_stays_correct() {
    // keys_per_page = 4 forces a split roughly every 2 inserts once a leaf
    // fills, exercising internal-node splits and root growth repeatedly
    // over a small, easy-to-reason-about fanout.
    let store = InMemoryStore::with_keys_per_page("split-stress", 4);
    let map = MapBuilder::<i32, i32>::new_ordered().open(store, 1, 0).unwrap();

    let mut keys: Vec<i32> = (0..300).collect();
    // Insert out of order so splits happen away from the tree's edges too.
    let (evens, odds): (Vec<i32>, Vec<i32>) = keys.drain(..).partition(|k| k % 2 == 0);
    for k in evens.into_iter().chain(odds) {
        map.put(k, k * 10).unwrap();
    }

    assert_eq!(map.size_as_long(), 300);
    let collected: Vec<(i32, i32)> = map.cursor(None, None, false).collect();
    let expected: Vec<(i32, i32)> = (0..300).map(|k| (k, k * 10)).collect();
    assert_eq!(collected, expected);

    for k in 0..300 {
        assert_eq!(map.get(&k), Some(k * 10));
    }
    assert_eq!(map.get(&300), None);
}

#[test]
fn low_fanout_remove_half_keeps_remainder_ordered() {
    let store = InMemoryStore::with_keys_per_page("split-remove", 4);
    let map = MapBuilder::<i32, i32>::new_ordered().open(store, 1, 0).unwrap();
    for k in 0..200 {
        map.put(k, k).unwrap();
    }
    for k in (0..200).step_by(2) {
        assert_eq!(map.remove(k).unwrap(), Some(k));
    }
    map.check_invariants();
    assert_eq!(map.size_as_long(), 100);
    let collected: Vec<i32> = map.cursor(None, None, false).map(|(k, _)| k).collect();
    let expected: Vec<i32> = (0..200).filter(|k| k % 2 == 1).collect();
    assert_eq!(collected, expected);
}

#[test]
fn open_version_snapshot_is_unaffected_by_later_splits() {
    let store = InMemoryStore::with_keys_per_page("split-snapshot", 4);
    let map = MapBuilder::<i32, i32>::new_ordered().open(store, 1, 0).unwrap();
    for k in 0..20 {
        map.put(k, k).unwrap();
    }
    let early_version = map.get_version();
    let early_size = map.size_as_long();

    for k in 20..500 {
        map.put(k, k).unwrap();
    }

    let snapshot = map.open_version(early_version).unwrap();
    assert_eq!(snapshot.size_as_long(), early_size);
    let snap_collected: Vec<i32> = snapshot.cursor(None, None, false).map(|(k, _)| k).collect();
    assert_eq!(snap_collected, (0..20).collect::<Vec<_>>());

    // The live map kept growing underneath the snapshot.
    assert_eq!(map.size_as_long(), 500);
}

#[test]
fn rollback_after_many_splits_discards_everything_after() {
    let store = InMemoryStore::with_keys_per_page("split-rollback", 4);
    let map = MapBuilder::<i32, i32>::new_ordered().open(store, 1, 0).unwrap();
    for k in 0..50 {
        map.put(k, k).unwrap();
    }
    let checkpoint = map.get_version();
    for k in 50..250 {
        map.put(k, k).unwrap();
    }
    assert_eq!(map.size_as_long(), 250);

    map.rollback_to(checkpoint).unwrap();
    assert_eq!(map.size_as_long(), 50);
    for k in 0..50 {
        assert_eq!(map.get(&k), Some(k));
    }
    for k in 50..250 {
        assert_eq!(map.get(&k), None);
    }
}

#[test]
fn unknown_version_is_reported_once_pruned() {
    let store = InMemoryStore::with_keys_per_page("split-prune", 4);
    let map = MapBuilder::<i32, i32>::new_ordered().open(store, 1, 0).unwrap();
    map.put(1, 1).unwrap();
    let err = map.open_version(9_999).unwrap_err();
    assert!(matches!(err, mvmap::MvError::UnknownVersion { .. }));
}
