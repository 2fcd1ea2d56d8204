//! Capacity-trim tests: LRU eviction, access bumping, and the stored-bytes
//! invariants the triggers maintain.

use burrow::{Cache, Error, NewCacheOpts};
use rusqlite::OptionalExtension;
use std::path::Path;

/// Capacity tests manipulate `last_used` from a second connection, so the
/// cache must not sit on cached handles (an open handle pins a read
/// snapshot, and a stale snapshot turns the next write into BUSY).
fn capacity_cache(path: &Path, capacity: i64) -> Cache {
    let mut opts = NewCacheOpts::file(path);
    opts.no_cache_blobs = true;
    opts.init_db.capacity = capacity;
    Cache::new(opts).unwrap()
}

fn raw(path: &Path) -> rusqlite::Connection {
    rusqlite::Connection::open(path).unwrap()
}

fn set_last_used(path: &Path, key: &str, t: i64) {
    raw(path)
        .execute(
            "update keys set last_used=?1 where key=?2",
            rusqlite::params![t, key],
        )
        .unwrap();
}

fn total_blob_bytes(path: &Path) -> i64 {
    raw(path)
        .query_row("select coalesce(sum(length(blob)), 0) from blobs", [], |r| {
            r.get(0)
        })
        .unwrap()
}

/// Per-key lengths match their chunks, chunks tile each value exactly, the
/// running size counter matches reality, and usage fits the capacity.
fn assert_store_invariants(path: &Path, capacity: Option<i64>) {
    let conn = raw(path);
    let keys: Vec<(i64, i64)> = conn
        .prepare("select key_id, length from keys")
        .unwrap()
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    for (key_id, length) in keys {
        let chunks: Vec<(i64, i64)> = conn
            .prepare(
                r#"select offset, length(blob)
                   from "values" join blobs using (blob_id)
                   where value_id=?1 order by offset"#,
            )
            .unwrap()
            .query_map([key_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let mut expect_off = 0;
        for (off, len) in &chunks {
            assert_eq!(*off, expect_off, "gap or overlap in key_id {key_id}");
            expect_off += len;
        }
        assert_eq!(expect_off, length, "length mismatch for key_id {key_id}");
    }
    let total = total_blob_bytes(path);
    let counter: Option<i64> = conn
        .query_row("select value from blob_meta where name='size'", [], |r| {
            r.get(0)
        })
        .optional()
        .unwrap();
    assert_eq!(counter, Some(total), "size counter out of date");
    if let Some(cap) = capacity {
        assert!(total <= cap, "{total} bytes stored over capacity {cap}");
    }
}

#[test]
fn test_capacity_evicts_lru() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let cache = capacity_cache(&path, 100);

    cache.put("a", &[1u8; 60]).unwrap();
    set_last_used(&path, "a", 1_000);
    cache.put("b", &[2u8; 60]).unwrap();

    assert!(matches!(cache.read_all("a"), Err(Error::NotFound)));
    assert_eq!(cache.read_all("b").unwrap(), vec![2u8; 60]);
    assert_store_invariants(&path, Some(100));
}

/// Bumping access on a key protects it: the least recently *used* key goes,
/// not the least recently inserted.
#[test]
fn test_access_bump_protects_recently_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let cache = capacity_cache(&path, 100);

    cache.put("a", &[1u8; 60]).unwrap();
    set_last_used(&path, "a", 1_000);
    cache.put("b", &[2u8; 30]).unwrap();
    set_last_used(&path, "b", 2_000);

    // reading bumps last_used past b's
    let mut buf = [0u8; 60];
    cache.read_full("a", &mut buf).unwrap();

    cache.put("c", &[3u8; 20]).unwrap();

    assert!(matches!(cache.read_all("b"), Err(Error::NotFound)));
    assert_eq!(cache.read_all("a").unwrap(), vec![1u8; 60]);
    assert_eq!(cache.read_all("c").unwrap(), vec![3u8; 20]);
    assert_store_invariants(&path, Some(100));
}

#[test]
fn test_eviction_ties_break_by_key_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let cache = capacity_cache(&path, 100);

    cache.put("first", &[1u8; 40]).unwrap();
    cache.put("second", &[2u8; 40]).unwrap();
    set_last_used(&path, "first", 5_000);
    set_last_used(&path, "second", 5_000);

    cache.put("third", &[3u8; 40]).unwrap();

    // same last_used: the smaller key_id goes first
    assert!(matches!(cache.read_all("first"), Err(Error::NotFound)));
    assert_eq!(cache.read_all("second").unwrap(), vec![2u8; 40]);
    assert_store_invariants(&path, Some(100));
}

#[test]
fn test_access_count_increments() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let cache = capacity_cache(&path, 1_000);

    cache.put("k", &[7u8; 10]).unwrap();
    let mut buf = [0u8; 10];
    cache.read_full("k", &mut buf).unwrap();
    cache.read_full("k", &mut buf).unwrap();

    let count: i64 = raw(&path)
        .query_row("select access_count from keys where key='k'", [], |r| {
            r.get(0)
        })
        .unwrap();
    // one bump per put and per read
    assert_eq!(count, 3);
}

#[test]
fn test_no_capacity_means_unbounded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let cache = capacity_cache(&path, 0);

    for i in 0..8 {
        cache.put(&format!("k{i}"), &[i as u8; 100]).unwrap();
    }
    for i in 0..8 {
        assert_eq!(cache.read_all(&format!("k{i}")).unwrap(), vec![i as u8; 100]);
    }
    assert_store_invariants(&path, None);
}

#[test]
fn test_negative_capacity_removes_limit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    let cache = capacity_cache(&path, 100);
    cache.put("a", &[1u8; 60]).unwrap();
    set_last_used(&path, "a", 1_000);
    cache.put("b", &[2u8; 60]).unwrap();
    assert!(matches!(cache.read_all("a"), Err(Error::NotFound)));
    cache.close().unwrap();

    let cache = capacity_cache(&path, -1);
    let row: Option<i64> = raw(&path)
        .query_row("select value from setting where name='capacity'", [], |r| {
            r.get(0)
        })
        .optional()
        .unwrap();
    assert_eq!(row, None);

    cache.put("c", &[3u8; 200]).unwrap();
    cache.put("d", &[4u8; 200]).unwrap();
    assert_eq!(cache.read_all("b").unwrap(), vec![2u8; 60]);
    assert_eq!(cache.read_all("c").unwrap(), vec![3u8; 200]);
    assert_eq!(cache.read_all("d").unwrap(), vec![4u8; 200]);
    assert_store_invariants(&path, None);
}

/// A churny write mix keeps every bookkeeping invariant intact.
#[test]
fn test_invariants_after_write_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let mut opts = NewCacheOpts::file(&path);
    opts.no_cache_blobs = true;
    opts.max_blob_size = 16;
    opts.init_db.capacity = 500;
    let cache = Cache::new(opts).unwrap();

    for i in 0..12u8 {
        cache.put(&format!("k{i}"), &vec![i; 10 + 9 * i as usize]).unwrap();
    }
    // same-length overwrite, resize, delete
    cache.put("k3", &[0xAA; 37]).unwrap();
    cache.put("k4", &[0xBB; 5]).unwrap();
    cache.delete("k5").unwrap();
    cache.put("k2", &vec![0xCC; 120]).unwrap();

    assert_store_invariants(&path, Some(500));
}
