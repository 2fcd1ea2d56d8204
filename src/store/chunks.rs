//! Chunked value engine: key rows, extent iteration over cached blob
//! handles, access accounting, tags.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, ToSql, params};

use super::handle::BlobHandle;
use crate::error::{Error, Result, is_busy_sqlite};

/// `keys` row columns needed to address a value.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeyCols {
    pub id: i64,
    pub length: i64,
}

/// One connection plus its cached blob handles.
///
/// The handle map is ordered by `(value_id, offset)` so the extent iterator
/// can find the chunk containing an arbitrary byte offset with a single
/// predecessor lookup.
pub(crate) struct CacheConn {
    // Declared before `conn` so handles close before the connection does.
    blobs: BTreeMap<(i64, i64), Arc<BlobHandle>>,
    pub(crate) conn: Connection,
    cache_blobs: bool,
    max_blob_size: i64,
}

impl CacheConn {
    pub fn new(conn: Connection, cache_blobs: bool, max_blob_size: i64) -> Self {
        Self {
            blobs: BTreeMap::new(),
            conn,
            cache_blobs,
            max_blob_size,
        }
    }

    pub fn cache_blobs(&self) -> bool {
        self.cache_blobs
    }

    /// Look up `(key_id, length)` for `key`.
    pub fn open_key(&self, key: &str) -> Result<KeyCols> {
        self.conn
            .query_row(
                "select key_id, length from keys where key=?1",
                [key],
                |row| {
                    Ok(KeyCols {
                        id: row.get(0)?,
                        length: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or(Error::NotFound)
    }

    /// Create `key` as a value of `length` bytes, pre-chunked into zero-filled
    /// blobs. Idempotent: an existing key keeps its id and chunks.
    pub fn create_key(&mut self, key: &str, length: i64) -> Result<i64> {
        match self.open_key(key) {
            Ok(cols) => return Ok(cols.id),
            Err(Error::NotFound) => {}
            Err(err) => return Err(err),
        }
        let key_id: i64 = self.conn.query_row(
            "insert into keys (key, length) values (?1, ?2) returning key_id",
            params![key, length],
            |row| row.get(0),
        )?;
        let mut off = 0;
        while off < length {
            let blob_size = (length - off).min(self.max_blob_size);
            self.conn
                .execute("insert into blobs (blob) values (zeroblob(?1))", [blob_size])?;
            let blob_id = self.conn.last_insert_rowid();
            self.conn.execute(
                r#"insert into "values" (value_id, offset, blob_id) values (?1, ?2, ?3)"#,
                params![key_id, off, blob_id],
            )?;
            off += blob_size;
        }
        Ok(key_id)
    }

    /// Open `key` if it already holds exactly `length` bytes, rebuilding its
    /// chunk layout otherwise.
    pub fn ensure_key(&mut self, key: &str, length: i64) -> Result<i64> {
        match self.open_key(key) {
            Ok(cols) if cols.length == length => Ok(cols.id),
            Ok(_) => {
                self.delete_key(key)?;
                self.create_key(key, length)
            }
            Err(Error::NotFound) => self.create_key(key, length),
            Err(err) => Err(err),
        }
    }

    /// Bump `last_used` and `access_count`. With `ignore_busy`, contention
    /// from a peer connection does not fail the caller.
    pub fn accessed_key(&self, key_id: i64, ignore_busy: bool) -> Result<()> {
        let res = self.conn.execute(
            "update keys \
             set last_used=cast(unixepoch('subsec')*1e3 as integer), \
                 access_count=access_count+1 \
             where key_id=?1",
            [key_id],
        );
        match res {
            Ok(_) => Ok(()),
            Err(err) if ignore_busy && is_busy_sqlite(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Visit each chunk of `value_id` whose extent ends after `start_offset`,
    /// in offset order: the contiguous cached run first, then a database
    /// query for the rest. Partial reads cache only the chunks they touch, so
    /// the cached run may have gaps; reuse stops at the first gap and the
    /// query resumes from there, reusing any chunk it meets that is already
    /// cached. Freshly opened handles are cached for later calls; an insert
    /// that would replace a live entry is corrupted state and faults. The
    /// callback returns whether to keep iterating.
    pub fn iter_blobs<F>(
        &mut self,
        value_id: i64,
        start_offset: i64,
        write: bool,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(i64, &Arc<BlobHandle>) -> Result<bool>,
    {
        let mut start = start_offset;
        let mut more = true;
        // The predecessor of (value_id, start + 1) is the cached chunk that
        // would contain start, if any chunk of this value is cached at all.
        let begin = self
            .blobs
            .range(..=(value_id, start))
            .next_back()
            .map(|(&k, _)| k);
        if let Some(begin) = begin
            && begin.0 == value_id
        {
            for (&(vid, off), handle) in self.blobs.range(begin..) {
                if vid != value_id {
                    break;
                }
                if off > start {
                    // Gap left by an earlier partial read; the query below
                    // resumes from start.
                    break;
                }
                let blob_end = off + handle.size();
                if blob_end > start {
                    more = f(off, handle)?;
                    if !more {
                        return Ok(());
                    }
                    start = blob_end;
                }
            }
        }
        let Self {
            conn,
            blobs,
            cache_blobs,
            ..
        } = self;
        let mut stmt = conn.prepare_cached(
            r#"select offset, blob_id
               from "values" join blobs using (blob_id)
               where value_id=?1 and offset+length(blob) > ?2
               order by offset"#,
        )?;
        let rows = stmt.query_map(params![value_id, start], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            if !more {
                break;
            }
            let (off, blob_id) = row?;
            if *cache_blobs {
                // A chunk past a gap may already be cached from an earlier
                // partial read; reuse it rather than opening a duplicate.
                let cached = match blobs.get(&(value_id, off)) {
                    Some(handle) if !write || handle.writable() => Some(Arc::clone(handle)),
                    Some(_) => {
                        // cached read-only but a write handle is needed
                        blobs.remove(&(value_id, off));
                        None
                    }
                    None => None,
                };
                if let Some(handle) = cached {
                    more = f(off, &handle)?;
                    continue;
                }
            }
            let handle = Arc::new(BlobHandle::open(conn, blob_id, write)?);
            if *cache_blobs {
                let replaced = blobs.insert((value_id, off), Arc::clone(&handle));
                if replaced.is_some() {
                    panic!("blob handle already cached for value {value_id} offset {off}");
                }
            }
            more = f(off, &handle)?;
        }
        Ok(())
    }

    /// Read into `buf` from the value's byte extent starting at `off`.
    /// Returns the bytes read, short when the value ends first.
    pub fn read_value_at(&mut self, value_id: i64, buf: &mut [u8], off: i64) -> Result<usize> {
        assert!(off >= 0, "negative read offset {off}");
        if buf.is_empty() {
            return Ok(0);
        }
        let mut n = 0usize;
        self.iter_blobs(value_id, off, false, |chunk_off, handle| {
            let pos = off + n as i64;
            let rel = pos - chunk_off;
            if rel < 0 {
                panic!("chunk at {chunk_off} does not cover read position {pos} of value {value_id}");
            }
            n += handle.read_at(&mut buf[n..], rel)?;
            Ok(n < buf.len())
        })?;
        Ok(n)
    }

    /// Write `buf` into the value's byte extent starting at `off` through
    /// incremental write handles, leaving chunk boundaries (and any open
    /// handles on the value) intact. Returns the bytes written, short when
    /// the value ends first.
    pub fn write_value_at(&mut self, value_id: i64, buf: &[u8], off: i64) -> Result<usize> {
        assert!(off >= 0, "negative write offset {off}");
        if buf.is_empty() {
            return Ok(0);
        }
        let mut n = 0usize;
        self.iter_blobs(value_id, off, true, |chunk_off, handle| {
            let pos = off + n as i64;
            let rel = pos - chunk_off;
            if rel < 0 {
                panic!("chunk at {chunk_off} does not cover write position {pos} of value {value_id}");
            }
            let avail = (handle.size() - rel).max(0) as usize;
            if avail == 0 {
                return Err(Error::AbortedBlobHandle);
            }
            let m = (buf.len() - n).min(avail);
            handle.write_at(&buf[n..n + m], rel)?;
            n += m;
            Ok(n < buf.len())
        })?;
        Ok(n)
    }

    /// Drop cached read-only handles for a value ahead of writing through it;
    /// the write path reopens those chunks writable.
    pub fn ensure_writable_handles(&mut self, key_id: i64) {
        let has_read_only = self
            .blobs
            .range((key_id, 0)..(key_id + 1, 0))
            .any(|(_, handle)| !handle.writable());
        if has_read_only {
            self.forget_blobs_for_key(key_id);
        }
    }

    /// Detach every cached handle for a value ahead of pinning, returning the
    /// offset-0 handle when one was cached. The pin owns its handle outright,
    /// so a later retarget cannot poison the map, and none of the value's
    /// sibling chunks may stay behind for the extent iterator to trip over.
    pub fn take_pinned_handle(&mut self, key_id: i64) -> Option<Arc<BlobHandle>> {
        let first = self.blobs.remove(&(key_id, 0));
        self.forget_blobs_for_key(key_id);
        first
    }

    /// `blob_id` of the chunk at offset 0, if the value has one.
    pub fn first_chunk_blob_id(&self, key_id: i64) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                r#"select blob_id from "values" where value_id=?1 and offset=0"#,
                [key_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Drop every cached handle for one value, e.g. ahead of deleting its
    /// rows. Handles with no other owner close immediately.
    pub fn forget_blobs_for_key(&mut self, key_id: i64) {
        let cached: Vec<(i64, i64)> = self
            .blobs
            .range((key_id, 0)..(key_id + 1, 0))
            .map(|(&k, _)| k)
            .collect();
        for k in cached {
            self.blobs.remove(&k);
        }
    }

    /// Drop every cached handle.
    pub fn close_blobs(&mut self) {
        self.blobs.clear();
    }

    /// Delete `key` and its chunks. Returns whether the key existed. Cached
    /// handles for the value are forgotten first; the chunk deletes cascade
    /// to the mapping rows, and the key delete mops up the rest.
    pub fn delete_key(&mut self, key: &str) -> Result<bool> {
        let cols = match self.open_key(key) {
            Ok(cols) => cols,
            Err(Error::NotFound) => return Ok(false),
            Err(err) => return Err(err),
        };
        self.forget_blobs_for_key(cols.id);
        self.conn.execute(
            r#"delete from blobs
               where blob_id in (select blob_id from "values" where value_id=?1)"#,
            [cols.id],
        )?;
        self.conn.execute("delete from keys where key_id=?1", [cols.id])?;
        Ok(true)
    }

    /// Attach `name=value` to `key`, replacing any previous value for that
    /// name. The value keeps sqlite's dynamic typing.
    pub fn set_tag<V: ToSql>(&self, key: &str, name: &str, value: V) -> Result<()> {
        let cols = self.open_key(key)?;
        self.conn.execute(
            "insert into tags (key_id, name, value) values (?1, ?2, ?3)",
            params![cols.id, name, value],
        )?;
        Ok(())
    }

    pub fn get_tag(&self, key: &str, name: &str) -> Result<Option<Value>> {
        let cols = self.open_key(key)?;
        Ok(self
            .conn
            .query_row(
                "select value from tags where key_id=?1 and name=?2",
                params![cols.id, name],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Hand the connection back, releasing every cached handle first.
    pub fn into_conn(mut self) -> Connection {
        self.close_blobs();
        let Self { conn, .. } = self;
        conn
    }
}
