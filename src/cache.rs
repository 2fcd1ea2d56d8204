//! Public cache surface: keyed reads and writes, pinned handles,
//! transactions.

use std::cell::Cell;
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;
use rusqlite::ToSql;
use rusqlite::types::Value;

use crate::error::{Error, Result};
use crate::store::{BlobHandle, CacheConn, init_conn, init_database, open_conn};
use crate::types::NewCacheOpts;

/// A persistent, capacity-bounded, content-keyed blob cache over one sqlite
/// connection.
///
/// All operations serialize on an internal mutex, so a `Cache` can be shared
/// across threads by reference. Values are split into fixed-size chunks;
/// repeated access to a value reuses open blob handles from an ordered
/// per-connection map unless the cache was opened with `no_cache_blobs`.
pub struct Cache {
    state: Mutex<CacheConn>,
    access_on_pinned_read: bool,
}

impl Cache {
    /// Open (and initialize) a cache per `opts`.
    ///
    /// Database setup runs before connection pragmas so `auto_vacuum` and
    /// `page_size` land before any requested switch to WAL.
    pub fn new(opts: NewCacheOpts) -> Result<Cache> {
        let mut conn = open_conn(&opts.conn)?;
        if let Some(timeout) = opts.busy_timeout {
            conn.busy_timeout(timeout)?;
        }
        init_database(&mut conn, &opts.init_db)?;
        init_conn(&conn, &opts.init_conn, opts.init_db.page_size)?;
        Ok(Cache {
            state: Mutex::new(CacheConn::new(
                conn,
                !opts.no_cache_blobs,
                opts.max_blob_size,
            )),
            access_on_pinned_read: opts.access_on_pinned_read,
        })
    }

    fn state(&self) -> MutexGuard<'_, CacheConn> {
        self.state.lock().expect("cache mutex poisoned")
    }

    fn bump_access(state: &CacheConn, key_id: i64) {
        if let Err(err) = state.accessed_key(key_id, true) {
            warn!("bumping access stats for key_id {key_id}: {err}");
        }
    }

    /// Store `value` under `key`, replacing any previous value. The chunk
    /// layout is rebuilt only when the length changes; same-length overwrites
    /// go through incremental write handles, so open handles on the value
    /// stay valid.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut state = self.state();
        let id = state.ensure_key(key, value.len() as i64)?;
        state.ensure_writable_handles(id);
        let n = state.write_value_at(id, value, 0)?;
        if n != value.len() {
            panic!("short write for {key:?}: {n} of {} bytes", value.len());
        }
        Self::bump_access(&state, id);
        Ok(())
    }

    /// Pre-allocate `key` as a zero-filled value of `length` bytes.
    /// Idempotent: an existing key keeps its id and chunks.
    pub fn create(&self, key: &str, length: i64) -> Result<()> {
        self.state().create_key(key, length)?;
        Ok(())
    }

    /// Read from offset 0 into `buf`. Returns the bytes read, short when the
    /// value is shorter than `buf`.
    pub fn read_full(&self, key: &str, buf: &mut [u8]) -> Result<usize> {
        self.read_at(key, buf, 0)
    }

    /// Random-access read starting at byte `off` of the value.
    pub fn read_at(&self, key: &str, buf: &mut [u8], off: i64) -> Result<usize> {
        let mut state = self.state();
        let cols = state.open_key(key)?;
        let n = state.read_value_at(cols.id, buf, off)?;
        Self::bump_access(&state, cols.id);
        Ok(n)
    }

    /// Read the whole value at `key`.
    pub fn read_all(&self, key: &str) -> Result<Vec<u8>> {
        let mut state = self.state();
        let cols = state.open_key(key)?;
        let mut buf = vec![0u8; cols.length as usize];
        let n = state.read_value_at(cols.id, &mut buf, 0)?;
        if n != buf.len() {
            panic!(
                "value {key:?} shorter than its declared length: {n} of {}",
                buf.len()
            );
        }
        Self::bump_access(&state, cols.id);
        Ok(buf)
    }

    /// Declared length of the value at `key`.
    pub fn length(&self, key: &str) -> Result<i64> {
        Ok(self.state().open_key(key)?.length)
    }

    /// A lazy handle to `key` as a value of exactly `length` bytes.
    pub fn blob_with_length(&self, key: impl Into<String>, length: i64) -> Blob<'_> {
        Blob {
            cache: self,
            name: key.into(),
            length,
        }
    }

    fn write_at_with_length(&self, key: &str, length: i64, buf: &[u8], off: i64) -> Result<usize> {
        let mut state = self.state();
        let id = state.ensure_key(key, length)?;
        state.ensure_writable_handles(id);
        let n = state.write_value_at(id, buf, off)?;
        Self::bump_access(&state, id);
        Ok(n)
    }

    /// Pin the chunk at offset 0 of `key`'s value. The pinned handle skips
    /// key lookup on every subsequent read and write.
    pub fn open_pinned(&self, key: &str) -> Result<PinnedBlob<'_>> {
        let mut state = self.state();
        let cols = state.open_key(key)?;
        let blob_id = state.first_chunk_blob_id(cols.id)?.ok_or(Error::NotFound)?;
        // Detach all of the value's cached handles: the pin owns its handle
        // outright, so a later retarget cannot poison the extent map, and no
        // sibling chunk may stay behind for the iterator to trip over.
        let handle = match state.take_pinned_handle(cols.id) {
            Some(handle) if handle.writable() => handle,
            _ => Arc::new(BlobHandle::open(&state.conn, blob_id, true)?),
        };
        Ok(PinnedBlob {
            cache: self,
            handle,
            key_id: Cell::new(cols.id),
        })
    }

    /// Attach `name=value` to `key`, replacing any previous value for that
    /// name. Tag values keep sqlite's dynamic typing.
    pub fn set_tag<V: ToSql>(&self, key: &str, name: &str, value: V) -> Result<()> {
        self.state().set_tag(key, name, value)
    }

    /// Read a tag back, `None` when the key has no tag of that name.
    pub fn get_tag(&self, key: &str, name: &str) -> Result<Option<Value>> {
        self.state().get_tag(key, name)
    }

    /// Delete `key` and its stored bytes. Returns whether the key existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.state().delete_key(key)
    }

    /// Run `body` inside an immediate transaction. The body returns its
    /// result and whether to commit; `false` or an error rolls back. The body
    /// may call other cache operations (the transaction lock is not held
    /// while it runs).
    ///
    /// Requires a cache opened with `no_cache_blobs`: cached blob handles
    /// hold a read transaction and cannot straddle a write transaction.
    pub fn tx<T>(&self, body: impl FnOnce() -> Result<(T, bool)>) -> Result<T> {
        {
            let state = self.state();
            if state.cache_blobs() {
                return Err(Error::TxWithCachedBlobs);
            }
            state.conn.execute_batch("begin immediate")?;
        }
        let res = body();
        let state = self.state();
        match res {
            Ok((value, true)) => {
                state.conn.execute_batch("commit")?;
                Ok(value)
            }
            Ok((value, false)) => {
                state.conn.execute_batch("rollback")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rb) = state.conn.execute_batch("rollback") {
                    warn!("rolling back failed transaction: {rb}");
                }
                Err(err)
            }
        }
    }

    /// Close the cache, releasing cached blob handles before the connection.
    /// Dropping the cache does the same, minus error reporting.
    pub fn close(self) -> Result<()> {
        let state = self.state.into_inner().expect("cache mutex poisoned");
        state.into_conn().close().map_err(|(_, err)| err.into())
    }
}

/// A lazy handle addressing a value by key: each call resolves chunks through
/// the cache, creating the value at the declared length on first write.
pub struct Blob<'c> {
    cache: &'c Cache,
    name: String,
    length: i64,
}

impl Blob<'_> {
    /// The declared value length this handle was created with.
    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn read_at(&self, buf: &mut [u8], off: i64) -> Result<usize> {
        self.cache.read_at(&self.name, buf, off)
    }

    pub fn write_at(&self, buf: &[u8], off: i64) -> Result<usize> {
        self.cache
            .write_at_with_length(&self.name, self.length, buf, off)
    }
}

/// A caller-held handle on one chunk of a value: cheap repeated reads with no
/// key lookup, retargetable to another key via [`PinnedBlob::reopen`].
pub struct PinnedBlob<'c> {
    cache: &'c Cache,
    handle: Arc<BlobHandle>,
    key_id: Cell<i64>,
}

impl PinnedBlob<'_> {
    /// Current payload size of the pinned chunk. No database round trip.
    pub fn length(&self) -> i64 {
        self.handle.size()
    }

    /// Read under the cache mutex.
    pub fn read_at(&self, buf: &mut [u8], off: i64) -> Result<usize> {
        let state = self.cache.state();
        let n = self.handle.read_at(buf, off)?;
        if self.cache.access_on_pinned_read {
            Cache::bump_access(&state, self.key_id.get());
        }
        Ok(n)
    }

    /// Write without taking the cache mutex: the hot path for a caller that
    /// owns the handle exclusively. The caller must be the connection's only
    /// user while this runs.
    pub fn write_at(&self, buf: &[u8], off: i64) -> Result<usize> {
        self.handle.write_at(buf, off)
    }

    /// Retarget the handle to `new_key`'s first chunk without reopening. On
    /// any failure the handle is aborted and stays unusable until a reopen
    /// succeeds.
    pub fn reopen(&self, new_key: &str) -> Result<()> {
        let state = self.cache.state();
        let cols = match state.open_key(new_key) {
            Ok(cols) => cols,
            Err(err) => {
                self.handle.abort();
                return Err(err);
            }
        };
        let blob_id = match state.first_chunk_blob_id(cols.id) {
            Ok(Some(id)) => id,
            Ok(None) => {
                self.handle.abort();
                return Err(Error::NotFound);
            }
            Err(err) => {
                self.handle.abort();
                return Err(err);
            }
        };
        self.handle.reopen(blob_id)?;
        self.key_id.set(cols.id);
        Ok(())
    }
}
