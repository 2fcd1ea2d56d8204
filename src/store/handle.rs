//! Incremental blob I/O over raw `sqlite3_blob` handles.
//!
//! `rusqlite::blob::Blob` borrows its `Connection`, which rules out keeping
//! open handles in a map owned by the same state as the connection. The cache
//! keeps handles alive for the lifetime of the connection, so this module
//! goes through the FFI layer directly and ties handle lifetime to the cache
//! instead. All unsafe stays behind the safe methods here.

use std::cell::Cell;
use std::ffi::{c_int, c_void};
use std::ptr;

use rusqlite::{Connection, ffi};

use crate::error::{Error, Result};

/// An open incremental-I/O handle on one `blobs.blob` payload.
///
/// Handles are only touched while the owning cache's mutex is held (pinned
/// writes excepted, where the caller guarantees exclusive use of the
/// connection), so the raw pointer never crosses threads unsynchronized.
pub(crate) struct BlobHandle {
    ptr: *mut ffi::sqlite3_blob,
    writable: bool,
    aborted: Cell<bool>,
}

unsafe impl Send for BlobHandle {}
unsafe impl Sync for BlobHandle {}

impl BlobHandle {
    /// Open a handle on `blobs.blob` for the row `blob_id`.
    pub fn open(conn: &Connection, blob_id: i64, write: bool) -> Result<BlobHandle> {
        let db = unsafe { conn.handle() };
        let mut ptr = ptr::null_mut();
        let rc = unsafe {
            ffi::sqlite3_blob_open(
                db,
                c"main".as_ptr(),
                c"blobs".as_ptr(),
                c"blob".as_ptr(),
                blob_id,
                write as c_int,
                &mut ptr,
            )
        };
        if rc != ffi::SQLITE_OK {
            // A failed open may still allocate; close releases it and NULL is
            // a harmless no-op.
            unsafe { ffi::sqlite3_blob_close(ptr) };
            return Err(code_to_error(rc));
        }
        Ok(BlobHandle {
            ptr,
            writable: write,
            aborted: Cell::new(false),
        })
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Mark the handle unusable until a successful [`BlobHandle::reopen`].
    pub fn abort(&self) {
        self.aborted.set(true);
    }

    /// Current payload size in bytes. Zero for an aborted handle.
    pub fn size(&self) -> i64 {
        if self.aborted.get() {
            return 0;
        }
        i64::from(unsafe { ffi::sqlite3_blob_bytes(self.ptr) })
    }

    /// Read up to `buf.len()` bytes at `off` within this chunk. Returns the
    /// bytes read; zero when `off` is at or past the end.
    pub fn read_at(&self, buf: &mut [u8], off: i64) -> Result<usize> {
        if self.aborted.get() {
            return Err(Error::AbortedBlobHandle);
        }
        debug_assert!(off >= 0);
        let size = self.size();
        if off >= size {
            // A zero-length read still reports expiration, so reads past the
            // end of a deleted row's handle don't pass for a silent EOF.
            let rc = unsafe { ffi::sqlite3_blob_read(self.ptr, buf.as_mut_ptr().cast::<c_void>(), 0, 0) };
            return match rc {
                ffi::SQLITE_OK => Ok(0),
                ffi::SQLITE_ABORT => Err(Error::AbortedBlobHandle),
                rc => Err(code_to_error(rc)),
            };
        }
        let n = buf.len().min((size - off) as usize);
        let rc = unsafe {
            ffi::sqlite3_blob_read(self.ptr, buf.as_mut_ptr().cast::<c_void>(), n as c_int, off as c_int)
        };
        match rc {
            ffi::SQLITE_OK => Ok(n),
            ffi::SQLITE_ABORT => Err(Error::AbortedBlobHandle),
            rc => Err(code_to_error(rc)),
        }
    }

    /// Write all of `buf` at `off` within this chunk. Incremental writes
    /// cannot grow a chunk; out-of-range writes are engine errors.
    pub fn write_at(&self, buf: &[u8], off: i64) -> Result<usize> {
        if self.aborted.get() {
            return Err(Error::AbortedBlobHandle);
        }
        debug_assert!(off >= 0);
        let rc = unsafe {
            ffi::sqlite3_blob_write(
                self.ptr,
                buf.as_ptr().cast::<c_void>(),
                buf.len() as c_int,
                off as c_int,
            )
        };
        match rc {
            ffi::SQLITE_OK => Ok(buf.len()),
            ffi::SQLITE_ABORT => Err(Error::AbortedBlobHandle),
            rc => Err(code_to_error(rc)),
        }
    }

    /// Retarget this handle to another `blobs` row without reopening. On
    /// failure the handle is aborted and must be reopened before further use.
    pub fn reopen(&self, blob_id: i64) -> Result<()> {
        let rc = unsafe { ffi::sqlite3_blob_reopen(self.ptr, blob_id) };
        if rc == ffi::SQLITE_OK {
            self.aborted.set(false);
            Ok(())
        } else {
            self.aborted.set(true);
            Err(code_to_error(rc))
        }
    }
}

impl Drop for BlobHandle {
    fn drop(&mut self) {
        unsafe { ffi::sqlite3_blob_close(self.ptr) };
    }
}

/// Map a raw result code onto the cache error taxonomy.
fn code_to_error(rc: c_int) -> Error {
    if rc == ffi::SQLITE_BUSY {
        return Error::Busy;
    }
    Error::Sqlite(rusqlite::Error::SqliteFailure(ffi::Error::new(rc), None))
}
