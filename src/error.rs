//! Cache error types.

use thiserror::Error;

/// Errors returned by cache operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Key lookup on a missing key.
    #[error("key not found")]
    NotFound,

    /// `pragma journal_mode` reported a different mode than requested.
    #[error("unexpected journal mode {actual:?}")]
    UnexpectedJournalMode { actual: String },

    /// A set-and-verify pragma read back a different value than was set.
    #[error("pragma {pragma} is {actual:?} not {expected:?}")]
    UnexpectedPragmaValue {
        pragma: &'static str,
        expected: String,
        actual: String,
    },

    /// The engine reported concurrent-access contention.
    #[error("database busy")]
    Busy,

    /// The blob handle is aborted (a retarget failed, or its row changed
    /// underneath it); reopen it before further use.
    #[error("blob handle aborted")]
    AbortedBlobHandle,

    /// Transactions cannot run while blob handles may be cached. Open the
    /// cache with `no_cache_blobs` to use transactions.
    #[error("transactions require a cache opened with no_cache_blobs")]
    TxWithCachedBlobs,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// True if the underlying engine reported a BUSY result code.
    pub fn is_busy(&self) -> bool {
        match self {
            Error::Busy => true,
            Error::Sqlite(err) => is_busy_sqlite(err),
            _ => false,
        }
    }
}

/// True if a rusqlite error carries the BUSY result code.
pub(crate) fn is_busy_sqlite(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy)
    )
}

/// Result alias used by the public burrow API.
pub type Result<T> = std::result::Result<T, Error>;
