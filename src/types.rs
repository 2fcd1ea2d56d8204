//! Option types and tuning constants for opening caches.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum bytes stored in a single physical blob chunk (1 MiB).
pub const DEFAULT_MAX_BLOB_SIZE: i64 = 1 << 20;

/// Busy timeout applied to new connections unless overridden.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `pragma synchronous` modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    Off,
    Normal,
    Full,
}

impl Synchronous {
    /// The pragma value as sqlite spells it.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Normal => "normal",
            Self::Full => "full",
        }
    }
}

/// `pragma auto_vacuum` modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoVacuum {
    None,
    Full,
    Incremental,
}

impl AutoVacuum {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }

    /// The numeric mode code `pragma auto_vacuum` reads back.
    pub const fn as_code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Full => 1,
            Self::Incremental => 2,
        }
    }
}

/// How to open the database.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewConnOpts {
    /// Database file path. An empty path opens a private temporary database.
    pub path: PathBuf,
    /// Use a process-shared in-memory database instead of a file.
    pub memory: bool,
}

/// Pragmas applied to every new connection, in a fixed order: synchronous
/// before page size, page size before journal mode.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InitConnOpts {
    /// `pragma synchronous`. `None` keeps the engine default.
    pub set_synchronous: Option<Synchronous>,
    /// `pragma journal_mode`, verified against the mode the engine reports
    /// back (e.g. `wal`, `delete`).
    pub set_journal_mode: Option<String>,
    /// `pragma locking_mode` (`normal` or `exclusive`), set-and-verify.
    pub set_locking_mode: Option<String>,
    /// `pragma mmap_size` in bytes, set-and-verify. `None` or a negative
    /// value keeps the engine default.
    pub mmap_size: Option<i64>,
    /// `pragma cache_size`, set-and-verify.
    pub cache_size: Option<i64>,
}

/// One-time database initialization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InitDbOpts {
    /// `pragma page_size`; 0 keeps the engine default. Applied before any
    /// journal-mode change so WAL adopts it.
    pub page_size: i64,
    /// Skip the schema DDL (the tables already exist).
    pub dont_init_schema: bool,
    /// Skip the capacity/accounting trigger script.
    pub no_triggers: bool,
    /// Total byte capacity across all stored chunks: negative removes the
    /// limit, 0 leaves the stored setting untouched, positive sets it.
    pub capacity: i64,
    /// `pragma auto_vacuum`, applied before any WAL switch.
    pub set_auto_vacuum: Option<AutoVacuum>,
    /// Verify `pragma auto_vacuum` matches this mode, failing otherwise.
    pub require_auto_vacuum: Option<AutoVacuum>,
}

/// Options for [`Cache::new`](crate::Cache::new).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewCacheOpts {
    pub conn: NewConnOpts,
    pub init_conn: InitConnOpts,
    pub init_db: InitDbOpts,
    /// Forbid the in-memory blob-handle map. Required for callers that use
    /// [`Cache::tx`](crate::Cache::tx): open handles hold a read transaction.
    pub no_cache_blobs: bool,
    /// Upper bound on a single physical chunk. Fixed at value creation.
    pub max_blob_size: i64,
    /// Bump `last_used`/`access_count` on pinned-handle reads.
    pub access_on_pinned_read: bool,
    /// Busy timeout for the connection. `None` disables it.
    pub busy_timeout: Option<Duration>,
}

impl Default for NewCacheOpts {
    fn default() -> Self {
        Self {
            conn: NewConnOpts::default(),
            init_conn: InitConnOpts::default(),
            init_db: InitDbOpts::default(),
            no_cache_blobs: false,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            access_on_pinned_read: true,
            busy_timeout: Some(DEFAULT_BUSY_TIMEOUT),
        }
    }
}

impl NewCacheOpts {
    /// A process-shared in-memory cache.
    pub fn memory() -> Self {
        Self {
            conn: NewConnOpts {
                memory: true,
                ..NewConnOpts::default()
            },
            ..Self::default()
        }
    }

    /// A file-backed cache at `path` with WAL journaling and relaxed fsync,
    /// the recommended mode for concurrent readers plus one writer.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            conn: NewConnOpts {
                path: path.into(),
                memory: false,
            },
            init_conn: InitConnOpts {
                set_synchronous: Some(Synchronous::Normal),
                set_journal_mode: Some("wal".to_string()),
                ..InitConnOpts::default()
            },
            ..Self::default()
        }
    }
}
