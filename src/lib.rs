//! Burrow: a persistent, capacity-bounded, content-keyed blob cache on a
//! single sqlite database file.
//!
//! Values are opaque byte arrays keyed by arbitrary strings, stored as
//! fixed-size chunks with random-access reads and writes over individual
//! values. A configurable byte capacity is enforced declaratively by
//! database triggers that evict least-recently-used keys, so every path that
//! grows the database participates. Long-lived [`PinnedBlob`] handles skip
//! per-call key lookup for hot values.
//!
//! ```no_run
//! let cache = burrow::Cache::new(burrow::NewCacheOpts::memory())?;
//! cache.put("greeting", b"hello")?;
//! let mut buf = [0u8; 5];
//! cache.read_full("greeting", &mut buf)?;
//! assert_eq!(&buf, b"hello");
//! # Ok::<(), burrow::Error>(())
//! ```

pub mod cache;
pub mod error;
pub mod store;
pub mod types;

pub use cache::{Blob, Cache, PinnedBlob};
pub use error::{Error, Result};
pub use store::init_schema;
pub use types::{
    AutoVacuum, DEFAULT_MAX_BLOB_SIZE, InitConnOpts, InitDbOpts, NewCacheOpts, NewConnOpts,
    Synchronous,
};
