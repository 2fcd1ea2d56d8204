//! Connection open and initialization: URI building, pragma discipline,
//! schema application, capacity directive.

use log::debug;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};

use super::{SCHEMA, TRIGGERS};
use crate::error::{Error, Result};
use crate::types::{AutoVacuum, InitConnOpts, InitDbOpts, NewConnOpts};

/// Escaped in the URI path so the query part stays unambiguous. Path
/// separators stay as-is.
const PATH_ESCAPES: &AsciiSet = &CONTROLS.add(b' ').add(b'#').add(b'%').add(b'?');

/// `file:<escaped-path>?<query>`. In-memory databases are shared per process
/// so multiple connections can see the same cache.
fn open_uri(opts: &NewConnOpts) -> String {
    let path = if opts.memory {
        ":memory:".to_string()
    } else {
        utf8_percent_encode(&opts.path.to_string_lossy(), PATH_ESCAPES).to_string()
    };
    let query = if opts.memory { "cache=shared" } else { "" };
    // An empty path with just "?" still opens a private temporary database.
    format!("file:{path}?{query}")
}

/// Open a new connection. No internal engine mutex: a connection is
/// single-threaded and callers serialize access.
pub(crate) fn open_conn(opts: &NewConnOpts) -> Result<Connection> {
    let uri = open_uri(opts);
    debug!("opening sqlite connection {uri:?}");
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    Ok(Connection::open_with_flags(uri, flags)?)
}

/// Render a pragma row the way sqlite reports it.
fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(_) => "<blob>".to_string(),
    }
}

/// Read a pragma's current value as text.
fn query_pragma(conn: &Connection, name: &str) -> Result<String> {
    let value: Value = conn.query_row(&format!("pragma {name}"), [], |row| row.get(0))?;
    Ok(value_text(&value))
}

/// Set a pragma, read it back, and fail unless the stored text matches.
fn set_and_verify_pragma(
    conn: &Connection,
    name: &'static str,
    value: impl ToString,
) -> Result<()> {
    let expected = value.to_string();
    conn.execute_batch(&format!("pragma {name}={expected}"))?;
    let actual = query_pragma(conn, name)?;
    if actual != expected {
        return Err(Error::UnexpectedPragmaValue {
            pragma: name,
            expected,
            actual,
        });
    }
    Ok(())
}

fn set_page_size(conn: &Connection, page_size: i64) -> Result<()> {
    if page_size == 0 {
        return Ok(());
    }
    set_and_verify_pragma(conn, "page_size", page_size)
}

/// Apply connection pragmas in the required order.
pub(crate) fn init_conn(conn: &Connection, opts: &InitConnOpts, page_size: i64) -> Result<()> {
    if let Some(sync) = opts.set_synchronous {
        conn.execute_batch(&format!("pragma synchronous={}", sync.as_str()))?;
    }
    // Trimming to capacity cascades deletions that must keep the stored-size
    // counter current, which needs triggers firing triggers, and foreign-key
    // actions tearing down the chunk mapping.
    conn.execute_batch("pragma recursive_triggers=on")?;
    conn.execute_batch("pragma foreign_keys=on")?;
    // Page size has to land before a journal-mode change so WAL adopts it.
    set_page_size(conn, page_size)?;
    if let Some(mode) = &opts.set_journal_mode {
        // The set statement reports the mode actually in effect.
        let actual: String =
            conn.query_row(&format!("pragma journal_mode={mode}"), [], |row| row.get(0))?;
        if actual != *mode {
            return Err(Error::UnexpectedJournalMode { actual });
        }
    }
    if let Some(mode) = &opts.set_locking_mode {
        set_and_verify_pragma(conn, "locking_mode", mode)?;
    }
    if let Some(size) = opts.mmap_size
        && size >= 0
    {
        set_and_verify_pragma(conn, "mmap_size", size)?;
    }
    if let Some(size) = opts.cache_size {
        set_and_verify_pragma(conn, "cache_size", size)?;
    }
    Ok(())
}

/// Create tables and (when `triggers`) the accounting triggers.
///
/// Runs inside an immediate transaction: taking the write lock up front
/// blocks instead of failing with BUSY on a later read-to-write upgrade, and
/// rolls the whole script back on error.
pub fn init_schema(conn: &mut Connection, page_size: i64, triggers: bool) -> Result<()> {
    set_page_size(conn, page_size)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(SCHEMA)?;
    if triggers {
        tx.execute_batch(TRIGGERS)?;
    }
    tx.commit()?;
    Ok(())
}

/// `pragma auto_vacuum` reads back as a numeric mode code.
fn verify_auto_vacuum(conn: &Connection, required: AutoVacuum) -> Result<()> {
    let expected = required.as_code().to_string();
    let actual = query_pragma(conn, "auto_vacuum")?;
    if actual != expected {
        return Err(Error::UnexpectedPragmaValue {
            pragma: "auto_vacuum",
            expected,
            actual,
        });
    }
    Ok(())
}

/// One-time database setup: auto-vacuum, schema, capacity directive.
pub(crate) fn init_database(conn: &mut Connection, opts: &InitDbOpts) -> Result<()> {
    if let Some(mode) = opts.set_auto_vacuum {
        // Has to happen before the journal mode switches to WAL.
        conn.execute_batch(&format!("pragma auto_vacuum={}", mode.as_str()))?;
        if let Some(required) = opts.require_auto_vacuum {
            verify_auto_vacuum(conn, required)?;
        }
    } else if let Some(required) = opts.require_auto_vacuum {
        verify_auto_vacuum(conn, required)?;
    }
    if !opts.dont_init_schema {
        init_schema(conn, opts.page_size, !opts.no_triggers)?;
    }
    if opts.capacity < 0 {
        conn.execute("delete from setting where name='capacity'", [])?;
    } else if opts.capacity > 0 {
        // The primary key replaces on conflict, so this doubles as an upsert.
        conn.execute(
            "insert into setting (name, value) values ('capacity', ?1)",
            [opts.capacity],
        )?;
    }
    Ok(())
}
