//! Database schema definitions
//!
//! Each queue lives in its own database file with a single `tasks` table; the
//! docid counter has its own file as well.

/// SQL schema for a queue database
///
/// `seq` is AUTOINCREMENT so arrival positions are never reused, which lets an
/// iterator bound itself by the highest `seq` seen at creation.
pub const QUEUE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    docid INTEGER NOT NULL UNIQUE,
    url TEXT NOT NULL,
    depth INTEGER NOT NULL,
    site_id TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_tried_at TEXT,
    lease_deadline TEXT,
    discovered_at TEXT NOT NULL
);
"#;

/// SQL schema for the docid counter database
pub const DOCID_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS docid_counter (
    site_id TEXT PRIMARY KEY,
    last_issued INTEGER NOT NULL DEFAULT 0
);
"#;

/// Pragmas applied to every store
///
/// `synchronous = FULL` makes a committed put survive power loss, not just a
/// process crash.
pub const STORE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = FULL;
    PRAGMA temp_store = MEMORY;
";

/// Initializes the queue schema
pub fn initialize_queue_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(QUEUE_SCHEMA_SQL)?;
    Ok(())
}

/// Initializes the docid counter schema
pub fn initialize_docid_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(DOCID_SCHEMA_SQL)?;
    Ok(())
}
