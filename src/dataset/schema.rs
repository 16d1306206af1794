//! SQLite schema for the dataset backend

use rusqlite::Connection;

/// Records are stored as JSON objects in their dataset order
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    row_key TEXT PRIMARY KEY,
    position INTEGER NOT NULL,
    fields TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_position ON records(position);

-- Column order of the dataset
CREATE TABLE IF NOT EXISTS columns (
    position INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
"#;

/// Creates the tables if they do not exist
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}
