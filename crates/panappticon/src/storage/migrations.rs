//! In-place schema migrations.
//!
//! Older databases stored media playback as a `started_at`/`ended_at` pair
//! that was updated when playback ended. The current shape keeps a single
//! `timestamp` per change. Converging is one-way: `ended_at` values are
//! discarded.

use rusqlite::Connection;
use tracing::info;

use super::schema::Table;

/// Column names of `table`, in declaration order.
///
/// # Errors
///
/// Returns an error if the table info cannot be read.
pub fn column_names(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Bring `media_history` to the single-timestamp shape.
///
/// Drops `ended_at` if present and renames `started_at` to `timestamp`.
/// Returns whether anything changed.
///
/// # Errors
///
/// Returns an error if an `ALTER TABLE` fails.
pub fn converge_media_shape(conn: &Connection) -> rusqlite::Result<bool> {
    let table = Table::Media.name();
    let columns = column_names(conn, table)?;
    let has = |name: &str| columns.iter().any(|c| c == name);
    let mut changed = false;

    if has("ended_at") {
        conn.execute_batch(&format!("ALTER TABLE {table} DROP COLUMN ended_at;"))?;
        changed = true;
    }
    if has("started_at") && !has("timestamp") {
        conn.execute_batch(&format!(
            "ALTER TABLE {table} RENAME COLUMN started_at TO timestamp;"
        ))?;
        changed = true;
    }

    if changed {
        info!(table, "Migrated legacy media history to single timestamp");
    }
    Ok(changed)
}
