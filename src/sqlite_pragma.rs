//! Shared SQLite PRAGMA setup for every connection the pipeline opens.

use rusqlite::Connection;
use std::time::Duration;

/// Apply the connection PRAGMAs used by writers and the orchestrator
///
/// - WAL journal so the health reader never blocks the writer
/// - synchronous=NORMAL (safe with WAL)
/// - temp_store=MEMORY
/// - busy_timeout so two workers racing for the lease wait instead of failing
/// - wal_autocheckpoint=1000 pages
pub fn apply_optimized_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(Duration::from_millis(5_000))?;
    // journal_mode and wal_autocheckpoint report their new value as a row
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update_and_check(None, "wal_autocheckpoint", 1000, |row| row.get::<_, i64>(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pragmas_applied() {
        let dir = tempdir().unwrap();
        let conn = Connection::open(dir.path().join("pragma.db")).unwrap();
        apply_optimized_pragmas(&conn).unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let checkpoint: i32 = conn
            .query_row("PRAGMA wal_autocheckpoint", [], |row| row.get(0))
            .unwrap();
        assert_eq!(checkpoint, 1000);
    }
}
