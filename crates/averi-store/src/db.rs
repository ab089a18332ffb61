use std::path::Path;

use rusqlite::Connection;

use crate::error::StoreError;

/// Number of the newest file in `migrations/`.
pub const SCHEMA_VERSION: i64 = 2;

const MIGRATIONS: [&str; 2] = [
    include_str!("../migrations/001_init.sql"),
    include_str!("../migrations/002_seen_handshakes.sql"),
];

/// Open (or create) the database at `path`.
pub fn open(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    // WAL lets readers proceed while a commit is in flight.
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!(path = %path.display(), journal_mode = %mode, "opened database");
    configure(&conn)?;
    Ok(conn)
}

/// Open a private in-memory database.
pub fn open_in_memory() -> Result<Connection, StoreError> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    Ok(conn)
}

/// Enable foreign keys and bring the schema up to [`SCHEMA_VERSION`].
///
/// Older databases are migrated forward in one transaction. A database
/// written by a newer version is refused rather than wiped: it holds private
/// keys that cannot be recovered.
fn configure(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    let current: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current == SCHEMA_VERSION {
        return Ok(());
    }
    let applied = usize::try_from(current)
        .ok()
        .filter(|&n| n < MIGRATIONS.len())
        .ok_or(StoreError::SchemaVersion {
            found: current,
            expected: SCHEMA_VERSION,
        })?;

    conn.execute_batch("BEGIN")?;
    let migrated = MIGRATIONS[applied..]
        .iter()
        .try_for_each(|sql| conn.execute_batch(sql))
        .and_then(|()| conn.pragma_update(None, "user_version", SCHEMA_VERSION));
    match migrated {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(e) => {
            conn.execute_batch("ROLLBACK")?;
            return Err(e.into());
        }
    }
    tracing::info!(from = current, to = SCHEMA_VERSION, "migrated database schema");
    Ok(())
}

/// Current UNIX timestamp in seconds.
pub fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_gets_schema() {
        let conn = open_in_memory().unwrap();
        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'skipped_message_keys'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn configure_is_idempotent() {
        let conn = open_in_memory().unwrap();
        configure(&conn).unwrap();
    }

    #[test]
    fn first_version_is_migrated_forward() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0]).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        configure(&conn).unwrap();
        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'seen_handshakes'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn foreign_version_is_refused() {
        let conn = open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(matches!(
            configure(&conn),
            Err(StoreError::SchemaVersion { found: 99, .. })
        ));
    }
}
