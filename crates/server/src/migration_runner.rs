//! Lightweight migration runner for rusqlite.
//!
//! Migrations are compiled into the binary, tracked in `schema_versions`,
//! and any pending ones run in order at startup.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{params, Connection};
use tracing::info;

/// (version, name, sql)
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "001_operations",
        include_str!("../migrations/001_operations.sql"),
    ),
    (
        2,
        "002_operation_outcomes",
        include_str!("../migrations/002_operation_outcomes.sql"),
    ),
];

/// Open (creating if needed) the database and bring its schema up to date.
pub fn open_database(path: &Path) -> anyhow::Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut conn = Connection::open(path)?;
    run_migrations(&mut conn)?;
    Ok(conn)
}

/// Run all pending migrations against the given connection.
pub fn run_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut pending = 0;
    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        // Schema change and version record land together or not at all.
        let tx = conn.transaction()?;
        tx.execute_batch(sql)
            .map_err(|e| anyhow::anyhow!("migration {name} failed: {e}"))?;
        tx.execute(
            "INSERT INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;
        tx.commit()?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "Applied migration"
        );
        pending += 1;
    }

    let total = MIGRATIONS.len();
    info!(
        component = "migrations",
        event = "migrations.complete",
        total = total,
        applied = pending,
        skipped = total - pending,
        "Migration check complete"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("specstream.db");

        let conn = open_database(&path).expect("first open");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |row| row.get(0))
            .expect("count versions");
        assert_eq!(count, MIGRATIONS.len() as i64);
        drop(conn);

        let conn = open_database(&path).expect("second open");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_versions", [], |row| row.get(0))
            .expect("count versions");
        assert_eq!(count, MIGRATIONS.len() as i64);

        conn.execute(
            "INSERT INTO operation_outcomes (operation_id, status, recorded_at) VALUES ('op', 'failed', 'now')",
            [],
        )
        .expect("outcomes table exists");
    }
}
