use rusqlite::{Connection, TransactionBehavior};

use crate::error::{Result, TrackerError};

struct Migration {
    version: &'static str,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "001",
        name: "initial",
        sql: include_str!("migrations/001_initial.sql"),
    },
    Migration {
        version: "002",
        name: "store_revision",
        sql: include_str!("migrations/002_store_revision.sql"),
    },
    Migration {
        version: "003",
        name: "paused_task",
        sql: include_str!("migrations/003_paused_task.sql"),
    },
];

/// Bring the schema up to date. Safe to run on every startup: migrations that
/// are already recorded are skipped, so a second run changes nothing.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )?;

    let applied = get_applied_migrations(conn)?;

    for migration in MIGRATIONS {
        if !applied.iter().any(|v| v == migration.version) {
            apply_migration(conn, migration)?;
        }
    }

    Ok(())
}

fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(versions)
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
    tracing::info!(
        "Applying migration {}: {}",
        migration.version,
        migration.name
    );

    let wrap = |source| TrackerError::Migration {
        version: migration.version,
        source,
    };

    // The migration and its bookkeeping row commit together.
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(wrap)?;
    tx.execute_batch(migration.sql).map_err(wrap)?;
    tx.execute(
        "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)",
        (
            migration.version,
            migration.name,
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(wrap)?;
    tx.commit().map_err(wrap)?;

    tracing::info!("Migration {} applied successfully", migration.version);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                [name],
                |row| row.get(0),
            )
            .unwrap();
        count == 1
    }

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        for table in ["projects", "tasks", "time_entries", "store_meta", "paused_task"] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }

        let versions = get_applied_migrations(&conn).unwrap();
        assert_eq!(versions, vec!["001", "002", "003"]);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        let versions = get_applied_migrations(&conn).unwrap();
        assert_eq!(versions, vec!["001", "002", "003"]);

        let revision: i64 = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = 'revision'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(revision, 0);
    }

    #[test]
    fn test_schema_rejects_second_open_entry() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn.execute_batch(
            "INSERT INTO projects VALUES ('p', 'Proj', 0, 'now', 'now');
             INSERT INTO tasks VALUES ('t', 'p', 'Task', 0, 'now', 'now');
             INSERT INTO time_entries (id, task_id, start_ms, created_at, updated_at)
                 VALUES ('e1', 't', 1000, 'now', 'now');",
        )
        .unwrap();

        let second = conn.execute(
            "INSERT INTO time_entries (id, task_id, start_ms, created_at, updated_at)
             VALUES ('e2', 't', 5000, 'now', 'now')",
            [],
        );
        assert!(second.is_err());

        // Closed entries are unaffected by the open-entry index.
        conn.execute(
            "INSERT INTO time_entries (id, task_id, start_ms, end_ms, created_at, updated_at)
             VALUES ('e3', 't', 100, 200, 'now', 'now')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_schema_rejects_inverted_interval() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn.execute_batch(
            "INSERT INTO projects VALUES ('p', 'Proj', 0, 'now', 'now');
             INSERT INTO tasks VALUES ('t', 'p', 'Task', 0, 'now', 'now');",
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO time_entries (id, task_id, start_ms, end_ms, created_at, updated_at)
             VALUES ('e', 't', 500, 500, 'now', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
