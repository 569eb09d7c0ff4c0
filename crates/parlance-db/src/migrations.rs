//! Embedded SQL migration runner.
//!
//! Migration files are compiled into the binary and applied in order on
//! startup. Applied names are recorded in `_parlance_migrations`; a migration
//! and its tracking row commit in the same transaction.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. New migrations are appended here.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001_assistants",
        sql: include_str!("migrations/001_assistants.sql"),
    },
    Migration {
        name: "002_sessions",
        sql: include_str!("migrations/002_sessions.sql"),
    },
    Migration {
        name: "003_chat_messages",
        sql: include_str!("migrations/003_chat_messages.sql"),
    },
    Migration {
        name: "004_session_locks",
        sql: include_str!("migrations/004_session_locks.sql"),
    },
];

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        name: String,
        source: rusqlite::Error,
    },

    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Applies every pending migration and returns how many ran.
///
/// # Errors
///
/// Returns `MigrationError` if a migration fails or the tracking table cannot
/// be queried. A failed migration leaves no partial schema behind.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    apply(conn, MIGRATIONS)
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<usize, MigrationError> {
    let failed = |name: &str| {
        let name = name.to_string();
        move |source: rusqlite::Error| MigrationError::ExecutionFailed { name, source }
    };

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _parlance_migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(failed("_parlance_migrations_bootstrap"))?;

    let mut applied = 0;

    for migration in migrations {
        let done: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _parlance_migrations WHERE name = ?1",
                [migration.name],
                |row| row.get(0),
            )
            .map_err(MigrationError::StateQuery)?;

        if done {
            tracing::debug!(migration = migration.name, "already applied");
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");

        let tx = conn
            .unchecked_transaction()
            .map_err(failed(migration.name))?;
        tx.execute_batch(migration.sql)
            .map_err(failed(migration.name))?;
        tx.execute(
            "INSERT INTO _parlance_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(failed(migration.name))?;
        tx.commit().map_err(failed(migration.name))?;

        applied += 1;
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    #[test]
    fn fresh_database_gets_every_table() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, MIGRATIONS.len());

        for table in ["assistants", "sessions", "chat_messages", "session_locks"] {
            assert!(table_exists(&conn, table), "{table} should exist");
        }
    }

    #[test]
    fn second_run_is_a_no_op() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        run_migrations(&conn).expect("first run");
        let second = run_migrations(&conn).expect("second run");
        assert_eq!(second, 0);
    }

    #[test]
    fn failed_migration_rolls_back_its_schema() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        let broken = [Migration {
            name: "900_broken",
            sql: "CREATE TABLE half_done (id INTEGER PRIMARY KEY);
                  INSERT INTO no_such_table VALUES (1);",
        }];

        match apply(&conn, &broken) {
            Err(MigrationError::ExecutionFailed { name, .. }) => assert_eq!(name, "900_broken"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!table_exists(&conn, "half_done"));
    }

    #[test]
    fn message_role_is_constrained() {
        let conn = Connection::open_in_memory().expect("in-memory db");
        run_migrations(&conn).expect("migrations");

        let err = conn.execute(
            "INSERT INTO chat_messages (message_id, thread_id, role, content)
             VALUES ('m1', 't1', 'robot', 'x')",
            [],
        );
        assert!(err.is_err(), "unknown role must be rejected");
    }
}
