//! Embedded SQL migration runner.
//!
//! Migrations are SQL files embedded at compile time. They run sequentially
//! on startup, tracked by the `_flowbridge_migrations` table. Each migration
//! runs exactly once; if it has already been applied, it is skipped.
//!
//! The runner may be invoked concurrently from several processes or
//! threads sharing one database file. Every migration statement is
//! declarative (`IF NOT EXISTS`), each migration is applied inside an
//! `IMMEDIATE` transaction that re-checks the tracking table after taking
//! the write lock, and the tracking row is written with `INSERT OR IGNORE`.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

/// A single embedded migration.
struct Migration {
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. New migrations are appended here.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001_flow_queue",
        sql: include_str!("migrations/001_flow_queue.sql"),
    },
    Migration {
        name: "002_flow_token_mappings",
        sql: include_str!("migrations/002_flow_token_mappings.sql"),
    },
    Migration {
        name: "003_survey_submissions",
        sql: include_str!("migrations/003_survey_submissions.sql"),
    },
];

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A SQL statement within a migration failed.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        /// The name of the migration that failed.
        name: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// Failed to query migration state.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Runs all pending migrations against the given connection.
///
/// Returns the number of migrations applied by *this* call. A concurrent
/// caller that lost the race for a migration sees it as already applied.
///
/// # Errors
///
/// Returns `MigrationError` if any migration fails to execute or if the
/// migration tracking table cannot be queried.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    run_migrations_from_list(conn, MIGRATIONS)
}

fn run_migrations_from_list(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _flowbridge_migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| MigrationError::ExecutionFailed {
        name: "_flowbridge_migrations_bootstrap".to_string(),
        source: e,
    })?;

    let mut applied = 0;

    for migration in migrations {
        if is_applied(conn, migration.name)? {
            tracing::debug!(
                migration = migration.name,
                "migration already applied, skipping"
            );
            continue;
        }

        let failed = |source| MigrationError::ExecutionFailed {
            name: migration.name.to_string(),
            source,
        };

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(failed)?;

        // Another runner may have applied it while we waited for the lock.
        if is_applied(&tx, migration.name)? {
            tracing::debug!(
                migration = migration.name,
                "migration applied concurrently, skipping"
            );
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");

        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.execute(
            "INSERT OR IGNORE INTO _flowbridge_migrations (name) VALUES (?1)",
            [migration.name],
        )
        .map_err(failed)?;
        tx.commit().map_err(failed)?;

        applied += 1;
    }

    Ok(applied)
}

fn is_applied(conn: &Connection, name: &str) -> Result<bool, MigrationError> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM _flowbridge_migrations WHERE name = ?1",
        [name],
        |row| row.get(0),
    )
    .map_err(MigrationError::StateQuery)
}
