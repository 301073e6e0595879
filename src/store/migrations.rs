//! Ledger schema, versioned in a `_migrations` table.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; versions start at 1 and have no gaps.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "worker_registration",
        sql: r#"
            CREATE TABLE IF NOT EXISTS registered_worker (
                worker_name TEXT PRIMARY KEY,
                registration_time TEXT NOT NULL,
                worker_kwargs TEXT NOT NULL,
                worker_config_fingerprint TEXT NOT NULL,
                UNIQUE (worker_name, worker_config_fingerprint)
            );

            CREATE TABLE IF NOT EXISTS registered_process (
                worker_name TEXT NOT NULL,
                process_index INTEGER NOT NULL,
                process_name TEXT NOT NULL,
                full_table_name TEXT NOT NULL DEFAULT '',
                job_source_query TEXT,
                invocation_args TEXT NOT NULL DEFAULT '{}',
                process_config_fingerprint TEXT NOT NULL,
                PRIMARY KEY (worker_name, process_index)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "worker_and_error_logs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS "~worker_log" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                process_timestamp TEXT NOT NULL,
                process TEXT NOT NULL,
                worker_name TEXT NOT NULL DEFAULT '',
                host TEXT NOT NULL,
                user TEXT NOT NULL DEFAULT '',
                pid INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_worker_log_timestamp ON "~worker_log"(process_timestamp);
            CREATE INDEX IF NOT EXISTS idx_worker_log_process ON "~worker_log"(process);

            CREATE TABLE IF NOT EXISTS "~error_log" (
                process TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                error_timestamp TEXT NOT NULL,
                key TEXT NOT NULL,
                error_message TEXT NOT NULL DEFAULT '',
                error_stack TEXT,
                host TEXT NOT NULL,
                user TEXT NOT NULL DEFAULT '',
                pid INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (process, key_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_error_log_timestamp ON "~error_log"(error_timestamp);
        "#,
    },
];

/// Bring the ledger schema up to the latest version.
///
/// Each pending migration and its `_migrations` row commit together, so an
/// interrupted upgrade resumes at the failed version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("_migrations: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        return Ok(());
    }

    for migration in pending {
        apply(conn, migration).await?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Ledger migration applied"
        );
    }
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let fail = |e: libsql::Error| {
        DatabaseError::Migration(format!("V{} {}: {e}", migration.version, migration.name))
    };

    let tx = conn.transaction().await.map_err(fail)?;
    tx.execute_batch(migration.sql).await.map_err(fail)?;
    tx.execute(
        "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(fail)?;
    tx.commit().await.map_err(fail)
}

/// Highest applied version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Migration(format!("schema version: {e}"));
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}
