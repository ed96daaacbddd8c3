//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS companies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                fax_number TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS properties (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                room_number TEXT,
                company_id TEXT REFERENCES companies(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_properties_name ON properties(name);

            CREATE TABLE IF NOT EXISTS outbound_faxes (
                id TEXT PRIMARY KEY,
                destination TEXT NOT NULL,
                property_id TEXT,
                company_id TEXT,
                user_id TEXT,
                document TEXT NOT NULL,
                scheduled_at TEXT,
                sent_at TEXT,
                status TEXT NOT NULL,
                retry_enabled INTEGER NOT NULL DEFAULT 0,
                retry_max INTEGER NOT NULL DEFAULT 3,
                retry_interval_secs INTEGER NOT NULL DEFAULT 300,
                retry_count INTEGER NOT NULL DEFAULT 0,
                notes TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_status_scheduled
                ON outbound_faxes(status, scheduled_at);

            CREATE TABLE IF NOT EXISTS inbound_faxes (
                id TEXT PRIMARY KEY,
                sender_number TEXT,
                sender_company TEXT,
                property_name TEXT,
                room_number TEXT,
                raw_text TEXT,
                is_read INTEGER NOT NULL DEFAULT 0,
                document_type TEXT,
                urgency TEXT,
                extracted TEXT,
                next_action TEXT,
                received_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_received ON inbound_faxes(received_at);

            CREATE TABLE IF NOT EXISTS classifications (
                fax_id TEXT PRIMARY KEY REFERENCES inbound_faxes(id) ON DELETE CASCADE,
                document_type TEXT,
                confidence REAL,
                property_id TEXT,
                assigned_user_id TEXT,
                assigned_department TEXT,
                rule_id TEXT,
                classification TEXT,
                property_match TEXT,
                routing TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS routing_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                conditions TEXT NOT NULL DEFAULT '[]',
                target_user_id TEXT,
                target_department TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_routing_rules_priority
                ON routing_rules(active, priority DESC, name);

            CREATE TABLE IF NOT EXISTS usage_counters (
                year INTEGER NOT NULL,
                month INTEGER NOT NULL,
                sent INTEGER NOT NULL DEFAULT 0,
                received INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (year, month)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "dispatch_claims",
        sql: r#"
            ALTER TABLE outbound_faxes ADD COLUMN last_error TEXT;
            ALTER TABLE outbound_faxes ADD COLUMN transport_id TEXT;
            ALTER TABLE outbound_faxes ADD COLUMN claimed_at TEXT;
        "#,
    },
    Migration {
        version: 3,
        name: "triage_stage",
        sql: r#"
            ALTER TABLE inbound_faxes ADD COLUMN stage TEXT NOT NULL DEFAULT 'received';
            CREATE INDEX IF NOT EXISTS idx_inbound_stage ON inbound_faxes(stage);
        "#,
    },
];

/// Run all pending migrations.
///
/// Bring the schema up to the latest version.
///
/// Each pending migration and its `_migrations` row are committed together,
/// so a failed step leaves the database at the previous version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("_migrations table: {e}")))?;

    let from = get_current_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        tracing::debug!(version = from, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        let step = |e: libsql::Error| {
            DatabaseError::Migration(format!("V{} {}: {e}", migration.version, migration.name))
        };
        tracing::info!(version = migration.version, name = migration.name, "Applying migration");

        let tx = conn.transaction().await.map_err(step)?;
        tx.execute_batch(migration.sql).await.map_err(step)?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(step)?;
        tx.commit().await.map_err(step)?;
    }

    let to = get_current_version(conn).await?;
    tracing::info!(from, to, "Database migrated");
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("version query: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("version column: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("version row: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "companies",
            "properties",
            "outbound_faxes",
            "inbound_faxes",
            "classifications",
            "routing_rules",
            "usage_counters",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn later_columns_exist() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO outbound_faxes (id, destination, document, status, created_at, updated_at, last_error, transport_id, claimed_at) VALUES ('o1', '0312345678', '{}', 'scheduled', '2026-01-01', '2026-01-01', 'busy', NULL, NULL)",
            (),
        )
        .await
        .unwrap();

        conn.execute(
            "INSERT INTO inbound_faxes (id, received_at, updated_at) VALUES ('i1', '2026-01-01', '2026-01-01')",
            (),
        )
        .await
        .unwrap();
        let mut rows = conn
            .query("SELECT stage FROM inbound_faxes WHERE id = 'i1'", ())
            .await
            .unwrap();
        let stage: String = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(stage, "received");
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut seen = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let v: i64 = row.get(0).unwrap();
            let n: String = row.get(1).unwrap();
            seen.push((v, n));
        }
        assert_eq!(
            seen,
            vec![
                (1, "initial_schema".to_string()),
                (2, "dispatch_claims".to_string()),
                (3, "triage_stage".to_string()),
            ]
        );
    }
}
