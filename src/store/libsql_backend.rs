//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written as
//! RFC 3339 with fixed microsecond precision so text comparison orders them.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::{Mutex, MutexGuard};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory::{Company, Property, PropertyRecord};
use crate::error::DatabaseError;
use crate::fax::model::{
    ClassificationRecord, FaxDocument, FaxStatus, InboundFax, OutboundFax, RetryPolicy,
    TriageStage, UsageCounter, UsageKind,
};
use crate::store::migrations;
use crate::store::traits::{Database, PruneReport};
use crate::triage::router::{RouteTarget, RoutingRule};

/// libSQL database backend.
///
/// One connection serves every operation. It sits behind an async mutex so a
/// transaction holds it exclusively: statements from concurrent requests
/// queue instead of joining (or colliding with) the open transaction.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }

    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn parse_optional_uuid(s: Option<String>) -> Option<Uuid> {
    s.filter(|s| !s.is_empty()).and_then(|s| Uuid::parse_str(&s).ok())
}

fn parse_uuid(s: &str, what: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("{what} parse: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_json<T: Serialize>(value: &Option<T>) -> Result<libsql::Value, DatabaseError> {
    match value {
        Some(v) => serde_json::to_string(v)
            .map(libsql::Value::Text)
            .map_err(|e| DatabaseError::Serialization(e.to_string())),
        None => Ok(libsql::Value::Null),
    }
}

fn parse_optional_json<T: DeserializeOwned>(
    s: Option<String>,
    what: &str,
) -> Result<Option<T>, DatabaseError> {
    match s.filter(|s| !s.is_empty()) {
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}"))),
        None => Ok(None),
    }
}

/// Escape `%`, `_` and `\` for a LIKE pattern with `ESCAPE '\'`.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

const OUTBOUND_COLUMNS: &str = "id, destination, property_id, company_id, user_id, document, scheduled_at, sent_at, status, retry_enabled, retry_max, retry_interval_secs, retry_count, notes, last_error, transport_id, claimed_at, created_at, updated_at";

const INBOUND_COLUMNS: &str = "id, sender_number, sender_company, property_name, room_number, raw_text, is_read, document_type, urgency, extracted, next_action, stage, received_at, updated_at";

const CLASSIFICATION_COLUMNS: &str = "fax_id, classification, property_match, routing, updated_at";

const RULE_COLUMNS: &str =
    "id, name, priority, active, conditions, target_user_id, target_department, created_at, updated_at";

const PROPERTY_SELECT: &str = "SELECT p.id, p.name, p.room_number, p.company_id, c.name FROM properties p LEFT JOIN companies c ON c.id = p.company_id";

/// Map a libsql Row to an OutboundFax. Column order matches OUTBOUND_COLUMNS.
fn row_to_outbound(row: &libsql::Row) -> Result<OutboundFax, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("outbound.id: {e}")))?;
    let destination: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("outbound.destination: {e}")))?;

    let document_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("outbound.document: {e}")))?;
    let document: FaxDocument = serde_json::from_str(&document_str)
        .map_err(|e| DatabaseError::Serialization(format!("outbound.document: {e}")))?;

    let status_str: String = row
        .get(8)
        .map_err(|e| DatabaseError::Query(format!("outbound.status: {e}")))?;
    let status: FaxStatus = status_str.parse().map_err(DatabaseError::Serialization)?;

    let retry = RetryPolicy {
        enabled: row.get::<i64>(9).unwrap_or(0) != 0,
        max_retries: row.get::<i64>(10).unwrap_or(0).max(0) as u32,
        interval_secs: row.get::<i64>(11).unwrap_or(0).max(0) as u64,
    };

    let created_str: String = row
        .get(17)
        .map_err(|e| DatabaseError::Query(format!("outbound.created_at: {e}")))?;
    let updated_str: String = row
        .get(18)
        .map_err(|e| DatabaseError::Query(format!("outbound.updated_at: {e}")))?;

    Ok(OutboundFax {
        id: parse_uuid(&id_str, "outbound.id")?,
        destination,
        property_id: parse_optional_uuid(row.get(2).ok()),
        company_id: parse_optional_uuid(row.get(3).ok()),
        user_id: row.get(4).ok(),
        document,
        scheduled_at: parse_optional_datetime(row.get(6).ok()),
        sent_at: parse_optional_datetime(row.get(7).ok()),
        status,
        retry,
        retry_count: row.get::<i64>(12).unwrap_or(0).max(0) as u32,
        notes: row.get(13).ok(),
        last_error: row.get(14).ok(),
        transport_id: row.get(15).ok(),
        claimed_at: parse_optional_datetime(row.get(16).ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to an InboundFax. Column order matches INBOUND_COLUMNS.
fn row_to_inbound(row: &libsql::Row) -> Result<InboundFax, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("inbound.id: {e}")))?;

    let document_type = row
        .get::<String>(7)
        .ok()
        .and_then(|s| s.parse().ok());
    let urgency = row
        .get::<String>(8)
        .ok()
        .and_then(|s| s.parse().ok());
    let extracted = parse_optional_json(row.get(9).ok(), "inbound.extracted")?;

    let stage: TriageStage = row
        .get::<String>(11)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(TriageStage::Received);

    let received_str: String = row
        .get(12)
        .map_err(|e| DatabaseError::Query(format!("inbound.received_at: {e}")))?;
    let updated_str: String = row
        .get(13)
        .map_err(|e| DatabaseError::Query(format!("inbound.updated_at: {e}")))?;

    Ok(InboundFax {
        id: parse_uuid(&id_str, "inbound.id")?,
        sender_number: row.get(1).ok(),
        sender_company: row.get(2).ok(),
        property_name: row.get(3).ok(),
        room_number: row.get(4).ok(),
        raw_text: row.get(5).ok(),
        read: row.get::<i64>(6).unwrap_or(0) != 0,
        document_type,
        urgency,
        extracted,
        next_action: row.get(10).ok(),
        stage,
        received_at: parse_datetime(&received_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_classification(row: &libsql::Row) -> Result<ClassificationRecord, DatabaseError> {
    let fax_id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("classification.fax_id: {e}")))?;
    let updated_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("classification.updated_at: {e}")))?;

    Ok(ClassificationRecord {
        fax_id: parse_uuid(&fax_id, "classification.fax_id")?,
        classification: parse_optional_json(row.get(1).ok(), "classification.classification")?,
        property_match: parse_optional_json(row.get(2).ok(), "classification.property_match")?,
        routing: parse_optional_json(row.get(3).ok(), "classification.routing")?,
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a RoutingRule. Fails when the stored conditions don't parse.
fn row_to_rule(row: &libsql::Row) -> Result<RoutingRule, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("rule.id: {e}")))?;
    let name: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("rule.name: {e}")))?;
    let conditions_str: String = row.get(4).unwrap_or_else(|_| "[]".into());
    let conditions = serde_json::from_str(&conditions_str)
        .map_err(|e| DatabaseError::Serialization(format!("rule '{name}' conditions: {e}")))?;
    let created_str: String = row.get(7).unwrap_or_default();
    let updated_str: String = row.get(8).unwrap_or_default();

    Ok(RoutingRule {
        id: parse_uuid(&id_str, "rule.id")?,
        name,
        priority: row.get(2).unwrap_or(0),
        active: row.get::<i64>(3).unwrap_or(1) != 0,
        conditions,
        target: RouteTarget {
            user_id: row.get(5).ok(),
            department: row.get(6).ok(),
        },
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_property_record(row: &libsql::Row) -> Result<PropertyRecord, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("property.id: {e}")))?;
    Ok(PropertyRecord {
        id: parse_uuid(&id_str, "property.id")?,
        name: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("property.name: {e}")))?,
        room_number: row.get(2).ok(),
        company_id: parse_optional_uuid(row.get(3).ok()),
        company_name: row.get(4).ok(),
    })
}

fn row_to_company(row: &libsql::Row) -> Result<Company, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("company.id: {e}")))?;
    let created_str: String = row.get(3).unwrap_or_default();
    Ok(Company {
        id: parse_uuid(&id_str, "company.id")?,
        name: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("company.name: {e}")))?,
        fax_number: row.get(2).ok(),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        migrations::run_migrations(&conn).await
    }

    // ── Outbound ────────────────────────────────────────────────────

    async fn insert_outbound(&self, fax: &OutboundFax) -> Result<(), DatabaseError> {
        let document = serde_json::to_string(&fax.document)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .await
            .execute(
                &format!(
                    "INSERT INTO outbound_faxes ({OUTBOUND_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
                ),
                params![
                    fax.id.to_string(),
                    fax.destination.clone(),
                    opt_uuid(fax.property_id),
                    opt_uuid(fax.company_id),
                    opt_text(fax.user_id.as_deref()),
                    document,
                    opt_ts(fax.scheduled_at),
                    opt_ts(fax.sent_at),
                    fax.status.as_str(),
                    fax.retry.enabled as i64,
                    fax.retry.max_retries as i64,
                    fax.retry.interval_secs as i64,
                    fax.retry_count as i64,
                    opt_text(fax.notes.as_deref()),
                    opt_text(fax.last_error.as_deref()),
                    opt_text(fax.transport_id.as_deref()),
                    opt_ts(fax.claimed_at),
                    ts(fax.created_at),
                    ts(fax.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_outbound: {e}")))?;

        debug!(fax_id = %fax.id, status = %fax.status, "Outbound fax inserted into DB");
        Ok(())
    }

    async fn get_outbound(&self, id: Uuid) -> Result<Option<OutboundFax>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {OUTBOUND_COLUMNS} FROM outbound_faxes WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_outbound: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_outbound(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_outbound: {e}"))),
        }
    }

    async fn update_outbound(
        &self,
        fax: &OutboundFax,
        expected: FaxStatus,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .await
            .execute(
                "UPDATE outbound_faxes SET status = ?1, scheduled_at = ?2, notes = ?3, user_id = ?4, updated_at = ?5 WHERE id = ?6 AND status = ?7",
                params![
                    fax.status.as_str(),
                    opt_ts(fax.scheduled_at),
                    opt_text(fax.notes.as_deref()),
                    opt_text(fax.user_id.as_deref()),
                    ts(fax.updated_at),
                    fax.id.to_string(),
                    expected.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_outbound: {e}")))?;

        debug!(fax_id = %fax.id, status = %fax.status, updated = count == 1, "Outbound fax update attempted");
        Ok(count == 1)
    }

    async fn list_due_outbound(&self, now: DateTime<Utc>) -> Result<Vec<OutboundFax>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {OUTBOUND_COLUMNS} FROM outbound_faxes WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?1 ORDER BY scheduled_at ASC, created_at ASC"
                ),
                params![ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_outbound: {e}")))?;

        let mut faxes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_outbound: {e}")))?
        {
            match row_to_outbound(&row) {
                Ok(fax) => faxes.push(fax),
                Err(e) => warn!("Skipping due outbound fax row: {e}"),
            }
        }
        Ok(faxes)
    }

    async fn count_due_outbound(&self, now: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM outbound_faxes WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?1",
                params![ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_due_outbound: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("count_due_outbound: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_due_outbound: {e}"))),
        }
    }

    async fn claim_outbound(
        &self,
        id: Uuid,
        from: FaxStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .await
            .execute(
                "UPDATE outbound_faxes SET status = 'in_progress', claimed_at = ?1, updated_at = ?1 WHERE id = ?2 AND status = ?3",
                params![ts(now), id.to_string(), from.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_outbound: {e}")))?;

        debug!(fax_id = %id, from = %from, claimed = count == 1, "Outbound claim attempted");
        Ok(count == 1)
    }

    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let now = ts(Utc::now());
        let count = self
            .conn()
            .await
            .execute(
                "UPDATE outbound_faxes SET status = 'scheduled', scheduled_at = COALESCE(scheduled_at, ?2), claimed_at = NULL, updated_at = ?2 WHERE status = 'in_progress' AND claimed_at IS NOT NULL AND claimed_at < ?1",
                params![ts(claimed_before), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_stale_claims: {e}")))?;

        if count > 0 {
            warn!(count, "Released stale outbound claims");
        }
        Ok(count as usize)
    }

    async fn mark_outbound_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
        transport_id: &str,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .await
            .execute(
                "UPDATE outbound_faxes SET status = 'success', sent_at = ?1, transport_id = ?2, last_error = NULL, claimed_at = NULL, updated_at = ?1 WHERE id = ?3",
                params![ts(sent_at), transport_id, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_outbound_sent: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::not_found("outbound_fax", id));
        }
        Ok(())
    }

    async fn reschedule_outbound(
        &self,
        id: Uuid,
        retry_count: u32,
        next_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .await
            .execute(
                "UPDATE outbound_faxes SET status = 'scheduled', retry_count = ?1, scheduled_at = ?2, last_error = ?3, claimed_at = NULL, updated_at = ?4 WHERE id = ?5",
                params![
                    retry_count as i64,
                    ts(next_at),
                    error,
                    ts(Utc::now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reschedule_outbound: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::not_found("outbound_fax", id));
        }
        Ok(())
    }

    async fn mark_outbound_failed(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .await
            .execute(
                "UPDATE outbound_faxes SET status = 'failed', last_error = ?1, claimed_at = NULL, updated_at = ?2 WHERE id = ?3",
                params![error, ts(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_outbound_failed: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::not_found("outbound_fax", id));
        }
        Ok(())
    }

    // ── Inbound ─────────────────────────────────────────────────────

    async fn insert_inbound(&self, fax: &InboundFax) -> Result<(), DatabaseError> {
        self.conn()
            .await
            .execute(
                &format!(
                    "INSERT INTO inbound_faxes ({INBOUND_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    fax.id.to_string(),
                    opt_text(fax.sender_number.as_deref()),
                    opt_text(fax.sender_company.as_deref()),
                    opt_text(fax.property_name.as_deref()),
                    opt_text(fax.room_number.as_deref()),
                    opt_text(fax.raw_text.as_deref()),
                    fax.read as i64,
                    opt_text(fax.document_type.map(|d| d.as_str())),
                    opt_text(fax.urgency.map(|u| u.as_str())),
                    opt_json(&fax.extracted)?,
                    opt_text(fax.next_action.as_deref()),
                    fax.stage.as_str(),
                    ts(fax.received_at),
                    ts(fax.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_inbound: {e}")))?;

        debug!(fax_id = %fax.id, "Inbound fax inserted into DB");
        Ok(())
    }

    async fn get_inbound(&self, id: Uuid) -> Result<Option<InboundFax>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {INBOUND_COLUMNS} FROM inbound_faxes WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_inbound: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_inbound(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_inbound: {e}"))),
        }
    }

    async fn set_inbound_read(&self, id: Uuid, read: bool) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .await
            .execute(
                "UPDATE inbound_faxes SET is_read = ?1, updated_at = ?2 WHERE id = ?3",
                params![read as i64, ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_inbound_read: {e}")))?;
        Ok(count > 0)
    }

    async fn save_triage_step(
        &self,
        fax: &InboundFax,
        record: &ClassificationRecord,
    ) -> Result<(), DatabaseError> {
        let extracted = opt_json(&fax.extracted)?;
        let classification = opt_json(&record.classification)?;
        let property_match = opt_json(&record.property_match)?;
        let routing = opt_json(&record.routing)?;

        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("save_triage_step begin: {e}")))?;

        let count = tx
            .execute(
                "UPDATE inbound_faxes SET raw_text = ?10, property_name = ?1, room_number = ?2, document_type = ?3, urgency = ?4, extracted = ?5, next_action = ?6, stage = ?7, updated_at = ?8 WHERE id = ?9",
                params![
                    opt_text(fax.property_name.as_deref()),
                    opt_text(fax.room_number.as_deref()),
                    opt_text(fax.document_type.map(|d| d.as_str())),
                    opt_text(fax.urgency.map(|u| u.as_str())),
                    extracted,
                    opt_text(fax.next_action.as_deref()),
                    fax.stage.as_str(),
                    ts(fax.updated_at),
                    fax.id.to_string(),
                    opt_text(fax.raw_text.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_triage_step fax: {e}")))?;

        if count == 0 {
            // Dropping the transaction rolls it back.
            return Err(DatabaseError::not_found("inbound_fax", fax.id));
        }

        let routing_ref = record.routing.as_ref();
        tx.execute(
            "INSERT INTO classifications (fax_id, document_type, confidence, property_id, assigned_user_id, assigned_department, rule_id, classification, property_match, routing, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(fax_id) DO UPDATE SET
                document_type = excluded.document_type,
                confidence = excluded.confidence,
                property_id = excluded.property_id,
                assigned_user_id = excluded.assigned_user_id,
                assigned_department = excluded.assigned_department,
                rule_id = excluded.rule_id,
                classification = excluded.classification,
                property_match = excluded.property_match,
                routing = excluded.routing,
                updated_at = excluded.updated_at",
            params![
                record.fax_id.to_string(),
                opt_text(record.document_type().map(|d| d.as_str())),
                match &record.classification {
                    Some(c) => libsql::Value::Real(c.confidence),
                    None => libsql::Value::Null,
                },
                opt_uuid(record.property_id()),
                opt_text(routing_ref.and_then(|r| r.user_id.as_deref())),
                opt_text(routing_ref.and_then(|r| r.department.as_deref())),
                opt_uuid(routing_ref.and_then(|r| r.rule_id)),
                classification,
                property_match,
                routing,
                ts(record.updated_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_triage_step classification: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("save_triage_step commit: {e}")))?;

        debug!(fax_id = %fax.id, stage = %fax.stage, "Triage step persisted");
        Ok(())
    }

    async fn get_classification(
        &self,
        fax_id: Uuid,
    ) -> Result<Option<ClassificationRecord>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {CLASSIFICATION_COLUMNS} FROM classifications WHERE fax_id = ?1"),
                params![fax_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_classification: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_classification(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_classification: {e}"))),
        }
    }

    // ── Routing rules ───────────────────────────────────────────────

    async fn insert_rule(&self, rule: &RoutingRule) -> Result<(), DatabaseError> {
        let conditions = serde_json::to_string(&rule.conditions)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .await
            .execute(
                &format!("INSERT INTO routing_rules ({RULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    rule.id.to_string(),
                    rule.name.clone(),
                    rule.priority,
                    rule.active as i64,
                    conditions,
                    opt_text(rule.target.user_id.as_deref()),
                    opt_text(rule.target.department.as_deref()),
                    ts(rule.created_at),
                    ts(rule.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_rule: {e}")))?;

        info!(rule_id = %rule.id, name = %rule.name, priority = rule.priority, "Routing rule created");
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<RoutingRule>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM routing_rules WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_rule: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_rule(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_rule: {e}"))),
        }
    }

    async fn list_rules(&self) -> Result<Vec<RoutingRule>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM routing_rules ORDER BY priority DESC, name ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules: {e}")))?
        {
            match row_to_rule(&row) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("Skipping routing rule row: {e}"),
            }
        }
        Ok(rules)
    }

    async fn set_rule_active(&self, id: Uuid, active: bool) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .await
            .execute(
                "UPDATE routing_rules SET active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active as i64, ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_rule_active: {e}")))?;
        Ok(count > 0)
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .await
            .execute(
                "DELETE FROM routing_rules WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;
        Ok(count > 0)
    }

    // ── Address book ────────────────────────────────────────────────

    async fn insert_company(&self, company: &Company) -> Result<(), DatabaseError> {
        self.conn()
            .await
            .execute(
                "INSERT INTO companies (id, name, fax_number, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    company.id.to_string(),
                    company.name.clone(),
                    opt_text(company.fax_number.as_deref()),
                    ts(company.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_company: {e}")))?;
        Ok(())
    }

    async fn list_companies(&self) -> Result<Vec<Company>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT id, name, fax_number, created_at FROM companies ORDER BY name ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_companies: {e}")))?;

        let mut companies = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_companies: {e}")))?
        {
            match row_to_company(&row) {
                Ok(c) => companies.push(c),
                Err(e) => warn!("Skipping company row: {e}"),
            }
        }
        Ok(companies)
    }

    async fn insert_property(&self, property: &Property) -> Result<(), DatabaseError> {
        self.conn()
            .await
            .execute(
                "INSERT INTO properties (id, name, room_number, company_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    property.id.to_string(),
                    property.name.clone(),
                    opt_text(property.room_number.as_deref()),
                    opt_uuid(property.company_id),
                    ts(property.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_property: {e}")))?;
        Ok(())
    }

    async fn list_properties(&self) -> Result<Vec<PropertyRecord>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("{PROPERTY_SELECT} ORDER BY p.name ASC, p.room_number ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_properties: {e}")))?;

        let mut properties = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_properties: {e}")))?
        {
            match row_to_property_record(&row) {
                Ok(p) => properties.push(p),
                Err(e) => warn!("Skipping property row: {e}"),
            }
        }
        Ok(properties)
    }

    async fn search_properties(
        &self,
        name_fragment: &str,
    ) -> Result<Vec<PropertyRecord>, DatabaseError> {
        let pattern = format!("%{}%", escape_like(name_fragment.trim()));
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "{PROPERTY_SELECT} WHERE p.name LIKE ?1 ESCAPE '\\' ORDER BY p.name ASC, p.room_number ASC"
                ),
                params![pattern],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("search_properties: {e}")))?;

        let mut properties = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("search_properties: {e}")))?
        {
            match row_to_property_record(&row) {
                Ok(p) => properties.push(p),
                Err(e) => warn!("Skipping property row: {e}"),
            }
        }
        Ok(properties)
    }

    // ── Usage & retention ───────────────────────────────────────────

    async fn increment_usage(
        &self,
        kind: UsageKind,
        year: i32,
        month: u32,
    ) -> Result<(), DatabaseError> {
        let (sent, received): (i64, i64) = match kind {
            UsageKind::Sent => (1, 0),
            UsageKind::Received => (0, 1),
        };
        self.conn()
            .await
            .execute(
                "INSERT INTO usage_counters (year, month, sent, received) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(year, month) DO UPDATE SET
                    sent = sent + excluded.sent,
                    received = received + excluded.received",
                params![year as i64, month as i64, sent, received],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_usage: {e}")))?;
        Ok(())
    }

    async fn get_usage(&self, year: i32, month: u32) -> Result<UsageCounter, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT sent, received FROM usage_counters WHERE year = ?1 AND month = ?2",
                params![year as i64, month as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_usage: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(UsageCounter {
                year,
                month,
                sent: row.get(0).unwrap_or(0),
                received: row.get(1).unwrap_or(0),
            }),
            Ok(None) => Ok(UsageCounter::empty(year, month)),
            Err(e) => Err(DatabaseError::Query(format!("get_usage: {e}"))),
        }
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, DatabaseError> {
        let cutoff = ts(cutoff);
        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("prune begin: {e}")))?;

        let outbound = tx
            .execute(
                "DELETE FROM outbound_faxes WHERE status IN ('success', 'failed') AND updated_at < ?1",
                params![cutoff.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune outbound: {e}")))?;

        tx.execute(
            "DELETE FROM classifications WHERE fax_id IN (SELECT id FROM inbound_faxes WHERE updated_at < ?1)",
            params![cutoff.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("prune classifications: {e}")))?;

        let inbound = tx
            .execute(
                "DELETE FROM inbound_faxes WHERE updated_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune inbound: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("prune commit: {e}")))?;

        let report = PruneReport {
            outbound: outbound as usize,
            inbound: inbound as usize,
        };
        if report.outbound + report.inbound > 0 {
            info!(outbound = report.outbound, inbound = report.inbound, "Pruned old faxes from DB");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::fax::model::{NewInboundFax, NewOutboundFax};
    use crate::triage::classifier::{DocumentClassifier, ClassifyMetadata, DocumentType};
    use crate::triage::router::RuleCondition;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_outbound(scheduled_at: Option<DateTime<Utc>>) -> OutboundFax {
        let mut req = NewOutboundFax::new(
            "03-1234-5678",
            FaxDocument {
                title: "物件確認".into(),
                body: "空室状況のご確認をお願いします。".into(),
                fields: vec![("物件名".into(), "サンハイツ".into())],
            },
        )
        .with_retry(RetryPolicy::new(3, 60));
        req.scheduled_at = scheduled_at;
        req.into_fax(Utc::now())
    }

    // ── Outbound tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn outbound_insert_and_get() {
        let db = test_db().await;
        let fax = make_outbound(Some(Utc::now()));
        db.insert_outbound(&fax).await.unwrap();

        let fetched = db.get_outbound(fax.id).await.unwrap().unwrap();
        assert_eq!(fetched.destination, "03-1234-5678");
        assert_eq!(fetched.status, FaxStatus::Scheduled);
        assert_eq!(fetched.document, fax.document);
        assert_eq!(fetched.retry, RetryPolicy::new(3, 60));
        assert_eq!(fetched.retry_count, 0);
        assert!(db.get_outbound(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_list_filters_by_status_and_time() {
        let db = test_db().await;
        let now = Utc::now();
        let older = make_outbound(Some(now - Duration::minutes(10)));
        let newer = make_outbound(Some(now - Duration::minutes(1)));
        let future = make_outbound(Some(now + Duration::minutes(5)));
        let pending = make_outbound(None);
        for fax in [&newer, &future, &older, &pending] {
            db.insert_outbound(fax).await.unwrap();
        }

        let due = db.list_due_outbound(now).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
        assert_eq!(db.count_due_outbound(now).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn claim_is_compare_and_swap() {
        let db = test_db().await;
        let now = Utc::now();
        let fax = make_outbound(Some(now));
        db.insert_outbound(&fax).await.unwrap();

        assert!(db.claim_outbound(fax.id, FaxStatus::Scheduled, now).await.unwrap());
        assert!(!db.claim_outbound(fax.id, FaxStatus::Scheduled, now).await.unwrap());

        let claimed = db.get_outbound(fax.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, FaxStatus::InProgress);
        assert!(claimed.claimed_at.is_some());
        assert_eq!(db.count_due_outbound(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_claims_are_released() {
        let db = test_db().await;
        let now = Utc::now();
        let stale = make_outbound(Some(now - Duration::hours(1)));
        let fresh = make_outbound(Some(now));
        db.insert_outbound(&stale).await.unwrap();
        db.insert_outbound(&fresh).await.unwrap();
        db.claim_outbound(stale.id, FaxStatus::Scheduled, now - Duration::hours(1))
            .await
            .unwrap();
        db.claim_outbound(fresh.id, FaxStatus::Scheduled, now).await.unwrap();

        let released = db
            .release_stale_claims(now - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(released, 1);
        let stale = db.get_outbound(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, FaxStatus::Scheduled);
        assert!(stale.claimed_at.is_none());
        let fresh = db.get_outbound(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh.status, FaxStatus::InProgress);
    }

    #[tokio::test]
    async fn delivery_outcomes_are_recorded() {
        let db = test_db().await;
        let now = Utc::now();
        let fax = make_outbound(Some(now));
        db.insert_outbound(&fax).await.unwrap();

        db.reschedule_outbound(fax.id, 1, now + Duration::seconds(60), "line busy")
            .await
            .unwrap();
        let retried = db.get_outbound(fax.id).await.unwrap().unwrap();
        assert_eq!(retried.status, FaxStatus::Scheduled);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(retried.last_error.as_deref(), Some("line busy"));

        db.mark_outbound_sent(fax.id, now, "mock-1").await.unwrap();
        let sent = db.get_outbound(fax.id).await.unwrap().unwrap();
        assert_eq!(sent.status, FaxStatus::Success);
        assert_eq!(sent.transport_id.as_deref(), Some("mock-1"));
        assert!(sent.last_error.is_none());
        assert!(sent.sent_at.is_some());

        let missing = db.mark_outbound_failed(Uuid::new_v4(), "x", now).await;
        assert!(matches!(missing, Err(DatabaseError::NotFound { .. })));
    }

    #[tokio::test]
    async fn update_outbound_requires_expected_status() {
        let db = test_db().await;
        let now = Utc::now();
        let mut fax = make_outbound(Some(now));
        db.insert_outbound(&fax).await.unwrap();
        assert!(db.claim_outbound(fax.id, FaxStatus::Scheduled, now).await.unwrap());

        fax.status = FaxStatus::Failed;
        fax.notes = Some("手動停止".into());
        assert!(!db.update_outbound(&fax, FaxStatus::Scheduled).await.unwrap());

        let stored = db.get_outbound(fax.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FaxStatus::InProgress);
        assert!(stored.notes.is_none());

        assert!(db.update_outbound(&fax, FaxStatus::InProgress).await.unwrap());
        let stored = db.get_outbound(fax.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FaxStatus::Failed);

        let missing = make_outbound(None);
        assert!(!db.update_outbound(&missing, FaxStatus::Pending).await.unwrap());
    }

    // ── Inbound / triage tests ──────────────────────────────────────

    #[tokio::test]
    async fn inbound_insert_get_and_read_flag() {
        let db = test_db().await;
        let fax = NewInboundFax {
            sender_number: Some("0311112222".into()),
            raw_text: Some("修繕依頼".into()),
            ..Default::default()
        }
        .into_fax(Utc::now());
        db.insert_inbound(&fax).await.unwrap();

        assert!(db.set_inbound_read(fax.id, true).await.unwrap());
        assert!(!db.set_inbound_read(Uuid::new_v4(), true).await.unwrap());

        let fetched = db.get_inbound(fax.id).await.unwrap().unwrap();
        assert!(fetched.read);
        assert_eq!(fetched.stage, TriageStage::Received);
        assert_eq!(fetched.raw_text.as_deref(), Some("修繕依頼"));
    }

    #[tokio::test]
    async fn triage_step_upserts_classification() {
        let db = test_db().await;
        let now = Utc::now();
        let mut fax = NewInboundFax {
            raw_text: Some("請求書 お支払期限".into()),
            ..Default::default()
        }
        .into_fax(now);
        db.insert_inbound(&fax).await.unwrap();
        assert!(db.get_classification(fax.id).await.unwrap().is_none());

        let classification =
            DocumentClassifier::default_patterns().classify(fax.text(), &ClassifyMetadata::default());
        fax.document_type = Some(classification.document_type);
        fax.stage = TriageStage::Classified;
        let mut record = ClassificationRecord::new(fax.id, now);
        record.classification = Some(classification.clone());
        db.save_triage_step(&fax, &record).await.unwrap();

        let stored = db.get_classification(fax.id).await.unwrap().unwrap();
        assert_eq!(stored.classification, Some(classification));
        assert_eq!(stored.document_type(), Some(DocumentType::Invoice));

        // Second write replaces the row.
        record.classification = None;
        db.save_triage_step(&fax, &record).await.unwrap();
        let stored = db.get_classification(fax.id).await.unwrap().unwrap();
        assert!(stored.classification.is_none());

        let reloaded = db.get_inbound(fax.id).await.unwrap().unwrap();
        assert_eq!(reloaded.stage, TriageStage::Classified);
        assert_eq!(reloaded.document_type, Some(DocumentType::Invoice));
    }

    #[tokio::test]
    async fn triage_step_for_missing_fax_writes_nothing() {
        let db = test_db().await;
        let fax = NewInboundFax::default().into_fax(Utc::now());
        let record = ClassificationRecord::new(fax.id, Utc::now());
        let result = db.save_triage_step(&fax, &record).await;
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
        assert!(db.get_classification(fax.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn triage_step_writes_text_with_stage() {
        let db = test_db().await;
        let now = Utc::now();
        let mut fax = NewInboundFax::default().into_fax(now);
        db.insert_inbound(&fax).await.unwrap();

        fax.raw_text = Some("見積書".into());
        fax.stage = TriageStage::Received;
        db.save_triage_step(&fax, &ClassificationRecord::new(fax.id, now))
            .await
            .unwrap();
        let stored = db.get_inbound(fax.id).await.unwrap().unwrap();
        assert_eq!(stored.raw_text.as_deref(), Some("見積書"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn transactions_and_claims_interleave_safely() {
        let db = Arc::new(test_db().await);
        let now = Utc::now();

        let mut inbound = Vec::new();
        let mut outbound = Vec::new();
        for _ in 0..50 {
            let fax = NewInboundFax::default().into_fax(now);
            db.insert_inbound(&fax).await.unwrap();
            inbound.push(fax);
            let out = make_outbound(Some(now));
            db.insert_outbound(&out).await.unwrap();
            outbound.push(out.id);
        }

        let mut handles = Vec::new();
        for (fax, out_id) in inbound.into_iter().zip(outbound.iter().copied()) {
            let steps = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                let mut fax = fax;
                fax.stage = TriageStage::Classified;
                steps
                    .save_triage_step(&fax, &ClassificationRecord::new(fax.id, now))
                    .await
                    .map(|_| true)
            }));
            let claims = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                claims.claim_outbound(out_id, FaxStatus::Scheduled, now).await
            }));
            let prunes = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                prunes.prune_before(now - Duration::days(1)).await.map(|_| true)
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }

        // Every claim committed; none was swallowed by another task's transaction.
        for id in outbound {
            let fax = db.get_outbound(id).await.unwrap().unwrap();
            assert_eq!(fax.status, FaxStatus::InProgress);
        }
    }

    // ── Rule tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn rules_crud_and_ordering() {
        let db = test_db().await;
        let target = RouteTarget {
            user_id: Some("suzuki".into()),
            department: None,
        };
        let low = RoutingRule::new("b-low", 1, vec![], target.clone());
        let high = RoutingRule::new(
            "a-high",
            10,
            vec![RuleCondition::DocumentType {
                value: DocumentType::RepairRequest,
            }],
            target.clone(),
        );
        let tie = RoutingRule::new("a-low", 1, vec![], target);
        for rule in [&low, &high, &tie] {
            db.insert_rule(rule).await.unwrap();
        }

        let names: Vec<String> = db.list_rules().await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a-high", "a-low", "b-low"]);

        let fetched = db.get_rule(high.id).await.unwrap().unwrap();
        assert_eq!(fetched.conditions, high.conditions);

        assert!(db.set_rule_active(high.id, false).await.unwrap());
        assert!(!db.get_rule(high.id).await.unwrap().unwrap().active);

        assert!(db.delete_rule(low.id).await.unwrap());
        assert!(!db.delete_rule(low.id).await.unwrap());
        assert_eq!(db.list_rules().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unparsable_rule_rows_are_skipped() {
        let db = test_db().await;
        let good = RoutingRule::new(
            "good",
            1,
            vec![],
            RouteTarget {
                user_id: None,
                department: Some("管理部".into()),
            },
        );
        db.insert_rule(&good).await.unwrap();
        db.conn()
            .await
            .execute(
                "INSERT INTO routing_rules (id, name, priority, active, conditions, created_at, updated_at) VALUES (?1, 'broken', 99, 1, '{not json', '2026-01-01', '2026-01-01')",
                params![Uuid::new_v4().to_string()],
            )
            .await
            .unwrap();

        let rules = db.list_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "good");
    }

    // ── Address book tests ──────────────────────────────────────────

    #[tokio::test]
    async fn property_search_joins_company() {
        let db = test_db().await;
        let company = Company::new("青空不動産", Some("03-0000-0000".into()));
        db.insert_company(&company).await.unwrap();
        db.insert_property(&Property::new("サンハイツ", Some("203".into()), Some(company.id)))
            .await
            .unwrap();
        db.insert_property(&Property::new("グリーンコート", None, None))
            .await
            .unwrap();
        db.insert_property(&Property::new("100%ハイツ", None, None))
            .await
            .unwrap();

        let found = db.search_properties("ハイツ").await.unwrap();
        assert_eq!(found.len(), 2);
        let sun = found.iter().find(|p| p.name == "サンハイツ").unwrap();
        assert_eq!(sun.company_name.as_deref(), Some("青空不動産"));
        assert_eq!(sun.room_number.as_deref(), Some("203"));

        let literal = db.search_properties("100%").await.unwrap();
        assert_eq!(literal.len(), 1);

        assert_eq!(db.list_properties().await.unwrap().len(), 3);
        assert_eq!(db.list_companies().await.unwrap().len(), 1);
    }

    // ── Usage & retention tests ─────────────────────────────────────

    #[tokio::test]
    async fn usage_counters_increment() {
        let db = test_db().await;
        assert_eq!(db.get_usage(2026, 4).await.unwrap(), UsageCounter::empty(2026, 4));

        db.increment_usage(UsageKind::Sent, 2026, 4).await.unwrap();
        db.increment_usage(UsageKind::Sent, 2026, 4).await.unwrap();
        db.increment_usage(UsageKind::Received, 2026, 4).await.unwrap();
        db.increment_usage(UsageKind::Received, 2026, 5).await.unwrap();

        let april = db.get_usage(2026, 4).await.unwrap();
        assert_eq!((april.sent, april.received), (2, 1));
        let may = db.get_usage(2026, 5).await.unwrap();
        assert_eq!((may.sent, may.received), (0, 1));
    }

    #[tokio::test]
    async fn prune_removes_old_terminal_rows_and_keeps_usage() {
        let db = test_db().await;
        let now = Utc::now();

        let mut old_sent = make_outbound(Some(now));
        old_sent.status = FaxStatus::Success;
        let old_scheduled = make_outbound(Some(now));
        db.insert_outbound(&old_sent).await.unwrap();
        db.insert_outbound(&old_scheduled).await.unwrap();

        let inbound = NewInboundFax::default().into_fax(now);
        db.insert_inbound(&inbound).await.unwrap();
        db.save_triage_step(&inbound, &ClassificationRecord::new(inbound.id, now))
            .await
            .unwrap();
        db.increment_usage(UsageKind::Sent, 2026, 1).await.unwrap();

        let report = db.prune_before(now + Duration::days(1)).await.unwrap();
        assert_eq!(report, PruneReport { outbound: 1, inbound: 1 });

        assert!(db.get_outbound(old_sent.id).await.unwrap().is_none());
        assert!(db.get_outbound(old_scheduled.id).await.unwrap().is_some());
        assert!(db.get_inbound(inbound.id).await.unwrap().is_none());
        assert!(db.get_classification(inbound.id).await.unwrap().is_none());
        assert_eq!(db.get_usage(2026, 1).await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fax.db");
        let fax = make_outbound(None);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_outbound(&fax).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_outbound(fax.id).await.unwrap().is_some());
    }
}
