//! `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::directory::{Company, Property, PropertyRecord};
use crate::error::DatabaseError;
use crate::fax::model::{
    ClassificationRecord, FaxStatus, InboundFax, OutboundFax, UsageCounter, UsageKind,
};
use crate::triage::router::RoutingRule;

/// Rows removed by a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub outbound: usize,
    pub inbound: usize,
}

/// Backend-agnostic database trait covering faxes, triage, rules and the address book.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Outbound ────────────────────────────────────────────────────

    async fn insert_outbound(&self, fax: &OutboundFax) -> Result<(), DatabaseError>;

    async fn get_outbound(&self, id: Uuid) -> Result<Option<OutboundFax>, DatabaseError>;

    /// Overwrite the editable fields (status, schedule, notes, assignee) if the
    /// stored status is still `expected`. Returns false when it is not, or the
    /// fax is gone.
    async fn update_outbound(
        &self,
        fax: &OutboundFax,
        expected: FaxStatus,
    ) -> Result<bool, DatabaseError>;

    /// Faxes with status `scheduled` and `scheduled_at <= now`, oldest first.
    async fn list_due_outbound(&self, now: DateTime<Utc>) -> Result<Vec<OutboundFax>, DatabaseError>;

    /// Number of due faxes (same filter as `list_due_outbound`).
    async fn count_due_outbound(&self, now: DateTime<Utc>) -> Result<i64, DatabaseError>;

    /// Atomically move a fax from `from` to `in_progress`.
    /// Returns false when another caller changed the status first.
    async fn claim_outbound(
        &self,
        id: Uuid,
        from: FaxStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Return `in_progress` claims taken before `claimed_before` to `scheduled`.
    async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<usize, DatabaseError>;

    /// Record a successful attempt on a claimed fax.
    async fn mark_outbound_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
        transport_id: &str,
    ) -> Result<(), DatabaseError>;

    /// Put a claimed fax back to `scheduled` after a failed attempt.
    async fn reschedule_outbound(
        &self,
        id: Uuid,
        retry_count: u32,
        next_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), DatabaseError>;

    /// Terminal failure of a claimed fax.
    async fn mark_outbound_failed(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Inbound ─────────────────────────────────────────────────────

    async fn insert_inbound(&self, fax: &InboundFax) -> Result<(), DatabaseError>;

    async fn get_inbound(&self, id: Uuid) -> Result<Option<InboundFax>, DatabaseError>;

    /// Returns false when the fax does not exist.
    async fn set_inbound_read(&self, id: Uuid, read: bool) -> Result<bool, DatabaseError>;

    /// Persist one triage step: the fax's text, derived fields and stage plus
    /// the classification row, in a single transaction.
    async fn save_triage_step(
        &self,
        fax: &InboundFax,
        record: &ClassificationRecord,
    ) -> Result<(), DatabaseError>;

    async fn get_classification(
        &self,
        fax_id: Uuid,
    ) -> Result<Option<ClassificationRecord>, DatabaseError>;

    // ── Routing rules ───────────────────────────────────────────────

    async fn insert_rule(&self, rule: &RoutingRule) -> Result<(), DatabaseError>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<RoutingRule>, DatabaseError>;

    /// All rules, priority descending then name ascending. Unparsable rows are skipped.
    async fn list_rules(&self) -> Result<Vec<RoutingRule>, DatabaseError>;

    async fn set_rule_active(&self, id: Uuid, active: bool) -> Result<bool, DatabaseError>;

    async fn delete_rule(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Address book ────────────────────────────────────────────────

    async fn insert_company(&self, company: &Company) -> Result<(), DatabaseError>;

    async fn list_companies(&self) -> Result<Vec<Company>, DatabaseError>;

    async fn insert_property(&self, property: &Property) -> Result<(), DatabaseError>;

    /// All properties joined with their company name.
    async fn list_properties(&self) -> Result<Vec<PropertyRecord>, DatabaseError>;

    /// Properties whose name contains `name_fragment`, joined with their company name.
    async fn search_properties(
        &self,
        name_fragment: &str,
    ) -> Result<Vec<PropertyRecord>, DatabaseError>;

    // ── Usage & retention ───────────────────────────────────────────

    async fn increment_usage(
        &self,
        kind: UsageKind,
        year: i32,
        month: u32,
    ) -> Result<(), DatabaseError>;

    /// Counters for a month; zeros when nothing was recorded.
    async fn get_usage(&self, year: i32, month: u32) -> Result<UsageCounter, DatabaseError>;

    /// Delete terminal outbound faxes and inbound faxes (with their
    /// classification rows) last updated before `cutoff`. Usage counters are kept.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, DatabaseError>;
}
