//! Fax data model: outbound transmissions, received faxes, triage records and usage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::triage::classifier::{Classification, DocumentType, Urgency};
use crate::triage::extractor::ExtractionResult;
use crate::triage::matcher::MatchResult;
use crate::triage::router::RoutingDecision;

/// Upper bound on `RetryPolicy::max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Upper bound on `RetryPolicy::interval_secs` (30 days).
pub const MAX_RETRY_INTERVAL_SECS: u64 = 30 * 24 * 60 * 60;

// ── Outbound ────────────────────────────────────────────────────────

/// Lifecycle status of an outbound fax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaxStatus {
    /// Created without a schedule, awaiting an immediate send.
    Pending,
    /// Waiting for `scheduled_at` to pass.
    Scheduled,
    /// Claimed by a sweep or an immediate send; an attempt is running.
    InProgress,
    Success,
    Failed,
}

impl FaxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// No further delivery attempts happen from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for FaxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown fax status: {other}")),
        }
    }
}

/// Per-fax retry configuration.
///
/// `max_retries` counts re-schedulings, so a fax gets at most
/// `max_retries + 1` delivery attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_interval_secs() -> u64 {
    300
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_max_retries(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, interval_secs: u64) -> Self {
        Self {
            enabled: true,
            max_retries,
            interval_secs,
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// When to try again after a failed attempt, or `None` if retries are exhausted.
    ///
    /// Errors when the interval does not fit in the calendar, which only
    /// happens for rows stored without validation.
    pub fn next_attempt(
        &self,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, String> {
        if !self.enabled || retry_count >= self.max_retries {
            return Ok(None);
        }
        i64::try_from(self.interval_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|delta| now.checked_add_signed(delta))
            .map(Some)
            .ok_or_else(|| format!("retry interval of {}s is out of range", self.interval_secs))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(format!("max_retries must be at most {MAX_RETRIES_LIMIT}"));
        }
        if self.enabled && self.interval_secs < 1 {
            return Err("retry interval must be at least 1 second".into());
        }
        if self.interval_secs > MAX_RETRY_INTERVAL_SECS {
            return Err(format!(
                "retry interval must be at most {MAX_RETRY_INTERVAL_SECS} seconds"
            ));
        }
        Ok(())
    }
}

/// Template fields the renderer turns into the transmitted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaxDocument {
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Extra labelled values printed under the body (e.g. 物件名, 部屋番号).
    #[serde(default)]
    pub fields: Vec<(String, String)>,
}

/// One outbound transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundFax {
    pub id: Uuid,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub document: FaxDocument,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    pub status: FaxStatus,
    pub retry: RetryPolicy,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Error from the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Carrier-side id from the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    /// When the current `in_progress` claim was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create an outbound fax.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewOutboundFax {
    pub destination: String,
    #[serde(default)]
    pub property_id: Option<Uuid>,
    #[serde(default)]
    pub company_id: Option<Uuid>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub document: FaxDocument,
    /// When set the fax is `scheduled`; otherwise it is sent immediately.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewOutboundFax {
    pub fn new(destination: impl Into<String>, document: FaxDocument) -> Self {
        Self {
            destination: destination.into(),
            document,
            ..Default::default()
        }
    }

    /// Builder: schedule for later.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Builder: set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        let destination = self.destination.trim();
        if destination.is_empty() {
            return Err("destination must not be empty".into());
        }
        if !destination
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | ' '))
        {
            return Err(format!("destination contains invalid characters: {destination}"));
        }
        if !destination.chars().any(|c| c.is_ascii_digit()) {
            return Err("destination has no digits".into());
        }
        if self.document.title.trim().is_empty() && self.document.body.trim().is_empty() {
            return Err("document needs a title or body".into());
        }
        self.retry.validate()
    }

    /// Build the stored record. Status follows from whether a time was given.
    pub fn into_fax(self, now: DateTime<Utc>) -> OutboundFax {
        let status = if self.scheduled_at.is_some() {
            FaxStatus::Scheduled
        } else {
            FaxStatus::Pending
        };
        OutboundFax {
            id: Uuid::new_v4(),
            destination: self.destination.trim().to_string(),
            property_id: self.property_id,
            company_id: self.company_id,
            user_id: self.user_id,
            document: self.document,
            scheduled_at: self.scheduled_at,
            sent_at: None,
            status,
            retry: self.retry,
            retry_count: 0,
            notes: self.notes,
            last_error: None,
            transport_id: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Manual edit of an outbound fax. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundPatch {
    #[serde(default)]
    pub status: Option<FaxStatus>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl OutboundPatch {
    /// Apply to `fax`, rejecting transitions only the dispatcher may make.
    pub fn apply(self, fax: &mut OutboundFax, now: DateTime<Utc>) -> Result<(), String> {
        if fax.status == FaxStatus::InProgress {
            return Err("fax is being sent and cannot be edited".into());
        }
        if let Some(status) = self.status {
            if status == FaxStatus::InProgress {
                return Err("in_progress is set by the dispatcher only".into());
            }
            if status == FaxStatus::Scheduled && self.scheduled_at.or(fax.scheduled_at).is_none() {
                return Err("scheduling requires scheduled_at".into());
            }
            fax.status = status;
        }
        if let Some(at) = self.scheduled_at {
            fax.scheduled_at = Some(at);
        }
        if let Some(notes) = self.notes {
            fax.notes = Some(notes);
        }
        if let Some(user_id) = self.user_id {
            fax.user_id = Some(user_id);
        }
        fax.updated_at = now;
        Ok(())
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// Triage progress of a received fax. Ordered by pipeline position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageStage {
    Received,
    Classified,
    Matched,
    Routed,
}

impl TriageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Classified => "classified",
            Self::Matched => "matched",
            Self::Routed => "routed",
        }
    }
}

impl fmt::Display for TriageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriageStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "classified" => Ok(Self::Classified),
            "matched" => Ok(Self::Matched),
            "routed" => Ok(Self::Routed),
            other => Err(format!("unknown triage stage: {other}")),
        }
    }
}

/// One received transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundFax {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<DocumentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<Urgency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted: Option<ExtractionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    pub stage: TriageStage,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InboundFax {
    pub fn text(&self) -> &str {
        self.raw_text.as_deref().unwrap_or_default()
    }
}

/// Request to record a received fax.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewInboundFax {
    #[serde(default)]
    pub sender_number: Option<String>,
    #[serde(default)]
    pub sender_company: Option<String>,
    #[serde(default)]
    pub property_name: Option<String>,
    #[serde(default)]
    pub room_number: Option<String>,
    #[serde(default)]
    pub raw_text: Option<String>,
}

impl NewInboundFax {
    pub fn into_fax(self, now: DateTime<Utc>) -> InboundFax {
        let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        InboundFax {
            id: Uuid::new_v4(),
            sender_number: clean(self.sender_number),
            sender_company: clean(self.sender_company),
            property_name: clean(self.property_name),
            room_number: clean(self.room_number),
            raw_text: self.raw_text,
            read: false,
            document_type: None,
            urgency: None,
            extracted: None,
            next_action: None,
            stage: TriageStage::Received,
            received_at: now,
            updated_at: now,
        }
    }
}

/// Persisted triage decisions for one inbound fax (one row per fax).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub fax_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_match: Option<MatchResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingDecision>,
    pub updated_at: DateTime<Utc>,
}

impl ClassificationRecord {
    pub fn new(fax_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            fax_id,
            classification: None,
            property_match: None,
            routing: None,
            updated_at: now,
        }
    }

    pub fn document_type(&self) -> Option<DocumentType> {
        self.classification.as_ref().map(|c| c.document_type)
    }

    pub fn property_id(&self) -> Option<Uuid> {
        self.property_match.as_ref().and_then(|m| m.property_id)
    }
}

// ── Usage ───────────────────────────────────────────────────────────

/// Which monthly counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    Sent,
    Received,
}

/// Monthly transmission counts. Only ever incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub year: i32,
    pub month: u32,
    pub sent: i64,
    pub received: i64,
}

impl UsageCounter {
    pub fn empty(year: i32, month: u32) -> Self {
        Self {
            year,
            month,
            sent: 0,
            received: 0,
        }
    }
}

/// Year and month a timestamp falls in, for usage bucketing.
pub fn usage_period(at: DateTime<Utc>) -> (i32, u32) {
    (at.year(), at.month())
}
