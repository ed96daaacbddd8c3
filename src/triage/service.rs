//! Inbound triage pipeline: ingest → OCR → classify → match → route.
//!
//! Every step loads the fax by id, computes its decision and persists the
//! decision together with the new stage in one transaction. A step whose
//! prerequisites have not run yet runs them first. Re-running an earlier step
//! moves the stage back to it; later decisions stay stored until re-run.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::TriageError;
use crate::fax::model::{
    ClassificationRecord, InboundFax, NewInboundFax, TriageStage, UsageKind, usage_period,
};
use crate::notify::{Notice, Notifier};
use crate::store::Database;
use crate::triage::classifier::{
    Classification, ClassifyMetadata, DocumentClassifier, DocumentType, Urgency,
};
use crate::triage::extractor::{ExtractionResult, extract_fields, extract_location};
use crate::triage::matcher::{MatchQuery, MatchResult, match_property};
use crate::triage::ocr::OcrEngine;
use crate::triage::router::{RouteInput, RoutingDecision, route};

/// A fax together with its stored decisions.
#[derive(Debug, Clone, Serialize)]
pub struct TriageState {
    pub fax: InboundFax,
    pub record: ClassificationRecord,
}

pub struct TriageService {
    store: Arc<dyn Database>,
    classifier: DocumentClassifier,
    ocr: Arc<dyn OcrEngine>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl TriageService {
    pub fn new(store: Arc<dyn Database>, ocr: Arc<dyn OcrEngine>) -> Self {
        Self {
            store,
            classifier: DocumentClassifier::default_patterns(),
            ocr,
            notifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: DocumentClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    // ── Ingestion ───────────────────────────────────────────────────

    /// Record a received fax and bump the monthly received counter.
    pub async fn ingest(&self, request: NewInboundFax) -> Result<InboundFax, TriageError> {
        let now = Utc::now();
        let mut fax = request.into_fax(now);

        // Text delivered with the fax may already carry the location.
        if let Some(text) = fax.raw_text.as_deref() {
            let (name, room) = extract_location(text);
            fill_location(&mut fax, name, room);
        }

        self.store.insert_inbound(&fax).await?;
        let (year, month) = usage_period(now);
        if let Err(e) = self.store.increment_usage(UsageKind::Received, year, month).await {
            warn!(fax_id = %fax.id, error = %e, "Failed to bump received counter");
        }
        info!(fax_id = %fax.id, sender = ?fax.sender_number, "Inbound fax received");
        Ok(fax)
    }

    pub async fn get(&self, id: Uuid) -> Result<InboundFax, TriageError> {
        self.store
            .get_inbound(id)
            .await?
            .ok_or(TriageError::NotFound { id })
    }

    /// The fax plus whatever decisions have been stored for it.
    pub async fn state(&self, id: Uuid) -> Result<TriageState, TriageError> {
        let fax = self.get(id).await?;
        let record = self.record_for(id).await?;
        Ok(TriageState { fax, record })
    }

    pub async fn set_read(&self, id: Uuid, read: bool) -> Result<(), TriageError> {
        if !self.store.set_inbound_read(id, read).await? {
            return Err(TriageError::NotFound { id });
        }
        Ok(())
    }

    /// OCR an image for this fax and store the recognized text.
    ///
    /// New text invalidates earlier decisions, so the stage returns to
    /// `received`.
    pub async fn recognize(&self, id: Uuid, image: &[u8]) -> Result<InboundFax, TriageError> {
        if image.is_empty() {
            return Err(TriageError::Validation("image body is empty".into()));
        }
        let mut fax = self.get(id).await?;

        let text = self.ocr.recognize(image).await?;
        info!(fax_id = %id, engine = self.ocr.name(), chars = text.chars().count(), "OCR complete");

        let (name, room) = extract_location(&text);
        fill_location(&mut fax, name, room);
        fax.extracted = Some(extract_fields(&text, fax.document_type));
        fax.raw_text = Some(text);
        fax.stage = TriageStage::Received;
        fax.updated_at = Utc::now();

        let record = self.record_for(id).await?;
        self.store.save_triage_step(&fax, &record).await?;
        Ok(fax)
    }

    // ── Stateless steps ─────────────────────────────────────────────

    pub fn classify_text(&self, text: &str, metadata: &ClassifyMetadata) -> Classification {
        self.classifier.classify(text, metadata)
    }

    pub fn extract(&self, text: &str, hint: Option<DocumentType>) -> ExtractionResult {
        extract_fields(text, hint)
    }

    /// Match a query against the address book without touching any fax.
    pub async fn match_query(&self, query: &MatchQuery) -> Result<MatchResult, TriageError> {
        let candidates = match query.property_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => self.store.search_properties(name).await?,
            _ => Vec::new(),
        };
        Ok(match_property(query, &candidates))
    }

    // ── Stored steps ────────────────────────────────────────────────

    /// Classify the fax text and store type, urgency, fields and next action.
    pub async fn classify(&self, id: Uuid) -> Result<Classification, TriageError> {
        let mut fax = self.get(id).await?;
        let metadata = ClassifyMetadata {
            sender_company: fax.sender_company.clone(),
            property_name: fax.property_name.clone(),
            room_number: fax.room_number.clone(),
        };
        let classification = self.classifier.classify(fax.text(), &metadata);
        let document_type = classification.document_type;

        let extracted = extract_fields(fax.text(), Some(document_type));
        let name = extracted.get("property_name").map(str::to_string);
        let room = extracted.get("room_number").map(str::to_string);
        fill_location(&mut fax, name, room);

        fax.document_type = Some(document_type);
        fax.urgency = Some(Urgency::detect(fax.text()));
        fax.extracted = Some(extracted);
        fax.next_action = Some(document_type.next_action().to_string());
        fax.stage = TriageStage::Classified;
        fax.updated_at = Utc::now();

        let mut record = self.record_for(id).await?;
        record.classification = Some(classification.clone());
        record.updated_at = fax.updated_at;
        self.store.save_triage_step(&fax, &record).await?;

        info!(
            fax_id = %id,
            document_type = %document_type,
            confidence = classification.confidence,
            "Inbound fax classified"
        );
        Ok(classification)
    }

    /// Bind the fax to a property, classifying first if needed.
    pub async fn match_property(&self, id: Uuid) -> Result<MatchResult, TriageError> {
        if self.get(id).await?.stage < TriageStage::Classified {
            self.classify(id).await?;
        }
        let mut fax = self.get(id).await?;

        let query = MatchQuery {
            property_name: fax.property_name.clone(),
            room_number: fax.room_number.clone(),
            sender_company: fax.sender_company.clone(),
        };
        let result = self.match_query(&query).await?;

        fax.stage = TriageStage::Matched;
        fax.updated_at = Utc::now();
        let mut record = self.record_for(id).await?;
        record.property_match = Some(result.clone());
        record.updated_at = fax.updated_at;
        self.store.save_triage_step(&fax, &record).await?;

        info!(
            fax_id = %id,
            property_id = ?result.property_id,
            confidence = result.confidence,
            "Inbound fax matched"
        );
        Ok(result)
    }

    /// Pick an assignee from the routing rules, running earlier steps if needed.
    pub async fn route(&self, id: Uuid) -> Result<RoutingDecision, TriageError> {
        if self.get(id).await?.stage < TriageStage::Matched {
            self.match_property(id).await?;
        }
        let mut fax = self.get(id).await?;
        let mut record = self.record_for(id).await?;

        let property_name = record
            .property_match
            .as_ref()
            .and_then(|m| m.property_name.clone())
            .or_else(|| fax.property_name.clone());
        let input = RouteInput {
            document_type: fax.document_type,
            urgency: fax.urgency,
            sender_name: fax.sender_company.clone(),
            property_name,
        };
        let rules = self.store.list_rules().await?;
        let decision = route(&rules, &input);

        fax.stage = TriageStage::Routed;
        fax.updated_at = Utc::now();
        record.routing = Some(decision.clone());
        record.updated_at = fax.updated_at;
        self.store.save_triage_step(&fax, &record).await?;

        info!(
            fax_id = %id,
            rule = ?decision.rule_name,
            user_id = ?decision.user_id,
            department = ?decision.department,
            "Inbound fax routed"
        );

        if decision.is_assigned()
            && let Some(notifier) = &self.notifier
        {
            let assignee = decision
                .user_id
                .clone()
                .or_else(|| decision.department.clone())
                .unwrap_or_default();
            notifier.notify(Notice::InboundRouted {
                fax_id: id,
                document_label: fax
                    .document_type
                    .map(|d| d.label().to_string())
                    .unwrap_or_default(),
                assignee,
                next_action: fax.next_action.clone(),
            });
        }
        Ok(decision)
    }

    /// Advance from the current stage to `routed`.
    pub async fn run(&self, id: Uuid) -> Result<TriageState, TriageError> {
        if self.get(id).await?.stage < TriageStage::Routed {
            self.route(id).await?;
        }
        self.state(id).await
    }

    async fn record_for(&self, id: Uuid) -> Result<ClassificationRecord, TriageError> {
        Ok(self
            .store
            .get_classification(id)
            .await?
            .unwrap_or_else(|| ClassificationRecord::new(id, Utc::now())))
    }
}

/// Fill property name and room number only where still unknown.
fn fill_location(fax: &mut InboundFax, name: Option<String>, room: Option<String>) {
    if fax.property_name.is_none() {
        fax.property_name = name;
    }
    if fax.room_number.is_none() {
        fax.room_number = room;
    }
}
