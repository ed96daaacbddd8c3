//! Inbound fax triage.

pub mod classifier;
pub mod extractor;
pub mod matcher;
pub mod ocr;
pub mod router;
pub mod service;

pub use classifier::{Classification, ClassifyMetadata, DocumentClassifier, DocumentType, Urgency};
pub use extractor::{ExtractionResult, extract_fields};
pub use matcher::{MatchQuery, MatchResult, match_property};
pub use ocr::{OcrEngine, StaticOcrEngine, TesseractEngine};
pub use router::{RouteInput, RouteTarget, RoutingDecision, RoutingRule, RuleCondition, route};
pub use service::{TriageService, TriageState};
