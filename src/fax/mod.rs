//! Fax records shared by the dispatch and triage pipelines.

pub mod model;

pub use model::{
    ClassificationRecord, FaxDocument, FaxStatus, InboundFax, NewInboundFax, NewOutboundFax,
    OutboundFax, OutboundPatch, RetryPolicy, TriageStage, UsageCounter, UsageKind,
};
