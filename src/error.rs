//! Error types for fax-desk.

use uuid::Uuid;

/// Startup errors: everything `app::build` can fail with.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

/// Fax carrier errors. Every variant counts as a failed delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Carrier {carrier} is not configured: {reason}")]
    NotConfigured { carrier: String, reason: String },

    #[error("Carrier {carrier} rejected fax: {reason}")]
    Rejected { carrier: String, reason: String },

    #[error("Carrier {carrier} request failed: {reason}")]
    RequestFailed { carrier: String, reason: String },
}

/// Document rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Renderer request failed: {0}")]
    RequestFailed(String),

    #[error("Renderer returned status {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("Renderer returned an empty document")]
    EmptyDocument,
}

/// OCR engine errors.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("OCR failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Notification delivery errors. Logged, never propagated to callers.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP send failed: {0}")]
    Smtp(String),
}

/// Outbound dispatch errors surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Outbound fax {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid outbound fax: {0}")]
    Validation(String),

    #[error("Outbound fax {id} is {status}, cannot send now")]
    NotSendable { id: Uuid, status: String },

    #[error("Outbound fax {id} changed to {status} before the edit was saved")]
    Conflict { id: Uuid, status: String },

    #[error("Failed to load due faxes: {0}")]
    DueQuery(#[source] DatabaseError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Inbound triage errors surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("Inbound fax {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid triage request: {0}")]
    Validation(String),

    #[error(transparent)]
    Ocr(#[from] OcrError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
