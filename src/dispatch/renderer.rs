//! Document rendering: turns stored fax fields into the bytes sent to the carrier.

use async_trait::async_trait;
use serde_json::json;

use crate::error::RenderError;
use crate::fax::model::FaxDocument;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Rendered bytes plus the labels a carrier upload needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDocument {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
}

impl RenderedDocument {
    /// Label `bytes` with `content_type`, naming the file after its format.
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        let content_type = content_type.into();
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let extension = match essence.as_str() {
            "text/plain" => "txt",
            "image/tiff" => "tiff",
            "image/png" => "png",
            "image/jpeg" => "jpg",
            _ => "pdf",
        };
        Self {
            bytes,
            content_type,
            file_name: format!("fax.{extension}"),
        }
    }

    pub fn pdf(bytes: Vec<u8>) -> Self {
        Self::new(bytes, PDF_CONTENT_TYPE)
    }

    pub fn text(text: String) -> Self {
        Self::new(text.into_bytes(), TEXT_CONTENT_TYPE)
    }
}

/// Produces a transmittable document from template fields.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(&self, document: &FaxDocument) -> Result<RenderedDocument, RenderError>;
}

/// Delegates rendering to an external HTTP service (headless browser PDF).
///
/// POSTs `{"title", "body", "fields"}` and expects the document bytes back.
/// The response `Content-Type` labels the upload; PDF when it is missing.
pub struct HttpRenderer {
    url: String,
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DocumentRenderer for HttpRenderer {
    async fn render(&self, document: &FaxDocument) -> Result<RenderedDocument, RenderError> {
        let fields: serde_json::Map<String, serde_json::Value> = document
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        let body = json!({
            "title": document.title,
            "body": document.body,
            "fields": fields,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RenderError::RequestFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RenderError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(PDF_CONTENT_TYPE)
            .to_string();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RenderError::RequestFailed(e.to_string()))?;
        if bytes.is_empty() {
            return Err(RenderError::EmptyDocument);
        }
        Ok(RenderedDocument::new(bytes.to_vec(), content_type))
    }
}

/// Built-in plain text cover sheet, used when no renderer service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoverSheetRenderer;

impl CoverSheetRenderer {
    pub fn render_text(document: &FaxDocument) -> String {
        let mut out = String::new();
        out.push_str(document.title.trim());
        out.push('\n');
        out.push_str(&"=".repeat(40));
        out.push('\n');
        for (label, value) in &document.fields {
            out.push_str(&format!("{label}: {value}\n"));
        }
        if !document.fields.is_empty() {
            out.push('\n');
        }
        out.push_str(document.body.trim());
        out.push('\n');
        out
    }
}

#[async_trait]
impl DocumentRenderer for CoverSheetRenderer {
    async fn render(&self, document: &FaxDocument) -> Result<RenderedDocument, RenderError> {
        if document.title.trim().is_empty() && document.body.trim().is_empty() {
            return Err(RenderError::EmptyDocument);
        }
        Ok(RenderedDocument::text(Self::render_text(document)))
    }
}
