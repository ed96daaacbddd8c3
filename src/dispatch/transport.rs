//! Fax carriers.
//!
//! `send` either delivers the whole document or fails; there is no partial
//! success. Every error counts as one failed attempt for the retry policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;

use crate::config::{PhaxioConfig, SrfaxConfig, TransportKind};
use crate::dispatch::renderer::RenderedDocument;
use crate::error::TransportError;

const PHAXIO_SEND_URL: &str = "https://api.phaxio.com/v2/faxes";
const SRFAX_URL: &str = "https://www.srfax.com/SRF_SecWebSvc.php";

/// A fax carrier capability.
#[async_trait]
pub trait FaxTransport: Send + Sync {
    /// Carrier name for logging.
    fn name(&self) -> &str;

    /// Transmit `document` to `destination`. Returns the carrier's transmission id.
    async fn send(
        &self,
        destination: &str,
        document: &RenderedDocument,
    ) -> Result<String, TransportError>;
}

/// Pick the configured carrier. Real carriers require their credentials.
pub fn transport_from_config(
    kind: TransportKind,
    phaxio: Option<PhaxioConfig>,
    srfax: Option<SrfaxConfig>,
) -> Result<Arc<dyn FaxTransport>, TransportError> {
    match kind {
        TransportKind::Mock => {
            tracing::warn!("Using mock fax transport; nothing leaves this process");
            Ok(Arc::new(MockTransport::succeeding()))
        }
        TransportKind::Phaxio => {
            let config = phaxio.ok_or_else(|| TransportError::NotConfigured {
                carrier: "phaxio".into(),
                reason: "PHAXIO_API_KEY and PHAXIO_API_SECRET must be set".into(),
            })?;
            Ok(Arc::new(PhaxioTransport::new(config)))
        }
        TransportKind::Srfax => {
            let config = srfax.ok_or_else(|| TransportError::NotConfigured {
                carrier: "srfax".into(),
                reason: "SRFAX_ACCESS_ID and SRFAX_PASSWORD must be set".into(),
            })?;
            Ok(Arc::new(SrfaxTransport::new(config)))
        }
    }
}

/// In-process carrier that never dials out.
pub struct MockTransport {
    fail: bool,
    attempts: AtomicUsize,
    last_document: Mutex<Option<RenderedDocument>>,
}

impl MockTransport {
    /// Every send succeeds.
    pub fn succeeding() -> Self {
        Self {
            fail: false,
            attempts: AtomicUsize::new(0),
            last_document: Mutex::new(None),
        }
    }

    /// Every send fails (for exercising the retry policy).
    pub fn failing() -> Self {
        Self {
            fail: true,
            attempts: AtomicUsize::new(0),
            last_document: Mutex::new(None),
        }
    }

    /// Number of `send` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The document passed to the most recent `send`.
    pub fn last_document(&self) -> Option<RenderedDocument> {
        self.last_document.lock().ok().and_then(|d| d.clone())
    }
}

#[async_trait]
impl FaxTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(
        &self,
        destination: &str,
        document: &RenderedDocument,
    ) -> Result<String, TransportError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut last) = self.last_document.lock() {
            *last = Some(document.clone());
        }
        if self.fail {
            return Err(TransportError::Rejected {
                carrier: "mock".into(),
                reason: format!("simulated failure to {destination}"),
            });
        }
        tracing::debug!(
            destination,
            bytes = document.bytes.len(),
            content_type = %document.content_type,
            attempt = n,
            "Mock fax sent"
        );
        Ok(format!("mock-{n}"))
    }
}

/// Phaxio REST carrier.
pub struct PhaxioTransport {
    config: PhaxioConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct PhaxioResponse {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<PhaxioData>,
}

#[derive(Deserialize)]
struct PhaxioData {
    id: serde_json::Value,
}

impl PhaxioTransport {
    pub fn new(config: PhaxioConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FaxTransport for PhaxioTransport {
    fn name(&self) -> &str {
        "phaxio"
    }

    async fn send(
        &self,
        destination: &str,
        document: &RenderedDocument,
    ) -> Result<String, TransportError> {
        let failed = |reason: String| TransportError::RequestFailed {
            carrier: "phaxio".into(),
            reason,
        };

        let part = Part::bytes(document.bytes.clone())
            .file_name(document.file_name.clone())
            .mime_str(&document.content_type)
            .map_err(|e| failed(e.to_string()))?;
        let form = Form::new().text("to", destination.to_string()).part("file", part);

        let resp = self
            .client
            .post(PHAXIO_SEND_URL)
            .basic_auth(
                self.config.api_key.expose_secret(),
                Some(self.config.api_secret.expose_secret()),
            )
            .multipart(form)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = resp.status();
        let body: PhaxioResponse = resp
            .json()
            .await
            .map_err(|e| failed(format!("status {status}: {e}")))?;

        if !body.success {
            return Err(TransportError::Rejected {
                carrier: "phaxio".into(),
                reason: body.message,
            });
        }
        let id = body
            .data
            .map(|d| match d.id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default();
        tracing::info!(destination, transport_id = %id, "Phaxio fax queued");
        Ok(id)
    }
}

/// SRFax web-service carrier.
pub struct SrfaxTransport {
    config: SrfaxConfig,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SrfaxResponse {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Result", default)]
    result: serde_json::Value,
}

impl SrfaxTransport {
    pub fn new(config: SrfaxConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FaxTransport for SrfaxTransport {
    fn name(&self) -> &str {
        "srfax"
    }

    async fn send(
        &self,
        destination: &str,
        document: &RenderedDocument,
    ) -> Result<String, TransportError> {
        let failed = |reason: String| TransportError::RequestFailed {
            carrier: "srfax".into(),
            reason,
        };

        let to: String = destination.chars().filter(char::is_ascii_digit).collect();
        let body = json!({
            "action": "Queue_Fax",
            "access_id": self.config.access_id,
            "access_pwd": self.config.password.expose_secret(),
            "sCallerID": self.config.caller_id,
            "sSenderEmail": self.config.sender_email,
            "sFaxType": "SINGLE",
            "sToFaxNumber": to,
            "sFileName_1": document.file_name,
            "sFileContent_1": base64::engine::general_purpose::STANDARD.encode(&document.bytes),
        });

        let resp = self
            .client
            .post(SRFAX_URL)
            .json(&body)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = resp.status();
        let parsed: SrfaxResponse = resp
            .json()
            .await
            .map_err(|e| failed(format!("status {status}: {e}")))?;

        let result = match parsed.result {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        if parsed.status != "Success" {
            return Err(TransportError::Rejected {
                carrier: "srfax".into(),
                reason: result,
            });
        }
        tracing::info!(destination, transport_id = %result, "SRFax fax queued");
        Ok(result)
    }
}
