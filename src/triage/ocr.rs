//! OCR engine abstraction.
//!
//! Received fax images are turned into raw text by an external engine.
//! The default backend shells out to the `tesseract` CLI, feeding the image
//! on stdin and reading text from stdout.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::OcrError;

/// Black-box text recognition.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &str;

    /// Recognize text in an image (TIFF/PNG/JPEG bytes).
    async fn recognize(&self, image: &[u8]) -> Result<String, OcrError>;
}

/// Tesseract OCR via command line.
pub struct TesseractEngine {
    program: String,
    language: String,
}

impl TesseractEngine {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            program: "tesseract".into(),
            language: language.into(),
        }
    }

    /// Builder: run a different binary (a wrapper script or an absolute path).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, image: &[u8]) -> Result<String, OcrError> {
        if image.is_empty() {
            return Err(OcrError::Failed("empty image".into()));
        }

        let mut child = match Command::new(&self.program)
            .args(["stdin", "stdout", "-l", &self.language])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OcrError::BackendNotAvailable(format!(
                    "{} not found (install tesseract-ocr)",
                    self.program
                )));
            }
            Err(e) => return Err(OcrError::Io(e)),
        };

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(image).await?;
            // Dropping stdin closes the pipe so tesseract sees EOF.
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(OcrError::Failed(format!("tesseract failed: {}", stderr.trim())))
        }
    }
}

/// Engine that returns fixed text (for tests and for deployments without OCR).
pub struct StaticOcrEngine {
    text: String,
}

impl StaticOcrEngine {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl OcrEngine for StaticOcrEngine {
    fn name(&self) -> &str {
        "static"
    }

    async fn recognize(&self, _image: &[u8]) -> Result<String, OcrError> {
        Ok(self.text.clone())
    }
}
