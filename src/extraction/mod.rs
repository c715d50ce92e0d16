//! Text extraction collaborators.
//!
//! Extraction is a black box to the pipeline: bytes plus a MIME type in, an ordered list of
//! `(page_number, text)` out. The crate ships a plain-text extractor and an OCR fallback
//! wrapper; PDF parsing and OCR engines are injected through [`TextExtractor`] and
//! [`PageRecognizer`].

use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Errors raised by extraction collaborators.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// No extractor handles the MIME type.
    #[error("Unsupported content type: {mime_type}")]
    Unsupported {
        /// MIME type supplied with the content.
        mime_type: String,
    },
    /// Content could not be decoded.
    #[error("Corrupt document: {0}")]
    Corrupt(String),
    /// An external extraction engine failed.
    #[error("Extraction engine failed: {0}")]
    Collaborator(String),
}

/// Text of one page as returned by extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPage {
    /// 1-based page number.
    pub page_number: u32,
    /// Raw page text (possibly empty).
    pub text: String,
}

/// Turns document bytes into page text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract page text in document order.
    async fn extract_text(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<Vec<ExtractedPage>, ExtractionError>;
}

/// Recognizes text on a rendered page (OCR).
#[async_trait]
pub trait PageRecognizer: Send + Sync {
    /// Recognize the text of `page_number` within the document bytes.
    async fn recognize(
        &self,
        bytes: &[u8],
        mime_type: &str,
        page_number: u32,
    ) -> Result<String, ExtractionError>;
}

/// Built-in extractor for UTF-8 text content.
///
/// Page breaks are recognized from form feeds or from `--- PAGE n ---` marker lines; content
/// without either is a single page.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    /// Create a plain-text extractor.
    pub const fn new() -> Self {
        Self
    }

    /// Whether the extractor handles the MIME type.
    pub fn supports(mime_type: &str) -> bool {
        let essence = mime_essence(mime_type);
        matches!(essence.as_str(), "text/plain" | "text/markdown")
    }

    fn split_pages(text: &str) -> Vec<ExtractedPage> {
        if text.contains('\u{c}') {
            return text
                .split('\u{c}')
                .enumerate()
                .map(|(idx, page)| ExtractedPage {
                    page_number: idx as u32 + 1,
                    text: page.to_string(),
                })
                .collect();
        }

        let markers: Vec<_> = page_marker().captures_iter(text).collect();
        if markers.is_empty() {
            return vec![ExtractedPage {
                page_number: 1,
                text: text.to_string(),
            }];
        }

        let mut pages = Vec::with_capacity(markers.len());
        for (idx, captures) in markers.iter().enumerate() {
            let (Some(whole), Some(number)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let end = markers
                .get(idx + 1)
                .and_then(|next| next.get(0))
                .map(|next| next.start())
                .unwrap_or(text.len());
            let page_number = number.as_str().parse().unwrap_or(idx as u32 + 1);
            pages.push(ExtractedPage {
                page_number,
                text: text[whole.end()..end].to_string(),
            });
        }
        pages
    }
}

fn page_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*---[ \t]*PAGE[ \t]+(\d+)[ \t]*---[ \t]*$")
            .expect("page marker pattern is valid")
    })
}

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract_text(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<Vec<ExtractedPage>, ExtractionError> {
        if !Self::supports(mime_type) {
            return Err(ExtractionError::Unsupported {
                mime_type: mime_type.to_string(),
            });
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|error| ExtractionError::Corrupt(format!("invalid UTF-8: {error}")))?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        Ok(Self::split_pages(text))
    }
}

/// Extractor that sends pages without direct text to an OCR collaborator.
///
/// Image content, which the primary extractor cannot read, is recognized as a single page.
pub struct OcrFallbackExtractor {
    primary: Arc<dyn TextExtractor>,
    recognizer: Arc<dyn PageRecognizer>,
}

impl OcrFallbackExtractor {
    /// Wrap `primary`, delegating empty pages to `recognizer`.
    pub fn new(primary: Arc<dyn TextExtractor>, recognizer: Arc<dyn PageRecognizer>) -> Self {
        Self {
            primary,
            recognizer,
        }
    }
}

#[async_trait]
impl TextExtractor for OcrFallbackExtractor {
    async fn extract_text(
        &self,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<Vec<ExtractedPage>, ExtractionError> {
        if mime_essence(mime_type).starts_with("image/") {
            tracing::info!(mime_type, "Recognizing image content");
            let text = self.recognizer.recognize(bytes, mime_type, 1).await?;
            return Ok(vec![ExtractedPage {
                page_number: 1,
                text,
            }]);
        }

        let mut pages = self.primary.extract_text(bytes, mime_type).await?;
        for page in pages.iter_mut().filter(|page| page.text.trim().is_empty()) {
            tracing::info!(page = page.page_number, "Using OCR for page without text");
            match self
                .recognizer
                .recognize(bytes, mime_type, page.page_number)
                .await
            {
                Ok(text) => page.text = text,
                Err(error) => {
                    tracing::warn!(page = page.page_number, error = %error, "OCR fallback failed");
                }
            }
        }
        Ok(pages)
    }
}

/// Guess a MIME type from a file extension.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_lowercase();
    match extension.as_str() {
        "txt" | "text" => Some("text/plain"),
        "md" | "markdown" => Some("text/markdown"),
        "pdf" => Some("application/pdf"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

fn mime_essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}
