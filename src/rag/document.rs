//! Documents and the fragments they are split into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Kind of file a document's text was extracted from.
///
/// Extraction happens before ingestion; after that every variant is
/// handled the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Pdf,
    Markdown,
    PlainText,
}

impl SourceType {
    /// Guess the source type from a file extension. Unknown extensions are
    /// treated as plain text.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("pdf") => Self::Pdf,
            Some("md" | "markdown") => Self::Markdown,
            _ => Self::PlainText,
        }
    }
}

/// An ingested document. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Caller-assigned identifier, unique within one index.
    pub id: String,
    /// Where the text came from (usually a file path).
    pub source: String,
    pub source_type: SourceType,
    /// Extracted plain text.
    pub text: String,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    /// Create a document stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        source_type: SourceType,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_type,
            text: text.into(),
            ingested_at: Utc::now(),
        }
    }

    /// Create a document for already-extracted file text, using the path as
    /// both identifier and source and inferring the source type.
    pub fn from_path(path: &Path, text: impl Into<String>) -> Self {
        let source = path.display().to_string();
        Self::new(source.clone(), source, SourceType::from_path(path), text)
    }
}

/// Identity of a fragment: its document plus its sequence index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentId {
    pub document_id: String,
    pub seq: usize,
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.document_id, self.seq)
    }
}

/// A contiguous slice of one document's text.
///
/// `start..end` is the byte range in the document. The first `overlap`
/// bytes repeat the tail of the previous fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    /// Source of the owning document, kept for citations.
    pub source: String,
    pub start: usize,
    pub end: usize,
    pub overlap: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

impl Fragment {
    pub(crate) fn new(
        document: &Document,
        seq: usize,
        start: usize,
        end: usize,
        overlap: usize,
    ) -> Self {
        let text = document.text[start..end].to_owned();
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        Self {
            id: FragmentId {
                document_id: document.id.clone(),
                seq,
            },
            source: document.source.clone(),
            start,
            end,
            overlap,
            text,
            hash,
        }
    }

    /// Text contributed by this fragment alone (overlap removed).
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap..]
    }
}
