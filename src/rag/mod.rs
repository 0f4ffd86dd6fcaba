//! Retrieval: documents, chunking, embeddings, the vector index and
//! context assembly.
//!
//! [`KnowledgeBase`] ties the pieces together for callers that just want to
//! ingest documents and ask for context.

pub mod assembler;
pub mod chunker;
pub mod document;
pub mod embedding;
pub mod index;

pub use assembler::{AssembledContext, ContextAssembler, estimate_tokens};
pub use document::{Document, Fragment, FragmentId, SourceType};
pub use embedding::{Embedder, EmbeddingVector, HashingEmbedder, OllamaEmbedder};
pub use index::{QueryFilter, ScoredFragment, VectorIndex};

use crate::config::RagConfig;
use crate::error::{ChatError, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Result of ingesting one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub document_id: String,
    pub fragments: usize,
}

/// Document store plus retrieval, sharing one index and one embedder.
#[derive(Clone)]
pub struct KnowledgeBase {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    config: RagConfig,
}

impl KnowledgeBase {
    /// Create an empty knowledge base.
    ///
    /// # Errors
    ///
    /// [`ChatError::InvalidConfiguration`] if `config` is invalid.
    pub fn new(config: RagConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let index = Arc::new(VectorIndex::new(config.max_fragments));
        Self::with_index(config, embedder, index)
    }

    /// Create a knowledge base over an existing index (e.g. one loaded from
    /// disk).
    ///
    /// # Errors
    ///
    /// [`ChatError::InvalidConfiguration`] if `config` is invalid.
    pub fn with_index(
        config: RagConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            index,
            embedder,
            config,
        })
    }

    /// The shared index.
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    /// The embedder used for both ingestion and queries.
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Chunk, embed and insert `document`.
    ///
    /// Re-ingesting a document id replaces its previous fragments. The
    /// insert is atomic: on any error the index is left as it was.
    ///
    /// # Errors
    ///
    /// [`ChatError::ModelUnavailable`] if embedding fails,
    /// [`ChatError::DimensionMismatch`] if the embedder disagrees with the
    /// index dimension.
    pub async fn ingest(&self, document: Document) -> Result<IngestReport> {
        let fragments = chunker::chunk(&document, self.config.chunk_size, self.config.overlap)?;
        let texts: Vec<String> = fragments.iter().map(|f| f.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != fragments.len() {
            return Err(ChatError::ModelUnavailable(format!(
                "embedder returned {} vectors for {} fragments",
                vectors.len(),
                fragments.len()
            )));
        }

        let document_id = document.id.clone();
        let source = document.source.clone();
        let count = self
            .index
            .ingest_document(document, fragments.into_iter().zip(vectors).collect())?;

        info!(
            document = %document_id,
            source = %source,
            fragments = count,
            model = self.embedder.model_name(),
            "ingested document"
        );
        Ok(IngestReport {
            document_id,
            fragments: count,
        })
    }

    /// Read a UTF-8 text file and ingest it, keyed by its path.
    ///
    /// Only plain text and Markdown are read directly; PDF text must be
    /// extracted by the caller and passed to [`KnowledgeBase::ingest`].
    ///
    /// # Errors
    ///
    /// I/O errors, a PDF path, or any [`KnowledgeBase::ingest`] error.
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport> {
        if SourceType::from_path(path) == SourceType::Pdf {
            return Err(ChatError::InvalidConfiguration(format!(
                "{}: PDF text extraction is not supported, pass extracted text instead",
                path.display()
            )));
        }
        let text = tokio::fs::read_to_string(path).await?;
        self.ingest(Document::from_path(path, text)).await
    }

    /// Remove a document. Returns the number of fragments removed.
    pub fn remove_document(&self, document_id: &str) -> usize {
        self.index.remove_document(document_id)
    }

    /// Remove every document.
    pub fn clear(&self) {
        self.index.clear();
    }

    /// Ingested documents, oldest first.
    pub fn documents(&self) -> Vec<Document> {
        self.index.documents()
    }

    /// An assembler over this knowledge base's index and embedder.
    pub fn assembler(&self) -> ContextAssembler {
        ContextAssembler::new(
            Arc::clone(&self.index),
            Arc::clone(&self.embedder),
            self.config.top_k,
            self.config.min_relevance,
        )
    }

    /// Assemble context for `query` using the configured token budget.
    ///
    /// # Errors
    ///
    /// See [`ContextAssembler::assemble`].
    pub async fn assemble(&self, query: &str) -> Result<AssembledContext> {
        self.assembler()
            .assemble(query, self.config.token_budget)
            .await
    }

    /// Configured token budget.
    pub fn token_budget(&self) -> usize {
        self.config.token_budget
    }
}
