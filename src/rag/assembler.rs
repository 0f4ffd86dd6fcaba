//! Retrieval-augmented context assembly.
//!
//! Turns a user query into a context block: embed, fetch the nearest
//! fragments, drop those under the relevance floor, then take fragments best
//! first until the next one would push the token estimate past the budget.
//!
//! The chosen fragments are rendered one `### Source:` block per document.
//! Blocks follow the rank of each document's best fragment; inside a block
//! fragments are in document order and neighbours that overlap or touch are
//! stitched into one passage.

use crate::error::Result;
use crate::rag::document::Fragment;
use crate::rag::embedding::Embedder;
use crate::rag::index::{QueryFilter, ScoredFragment, VectorIndex};
use std::sync::Arc;
use tracing::{debug, info};

/// Separator between source blocks, and between non-adjacent passages of
/// one source.
const BLOCK_SEPARATOR: &str = "\n\n";

/// Rough token count: whitespace-separated words times 1.3, rounded down.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words as f64 * 1.3) as usize
}

/// Render fragments of one document under a single provenance header.
///
/// `fragments` must all belong to the same document. They are sorted by
/// position; a fragment starting at or before the end of the previous one
/// contributes only the text past that end.
pub fn format_source_block(fragments: &[&Fragment]) -> String {
    let mut ordered: Vec<&Fragment> = fragments.to_vec();
    ordered.sort_by_key(|f| (f.start, f.id.seq));
    let Some(first) = ordered.first() else {
        return String::new();
    };

    let mut body = String::new();
    let mut covered_to: Option<usize> = None;
    for fragment in &ordered {
        match covered_to {
            Some(end) if fragment.start <= end => {
                if fragment.end > end {
                    let fresh = fragment.text.get(end - fragment.start..).unwrap_or_default();
                    body.push_str(fresh);
                }
            }
            _ => {
                let kept = body.trim_end().len();
                body.truncate(kept);
                if !body.is_empty() {
                    body.push_str(BLOCK_SEPARATOR);
                }
                body.push_str(fragment.text.trim_start());
            }
        }
        covered_to = Some(covered_to.map_or(fragment.end, |end| end.max(fragment.end)));
    }
    format!("### Source: {}\n{}", first.source, body.trim_end())
}

/// Render `selected` as source blocks, ordered by each document's first
/// appearance in `selected`.
fn render(selected: &[ScoredFragment]) -> String {
    let mut groups: Vec<Vec<&Fragment>> = Vec::new();
    for hit in selected {
        let fragment = &hit.fragment;
        match groups
            .iter_mut()
            .find(|g| g[0].id.document_id == fragment.id.document_id)
        {
            Some(group) => group.push(fragment),
            None => groups.push(vec![fragment]),
        }
    }
    groups
        .iter()
        .map(|group| format_source_block(group))
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR)
}

/// A context block plus the fragments it was built from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    /// Rendered block for the prompt. Empty when nothing fit.
    pub block: String,
    /// Included fragments, best first, for citations.
    pub fragments: Vec<ScoredFragment>,
    /// [`estimate_tokens`] of `block`.
    pub estimated_tokens: usize,
}

impl AssembledContext {
    /// Whether no context was found or none fit the budget.
    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }
}

/// Builds context blocks from a shared [`VectorIndex`].
#[derive(Clone)]
pub struct ContextAssembler {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    top_k: usize,
    min_relevance: f32,
}

impl ContextAssembler {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        top_k: usize,
        min_relevance: f32,
    ) -> Self {
        Self {
            index,
            embedder,
            top_k,
            min_relevance,
        }
    }

    /// Assemble context for `query` within `token_budget`.
    ///
    /// An empty index or a zero budget yields an empty block without
    /// touching the embedder.
    ///
    /// # Errors
    ///
    /// Embedding failures ([`crate::ChatError::ModelUnavailable`]) and query
    /// dimension errors are returned; running out of budget is not an error.
    pub async fn assemble(&self, query: &str, token_budget: usize) -> Result<AssembledContext> {
        self.assemble_filtered(query, token_budget, &QueryFilter::all())
            .await
    }

    /// Like [`ContextAssembler::assemble`] but restricted to `filter`.
    ///
    /// # Errors
    ///
    /// As for [`ContextAssembler::assemble`].
    pub async fn assemble_filtered(
        &self,
        query: &str,
        token_budget: usize,
        filter: &QueryFilter,
    ) -> Result<AssembledContext> {
        if token_budget == 0 || self.index.is_empty() {
            return Ok(AssembledContext::default());
        }

        let vector = self.embedder.embed(query).await?;
        let hits = self.index.query_filtered(&vector, self.top_k, filter)?;
        let retrieved = hits.len();

        let mut context = AssembledContext::default();
        for hit in hits.into_iter().filter(|h| h.score >= self.min_relevance) {
            context.fragments.push(hit);
            let candidate = render(&context.fragments);
            let tokens = estimate_tokens(&candidate);
            if tokens > token_budget {
                debug!(tokens, token_budget, "next fragment exceeds budget");
                context.fragments.pop();
                break;
            }
            context.block = candidate;
            context.estimated_tokens = tokens;
        }

        info!(
            retrieved,
            included = context.fragments.len(),
            tokens = context.estimated_tokens,
            top_score = context.fragments.first().map(|f| f.score),
            "assembled context"
        );
        Ok(context)
    }
}
