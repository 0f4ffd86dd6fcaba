//! In-memory vector index with snapshot-consistent reads.
//!
//! The index holds documents, their fragments and one L2-normalized vector
//! per fragment. All state lives in an immutable [`Arc`] snapshot behind a
//! `RwLock`:
//!
//! - a query takes the read lock only long enough to clone the `Arc`, then
//!   scans without holding any lock, so a slow scan never blocks writers and
//!   never observes a half-applied insert;
//! - a write takes the write lock, applies its change to a copy and
//!   publishes the copy only if the whole change succeeded. Readers holding
//!   the previous snapshot keep it until they drop it.
//!
//! Search is a brute-force linear scan: one dot product per stored vector.

use crate::error::{ChatError, Result};
use crate::rag::document::{Document, Fragment, FragmentId};
use crate::rag::embedding::{EmbeddingVector, dot, l2_normalize};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Snapshot file format version.
const SNAPSHOT_VERSION: u32 = 1;

/// A fragment returned by a query, with its cosine similarity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredFragment {
    pub fragment: Fragment,
    pub score: f32,
}

/// Restricts a query to a subset of documents.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    document_ids: Option<HashSet<String>>,
}

impl QueryFilter {
    /// Match every document.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only the given document ids.
    pub fn documents<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            document_ids: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    fn matches(&self, document_id: &str) -> bool {
        self.document_ids
            .as_ref()
            .is_none_or(|ids| ids.contains(document_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    fragment: Fragment,
    vector: EmbeddingVector,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    dimension: Option<usize>,
    documents: Vec<Document>,
    entries: Vec<Entry>,
}

/// Brute-force cosine-similarity index.
#[derive(Debug)]
pub struct VectorIndex {
    snapshot: RwLock<Arc<Snapshot>>,
    max_fragments: usize,
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new(0)
    }
}

impl VectorIndex {
    /// Create an empty index. `max_fragments == 0` means unbounded.
    pub fn new(max_fragments: usize) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot {
                version: SNAPSHOT_VERSION,
                ..Default::default()
            })),
            max_fragments,
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply `f` to a private copy of the state and publish it only if `f`
    /// succeeds.
    ///
    /// Every call clones the whole snapshot, so a write costs O(N) in the
    /// number of stored fragments. Readers never block on a writer in
    /// exchange. Bulk loads go through [`VectorIndex::ingest_document`],
    /// which pays the clone once per document rather than once per fragment.
    fn update<T>(&self, f: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Snapshot::clone(&guard);
        let out = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }

    /// Vector dimension, fixed by the first successful insert and kept
    /// until [`VectorIndex::clear`]. Removing every document does not
    /// release it.
    pub fn dimension(&self) -> Option<usize> {
        self.current().dimension
    }

    /// Number of stored fragments.
    pub fn len(&self) -> usize {
        self.current().entries.len()
    }

    /// Whether no fragments are stored.
    pub fn is_empty(&self) -> bool {
        self.current().entries.is_empty()
    }

    /// Documents registered through [`VectorIndex::ingest_document`], in
    /// ingestion order.
    pub fn documents(&self) -> Vec<Document> {
        self.current().documents.clone()
    }

    /// Insert one fragment. Re-inserting an existing fragment id replaces
    /// its text and vector in place.
    ///
    /// # Errors
    ///
    /// [`ChatError::DimensionMismatch`] if the index is non-empty and the
    /// vector length differs from its dimension; [`ChatError::InvalidConfiguration`]
    /// if the fragment bound would be exceeded. The index is unchanged on error.
    ///
    /// Each call copies the current snapshot; inserting N fragments one at a
    /// time is quadratic. Prefer [`VectorIndex::ingest_document`] for batches.
    pub fn insert(&self, fragment: Fragment, vector: EmbeddingVector) -> Result<()> {
        self.update(|snap| {
            let vector = prepare(snap.dimension, vector)?;
            snap.dimension = Some(vector.len());
            match snap.entries.iter_mut().find(|e| e.fragment.id == fragment.id) {
                Some(existing) => {
                    existing.fragment = fragment;
                    existing.vector = vector;
                }
                None => {
                    check_bound(self.max_fragments, snap.entries.len() + 1)?;
                    snap.entries.push(Entry { fragment, vector });
                }
            }
            Ok(())
        })
    }

    /// Atomically replace everything stored for `document.id` with the given
    /// fragments.
    ///
    /// Either every fragment is inserted or none is: a dimension error on
    /// any vector rejects the whole document and leaves the index as it was.
    ///
    /// # Errors
    ///
    /// As for [`VectorIndex::insert`], plus [`ChatError::Index`] if a
    /// fragment belongs to a different document.
    pub fn ingest_document(
        &self,
        document: Document,
        items: Vec<(Fragment, EmbeddingVector)>,
    ) -> Result<usize> {
        self.update(|snap| {
            let doc_id = document.id.clone();
            snap.entries.retain(|e| e.fragment.id.document_id != doc_id);
            snap.documents.retain(|d| d.id != doc_id);

            let count = items.len();
            check_bound(self.max_fragments, snap.entries.len() + count)?;
            for (fragment, vector) in items {
                if fragment.id.document_id != doc_id {
                    return Err(ChatError::Index(format!(
                        "fragment {} does not belong to document {doc_id}",
                        fragment.id
                    )));
                }
                let vector = prepare(snap.dimension, vector)?;
                snap.dimension = Some(vector.len());
                snap.entries.push(Entry { fragment, vector });
            }
            snap.documents.push(document);
            Ok(count)
        })
    }

    /// Remove a document and all its fragments. Returns how many fragments
    /// were removed.
    pub fn remove_document(&self, document_id: &str) -> usize {
        self.update(|snap| {
            let before = snap.entries.len();
            snap.entries.retain(|e| e.fragment.id.document_id != document_id);
            snap.documents.retain(|d| d.id != document_id);
            Ok(before - snap.entries.len())
        })
        .unwrap_or(0)
    }

    /// Remove everything. The dimension is released as well.
    pub fn clear(&self) {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(Snapshot {
            version: SNAPSHOT_VERSION,
            ..Default::default()
        });
    }

    /// The `k` fragments most similar to `vector`, best first.
    ///
    /// Ties keep insertion order. `k` is clipped to the index size; an empty
    /// index yields an empty result.
    ///
    /// # Errors
    ///
    /// [`ChatError::DimensionMismatch`] if the query vector does not match a
    /// non-empty index.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredFragment>> {
        self.query_filtered(vector, k, &QueryFilter::all())
    }

    /// Like [`VectorIndex::query`] but only over documents accepted by
    /// `filter`.
    ///
    /// # Errors
    ///
    /// As for [`VectorIndex::query`].
    pub fn query_filtered(
        &self,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<ScoredFragment>> {
        let snap = self.current();
        let Some(dimension) = snap.dimension.filter(|_| !snap.entries.is_empty()) else {
            return Ok(Vec::new());
        };
        if vector.len() != dimension {
            return Err(ChatError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = vector.to_vec();
        l2_normalize(&mut query);

        let mut scored: Vec<(usize, f32)> = snap
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| filter.matches(&e.fragment.id.document_id))
            .map(|(i, e)| (i, dot(&query, &e.vector)))
            .collect();
        // Stable sort: equal scores stay in insertion order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        debug!(
            candidates = snap.entries.len(),
            returned = scored.len(),
            "vector query"
        );
        Ok(scored
            .into_iter()
            .map(|(i, score)| ScoredFragment {
                fragment: snap.entries[i].fragment.clone(),
                score,
            })
            .collect())
    }

    /// Fragment ids currently stored, in insertion order.
    pub fn fragment_ids(&self) -> Vec<FragmentId> {
        self.current()
            .entries
            .iter()
            .map(|e| e.fragment.id.clone())
            .collect()
    }

    /// Write the current snapshot to `path` as JSON, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let snap = self.current();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(&*snap).map_err(|e| ChatError::Index(e.to_string()))?;
        std::fs::write(path, json)?;
        info!(
            path = %path.display(),
            fragments = snap.entries.len(),
            "saved vector index"
        );
        Ok(())
    }

    /// Load an index previously written by [`VectorIndex::save_to_file`].
    ///
    /// Every vector is re-checked against the recorded dimension and
    /// re-normalized.
    ///
    /// # Errors
    ///
    /// [`ChatError::Index`] for unreadable or unknown formats,
    /// [`ChatError::DimensionMismatch`] for inconsistent vectors.
    pub fn load_from_file(path: &Path, max_fragments: usize) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let loaded: Snapshot =
            serde_json::from_slice(&bytes).map_err(|e| ChatError::Index(e.to_string()))?;
        if loaded.version != SNAPSHOT_VERSION {
            return Err(ChatError::Index(format!(
                "unsupported index version {}",
                loaded.version
            )));
        }
        check_bound(max_fragments, loaded.entries.len())?;

        let mut snap = Snapshot {
            version: SNAPSHOT_VERSION,
            dimension: None,
            documents: loaded.documents,
            entries: Vec::with_capacity(loaded.entries.len()),
        };
        let mut expected = loaded.dimension;
        for entry in loaded.entries {
            let vector = prepare(expected, entry.vector)?;
            expected = Some(vector.len());
            snap.entries.push(Entry {
                fragment: entry.fragment,
                vector,
            });
        }
        snap.dimension = expected;

        info!(
            path = %path.display(),
            fragments = snap.entries.len(),
            "loaded vector index"
        );
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snap)),
            max_fragments,
        })
    }
}

/// Check `vector` against the index dimension and normalize it.
fn prepare(dimension: Option<usize>, mut vector: EmbeddingVector) -> Result<EmbeddingVector> {
    match dimension {
        Some(expected) if expected != vector.len() => Err(ChatError::DimensionMismatch {
            expected,
            actual: vector.len(),
        }),
        _ if vector.is_empty() => Err(ChatError::Index("empty embedding vector".into())),
        _ => {
            l2_normalize(&mut vector);
            Ok(vector)
        }
    }
}

fn check_bound(max_fragments: usize, count: usize) -> Result<()> {
    if max_fragments > 0 && count > max_fragments {
        return Err(ChatError::InvalidConfiguration(format!(
            "index would hold {count} fragments, above rag.max_fragments = {max_fragments}"
        )));
    }
    Ok(())
}
