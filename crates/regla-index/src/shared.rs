//! The process-wide index handle.
//!
//! Searches take the read side of a [`tokio::sync::RwLock`]; appends,
//! replacement and compaction take the write side and hold it across the
//! disk write, so readers see either the old or the new index, never a mix.

use std::path::PathBuf;
use std::time::Duration;

use regla_core::{ChunkMeta, ReglaError, Result, SearchDiagnostic};
use regla_embed::{embed_batch_within, EmbeddingProvider};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::index::{VectorHit, VectorIndex};
use crate::persist::{self, IndexPaths};

#[derive(Debug, Default)]
struct State {
    index: Option<VectorIndex>,
    /// Why no index is loaded, if none is.
    unavailable: Option<String>,
    /// Repairs applied during the last load.
    warnings: Vec<String>,
    /// Artifacts exist on disk but could not be read.
    load_failed: bool,
}

/// Outcome of a vector search; `diagnostic` is set whenever the search could
/// not run normally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorSearch {
    pub hits: Vec<VectorHit>,
    pub diagnostic: Option<SearchDiagnostic>,
}

/// What an incremental add did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddReport {
    pub requested: usize,
    pub added: usize,
    /// Entries dropped because their batch failed or timed out.
    pub skipped: usize,
    pub persisted: bool,
    /// Copy of an unreadable artifact taken before it was overwritten.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    /// Set when the whole add was refused (no provider, dimension mismatch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

/// Index statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub dimension: Option<usize>,
    pub entries: usize,
    pub live_entries: usize,
    pub shadowed_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Shared, lock-protected vector index bound to its on-disk location.
#[derive(Debug)]
pub struct SharedIndex {
    paths: IndexPaths,
    state: RwLock<State>,
}

impl SharedIndex {
    /// Load the index at `paths`.
    ///
    /// Never fails: a missing or corrupt artifact leaves the handle empty with
    /// a recorded reason, and searches degrade to an `IndexUnavailable`
    /// diagnostic.
    pub fn open(paths: IndexPaths) -> Self {
        let state = load_state(&paths);
        Self {
            paths,
            state: RwLock::new(state),
        }
    }

    /// A handle with no index loaded; the first add or replace creates one.
    pub fn empty(paths: IndexPaths) -> Self {
        Self {
            paths,
            state: RwLock::new(State {
                unavailable: Some("no index built yet".into()),
                ..State::default()
            }),
        }
    }

    pub fn paths(&self) -> &IndexPaths {
        &self.paths
    }

    /// Width of the loaded index, if any.
    pub async fn dimension(&self) -> Option<usize> {
        self.state.read().await.index.as_ref().map(VectorIndex::dimension)
    }

    /// Top-`k` neighbours of `query`.
    ///
    /// A missing or empty index, or a query of the wrong width, yields no hits
    /// and a diagnostic instead of an error.
    pub async fn search(&self, query: &[f32], k: usize) -> VectorSearch {
        let state = self.state.read().await;
        let Some(index) = state.index.as_ref() else {
            let reason = state
                .unavailable
                .clone()
                .unwrap_or_else(|| "not loaded".into());
            return VectorSearch {
                hits: Vec::new(),
                diagnostic: Some(SearchDiagnostic::IndexUnavailable { reason }),
            };
        };

        if index.dimension() != query.len() {
            warn!(
                index = index.dimension(),
                query = query.len(),
                "query dimension does not match index; skipping vector search"
            );
            return VectorSearch {
                hits: Vec::new(),
                diagnostic: Some(SearchDiagnostic::DimensionMismatch {
                    index: index.dimension(),
                    provider: query.len(),
                }),
            };
        }

        if index.is_empty() {
            return VectorSearch {
                hits: Vec::new(),
                diagnostic: Some(SearchDiagnostic::IndexEmpty),
            };
        }

        match index.search(query, k) {
            Ok(hits) => VectorSearch {
                hits,
                diagnostic: None,
            },
            Err(e) => VectorSearch {
                hits: Vec::new(),
                diagnostic: Some(SearchDiagnostic::IndexUnavailable {
                    reason: e.to_string(),
                }),
            },
        }
    }

    /// Embed `texts` in batches of `batch_size` and append them.
    ///
    /// Embedding happens before the write lock is taken. A batch whose
    /// embedding call fails or outlives `embed_timeout` is skipped together
    /// with its metadata. Records
    /// with an empty `chunk_id` get one derived from their doc id and text.
    /// The index is persisted afterwards; a persistence failure keeps the
    /// in-memory change and is reported through [`AddReport::persisted`].
    ///
    /// An unavailable provider or a dimension mismatch makes the whole call a
    /// logged no-op. If the artifacts on disk were unreadable, they are copied
    /// to `*.backup` before the first write replaces them; when that copy
    /// fails the add is refused.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::InvalidInput`] if `texts` and `metas` differ in
    /// length.
    pub async fn add(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
        metas: Vec<ChunkMeta>,
        batch_size: usize,
        embed_timeout: Duration,
    ) -> Result<AddReport> {
        if texts.len() != metas.len() {
            return Err(ReglaError::InvalidInput(format!(
                "{} texts but {} metadata records",
                texts.len(),
                metas.len()
            )));
        }

        let mut report = AddReport {
            requested: texts.len(),
            ..AddReport::default()
        };

        if !provider.is_available() {
            warn!(
                provider = %provider.kind(),
                "embedding provider unavailable; add skipped"
            );
            report.rejected = Some("embedding provider unavailable".into());
            return Ok(report);
        }
        if let Some(dimension) = self.dimension().await {
            if dimension != provider.dimension() {
                warn!(
                    index = dimension,
                    provider = provider.dimension(),
                    "provider dimension does not match index; add skipped"
                );
                report.rejected = Some(
                    ReglaError::DimensionMismatch {
                        index: dimension,
                        provider: provider.dimension(),
                    }
                    .to_string(),
                );
                return Ok(report);
            }
        }

        let metas: Vec<ChunkMeta> = metas
            .into_iter()
            .zip(texts)
            .map(|(mut meta, text)| {
                if meta.chunk_id.is_empty() {
                    meta.chunk_id = generated_chunk_id(&meta.doc_id, text);
                }
                meta
            })
            .collect();

        let batch_size = batch_size.max(1);
        let mut embedded: Vec<(Vec<f32>, ChunkMeta)> = Vec::with_capacity(texts.len());
        for (batch_no, (batch, batch_metas)) in texts
            .chunks(batch_size)
            .zip(metas.chunks(batch_size))
            .enumerate()
        {
            match embed_batch_within(provider, batch, embed_timeout).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    debug!(batch = batch_no, size = batch.len(), "batch embedded");
                    embedded.extend(vectors.into_iter().zip(batch_metas.iter().cloned()));
                }
                Ok(vectors) => {
                    warn!(
                        batch = batch_no,
                        expected = batch.len(),
                        got = vectors.len(),
                        "provider returned wrong number of vectors; batch skipped"
                    );
                    report.skipped += batch.len();
                }
                Err(e) => {
                    warn!(batch = batch_no, error = %e, "embedding batch failed; skipped");
                    report.skipped += batch.len();
                }
            }
        }

        if embedded.is_empty() {
            warn!(skipped = report.skipped, "no batch embedded; index unchanged");
            return Ok(report);
        }

        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if state.index.is_none() {
            if state.load_failed {
                match persist::backup(&self.paths) {
                    Ok(backup) => {
                        warn!(
                            backup = ?backup,
                            "unreadable index backed up; starting a new one"
                        );
                        report.backup = backup;
                    }
                    Err(e) => {
                        warn!(error = %e, "unreadable index could not be backed up; add refused");
                        report.rejected = Some(e.to_string());
                        report.skipped = report.requested;
                        return Ok(report);
                    }
                }
            }
            state.unavailable = None;
            state.load_failed = false;
        }
        let index = state
            .index
            .get_or_insert_with(|| VectorIndex::new(provider.dimension()));
        if index.dimension() != provider.dimension() {
            report.rejected = Some(
                ReglaError::DimensionMismatch {
                    index: index.dimension(),
                    provider: provider.dimension(),
                }
                .to_string(),
            );
            report.skipped = report.requested;
            return Ok(report);
        }

        for (vector, meta) in embedded {
            match index.push(&vector, meta) {
                Ok(()) => report.added += 1,
                Err(e) => {
                    warn!(error = %e, "vector rejected");
                    report.skipped += 1;
                }
            }
        }

        report.persisted = match persist::save(index, &self.paths) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "index persistence failed; change kept in memory");
                false
            }
        };
        info!(
            added = report.added,
            skipped = report.skipped,
            entries = index.len(),
            "index updated"
        );
        Ok(report)
    }

    /// Swap in a freshly built index and persist it.
    ///
    /// Returns whether the new index reached disk; on failure it still serves
    /// searches from memory.
    pub async fn replace(&self, index: VectorIndex) -> bool {
        let mut state = self.state.write().await;
        let persisted = match persist::save(&index, &self.paths) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "index persistence failed; new index kept in memory");
                false
            }
        };
        info!(entries = index.len(), dimension = index.dimension(), "index replaced");
        *state = State {
            index: Some(index),
            ..State::default()
        };
        persisted
    }

    /// Drop shadowed entries and persist. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::IndexUnavailable`] if no index is loaded, or
    /// [`ReglaError::Persistence`] if the compacted index cannot be written.
    pub async fn compact(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        let index = state
            .index
            .as_mut()
            .ok_or_else(|| ReglaError::IndexUnavailable("no index loaded".into()))?;
        let removed = index.compact();
        if removed > 0 {
            persist::save(index, &self.paths)?;
        }
        info!(removed, entries = index.len(), "index compacted");
        Ok(removed)
    }

    /// Write the current index to disk.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::IndexUnavailable`] if no index is loaded, or
    /// [`ReglaError::Persistence`] on write failure.
    pub async fn persist(&self) -> Result<()> {
        let state = self.state.write().await;
        let index = state
            .index
            .as_ref()
            .ok_or_else(|| ReglaError::IndexUnavailable("no index loaded".into()))?;
        persist::save(index, &self.paths)
    }

    /// Re-read the artifacts from disk, discarding in-memory state.
    pub async fn reload(&self) {
        let fresh = load_state(&self.paths);
        *self.state.write().await = fresh;
    }

    pub async fn stats(&self) -> IndexStats {
        let state = self.state.read().await;
        match state.index.as_ref() {
            Some(index) => IndexStats {
                dimension: Some(index.dimension()),
                entries: index.len(),
                live_entries: index.live_len(),
                shadowed_entries: index.len() - index.live_len(),
                unavailable: None,
                warnings: state.warnings.clone(),
            },
            None => IndexStats {
                unavailable: state.unavailable.clone(),
                ..IndexStats::default()
            },
        }
    }
}

fn load_state(paths: &IndexPaths) -> State {
    match persist::load(paths) {
        Ok(Some(loaded)) => {
            info!(
                path = %paths.vectors.display(),
                entries = loaded.index.len(),
                dimension = loaded.index.dimension(),
                "vector index loaded"
            );
            State {
                index: Some(loaded.index),
                warnings: loaded.warnings,
                ..State::default()
            }
        }
        Ok(None) => {
            warn!(path = %paths.vectors.display(), "vector index not found; lexical-only until built");
            State {
                unavailable: Some(format!("{} not found", paths.vectors.display())),
                ..State::default()
            }
        }
        Err(e) => {
            warn!(error = %e, "vector index unreadable; lexical-only until rebuilt");
            State {
                unavailable: Some(e.to_string()),
                load_failed: true,
                ..State::default()
            }
        }
    }
}

/// Stable id for a record added without one: the first 8 bytes of
/// SHA-256 over `doc_id` and `text`, hex-encoded.
pub fn generated_chunk_id(doc_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
