//! The hybrid retrieval facade.
//!
//! [`Retriever::hybrid`] embeds the query, searches the vector index and the
//! full-text store concurrently, fuses both candidate lists and hydrates the
//! survivors with their text. Every failure along the way degrades one leg
//! and is reported as a [`SearchDiagnostic`]; the query itself never errors.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regla_core::{
    Candidate, Chunk, ChunkMeta, FusionConfig, IngestConfig, ProviderKind, ReglaConfig,
    ReglaError, Result, RetrievalConfig, RetrievedChunk, SearchDiagnostic, SearchResponse,
};
use regla_embed::{embed_batch_within, select_provider, EmbeddingProvider, ProbeOutcome};
use regla_index::{
    generated_chunk_id, persist, AddReport, IndexPaths, IndexStats, SharedIndex, VectorIndex,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chunker::chunk_document;
use crate::fusion::{apply_threshold, fuse, rerank};
use crate::store::{DocumentStore, SqliteDocumentStore, StoreStats};
use crate::walker::walk_corpus;

/// Per-query knobs for [`Retriever::hybrid`].
///
/// # Examples
///
/// ```
/// use regla_retrieval::HybridParams;
///
/// let params = HybridParams::default();
/// assert_eq!((params.k_vec, params.k_lex, params.final_k), (12, 12, 6));
/// assert_eq!(params.similarity_threshold, 0.7);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridParams {
    /// Semantic candidates kept after threshold and rerank.
    pub k_vec: usize,
    /// Full-text candidates requested.
    pub k_lex: usize,
    /// Results returned.
    pub final_k: usize,
    /// Minimum cosine similarity for a semantic candidate.
    pub similarity_threshold: f32,
}

impl Default for HybridParams {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

impl HybridParams {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            k_vec: config.k_vec,
            k_lex: config.k_lex,
            final_k: config.final_k,
            similarity_threshold: config.similarity_threshold,
        }
    }
}

/// What a full rebuild produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub documents: usize,
    pub chunks: usize,
    pub dimension: usize,
    /// Whether the new index reached disk.
    pub persisted: bool,
    /// Copy of the previous vector artifact, if one existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

/// Combined view for `stats` and `doctor`.
#[derive(Debug, Clone, Serialize)]
pub struct RetrieverStats {
    pub provider: ProviderKind,
    pub model: String,
    pub dimension: usize,
    pub index: IndexStats,
    pub store: StoreStats,
}

#[derive(Debug, Default)]
struct SemanticLeg {
    candidates: Vec<Candidate>,
    /// Vector hits discarded by the similarity threshold.
    below_threshold: HashSet<String>,
    diagnostics: Vec<SearchDiagnostic>,
}

impl SemanticLeg {
    fn degraded(diagnostic: SearchDiagnostic) -> Self {
        Self {
            diagnostics: vec![diagnostic],
            ..Self::default()
        }
    }
}

/// Hybrid semantic + lexical retriever.
pub struct Retriever {
    index: Arc<SharedIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn DocumentStore>,
    retrieval: RetrievalConfig,
    fusion: FusionConfig,
    ingest: IngestConfig,
    batch_size: usize,
    embed_timeout: Duration,
    outcomes: Vec<ProbeOutcome>,
    /// Serializes adds and rebuilds so backups and store writes never interleave.
    admin: Mutex<()>,
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("provider", &self.provider.kind())
            .field("index", &self.index)
            .field("retrieval", &self.retrieval)
            .finish_non_exhaustive()
    }
}

impl Retriever {
    /// Assemble a retriever from already-built parts.
    pub fn new(
        index: Arc<SharedIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn DocumentStore>,
        config: &ReglaConfig,
    ) -> Self {
        Self {
            index,
            provider,
            store,
            retrieval: config.retrieval.clone(),
            fusion: config.fusion.clone(),
            ingest: config.ingest.clone(),
            batch_size: config.embedding.batch_size.max(1),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs.max(1)),
            outcomes: Vec::new(),
            admin: Mutex::new(()),
        }
    }

    /// Select a provider, load the index and open the document store as
    /// described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::Database`] if the store cannot be opened. A
    /// missing index or unavailable provider is not an error.
    pub async fn from_config(config: &ReglaConfig) -> Result<Self> {
        let selection = select_provider(&config.embedding).await;
        let store = SqliteDocumentStore::open(&config.store.db_path)?;
        let index = SharedIndex::open(IndexPaths::from_config(&config.index));

        let mut retriever = Self::new(
            Arc::new(index),
            selection.provider,
            Arc::new(store),
            config,
        );
        retriever.outcomes = selection.outcomes;
        Ok(retriever)
    }

    /// Deadline for embedding a query.
    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    /// How the active provider was chosen (empty when built with [`Retriever::new`]).
    pub fn provider_outcomes(&self) -> &[ProbeOutcome] {
        &self.outcomes
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn index(&self) -> &Arc<SharedIndex> {
        &self.index
    }

    /// Default parameters from configuration.
    pub fn default_params(&self) -> HybridParams {
        HybridParams::from_config(&self.retrieval)
    }

    /// Configured embedding batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run a hybrid query.
    ///
    /// Returns at most `params.final_k` results with no repeated `chunk_id`.
    /// Missing index, unavailable or failing provider, dimension mismatch
    /// and full-text failures each leave their leg empty and add a
    /// diagnostic; with both legs empty the result list is empty.
    pub async fn hybrid(&self, query: &str, params: &HybridParams) -> SearchResponse {
        let query = query.trim();
        let mut response = SearchResponse::default();
        if query.is_empty() || params.final_k == 0 {
            response.diagnostics.push(SearchDiagnostic::NoCandidates);
            return response;
        }

        let (semantic_leg, lexical_leg) = tokio::join!(
            self.semantic_leg(query, params),
            self.lexical_leg(query, params.k_lex)
        );
        let SemanticLeg {
            candidates: semantic,
            below_threshold,
            diagnostics,
        } = semantic_leg;
        response.diagnostics.extend(diagnostics);

        let (mut lexical, mut lexical_texts) = match lexical_leg {
            Ok(leg) => leg,
            Err(e) => {
                warn!(error = %e, "full-text search failed; semantic-only");
                response.diagnostics.push(SearchDiagnostic::LexicalFailed {
                    reason: e.to_string(),
                });
                (Vec::new(), HashMap::new())
            }
        };

        if !below_threshold.is_empty() {
            lexical.retain(|c| !below_threshold.contains(c.chunk_id()));
        }

        if semantic.is_empty() && lexical.is_empty() {
            response.diagnostics.push(SearchDiagnostic::NoCandidates);
            return response;
        }

        debug!(
            semantic = semantic.len(),
            lexical = lexical.len(),
            "fusing candidates"
        );
        let fused = fuse(semantic, lexical, params.final_k, &self.fusion);

        let ids: Vec<String> = fused.iter().map(|c| c.meta.chunk_id.clone()).collect();
        let mut texts = match self.store.fetch_texts(&ids).await {
            Ok(texts) => texts,
            Err(e) => {
                warn!(error = %e, "text hydration failed");
                response.diagnostics.push(SearchDiagnostic::HydrationFailed {
                    reason: e.to_string(),
                });
                HashMap::new()
            }
        };

        response.results = fused
            .into_iter()
            .map(|candidate| {
                let text = texts
                    .remove(candidate.chunk_id())
                    .or_else(|| lexical_texts.remove(candidate.chunk_id()))
                    .unwrap_or_else(|| {
                        warn!(chunk_id = candidate.chunk_id(), "no text stored for chunk");
                        String::new()
                    });
                RetrievedChunk { candidate, text }
            })
            .collect();
        response
    }

    async fn semantic_leg(&self, query: &str, params: &HybridParams) -> SemanticLeg {
        if !self.provider.is_available() {
            debug!("no embedding provider; skipping semantic search");
            return SemanticLeg::degraded(SearchDiagnostic::ProviderUnavailable);
        }
        if let Some(index) = self.index.dimension().await {
            let provider = self.provider.dimension();
            if index != provider {
                warn!(index, provider, "provider dimension does not match index; lexical-only");
                return SemanticLeg::degraded(SearchDiagnostic::DimensionMismatch {
                    index,
                    provider,
                });
            }
        }

        let embedded = tokio::time::timeout(self.embed_timeout, self.provider.embed(query)).await;
        let vector = match embedded {
            Ok(Ok(vector)) => vector,
            Ok(Err(ReglaError::Timeout { millis, .. })) => {
                warn!(millis, "query embedding timed out; lexical-only");
                return SemanticLeg::degraded(SearchDiagnostic::ProviderTimeout { millis });
            }
            Ok(Err(e)) => {
                warn!(error = %e, "query embedding failed; lexical-only");
                return SemanticLeg::degraded(SearchDiagnostic::ProviderFailed {
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                let millis = self.embed_timeout.as_millis() as u64;
                warn!(millis, "query embedding timed out; lexical-only");
                return SemanticLeg::degraded(SearchDiagnostic::ProviderTimeout { millis });
            }
        };

        let k = params
            .k_vec
            .saturating_mul(self.retrieval.oversample.max(1));
        let search = self.index.search(&vector, k).await;
        let candidates = search
            .hits
            .into_iter()
            .map(|hit| Candidate::semantic(hit.meta, hit.score))
            .collect();

        let (kept, below_threshold) = apply_threshold(candidates, params.similarity_threshold);
        let mut ranked = rerank(kept, query, &self.fusion);
        ranked.truncate(params.k_vec);
        SemanticLeg {
            candidates: ranked,
            below_threshold,
            diagnostics: search.diagnostic.into_iter().collect(),
        }
    }

    async fn lexical_leg(
        &self,
        query: &str,
        k_lex: usize,
    ) -> Result<(Vec<Candidate>, HashMap<String, String>)> {
        let hits = self.store.fts_search(query, k_lex).await?;
        let mut texts = HashMap::with_capacity(hits.len());
        let candidates = hits
            .into_iter()
            .map(|hit| {
                texts.insert(hit.meta.chunk_id.clone(), hit.text);
                Candidate::lexical(hit.meta, hit.snippet)
            })
            .collect();
        Ok((candidates, texts))
    }

    /// Store `texts` and append their embeddings to the index.
    ///
    /// Records without a `chunk_id` get a derived one. Text always reaches
    /// the document store, so it is searchable lexically even when the
    /// provider is unavailable or a batch fails to embed; see
    /// [`SharedIndex::add`] for the vector side.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::InvalidInput`] if `texts` and `metas` differ in
    /// length, or [`ReglaError::Database`] if the store write fails.
    pub async fn add_to_index(
        &self,
        texts: &[String],
        metas: Vec<ChunkMeta>,
        batch_size: usize,
    ) -> Result<AddReport> {
        if texts.len() != metas.len() {
            return Err(ReglaError::InvalidInput(format!(
                "{} texts but {} metadata records",
                texts.len(),
                metas.len()
            )));
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
        let chunks: Vec<Chunk> = metas
            .iter()
            .cloned()
            .zip(texts.iter().cloned())
            .map(|(meta, text)| Chunk { meta, text })
            .collect();

        let _admin = self.admin.lock().await;
        self.store.upsert_chunks(&chunks).await?;
        self.index
            .add(self.provider.as_ref(), texts, metas, batch_size, self.embed_timeout)
            .await
    }

    /// Re-chunk and re-embed every document under `data_dir`, then replace
    /// the store contents and the vector index.
    ///
    /// Existing index artifacts are copied to `*.backup` first. Nothing is
    /// replaced unless every batch embeds within the embedding timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::Provider`] if no provider is available or any
    /// batch fails, [`ReglaError::Timeout`] if a batch outlives the deadline,
    /// [`ReglaError::FileNotFound`] if `data_dir` is missing,
    /// [`ReglaError::InvalidInput`] if it holds no documents, and store or
    /// persistence errors as they occur.
    pub async fn rebuild_index(&self, data_dir: &Path) -> Result<RebuildReport> {
        self.require_provider()?;
        let _admin = self.admin.lock().await;

        let root = data_dir.to_path_buf();
        let extensions = self.ingest.extensions.clone();
        let documents = tokio::task::spawn_blocking(move || walk_corpus(&root, &extensions))
            .await
            .map_err(|e| {
                ReglaError::Io(std::io::Error::other(format!("corpus walk failed: {e}")))
            })??;

        let chunks: Vec<Chunk> = documents
            .iter()
            .flat_map(|doc| chunk_document(&doc.doc_id(), &doc.content, self.ingest.max_chars))
            .collect();
        if chunks.is_empty() {
            return Err(ReglaError::InvalidInput(format!(
                "no documents to index under {}",
                data_dir.display()
            )));
        }
        info!(
            documents = documents.len(),
            chunks = chunks.len(),
            "corpus chunked; embedding"
        );

        let index = self.embed_all(&chunks).await?;
        let dimension = index.dimension();

        let backup = persist::backup(self.index.paths())?;
        self.store.replace_all(&chunks).await?;
        let persisted = self.index.replace(index).await;

        info!(
            documents = documents.len(),
            chunks = chunks.len(),
            dimension,
            persisted,
            "index rebuilt"
        );
        Ok(RebuildReport {
            documents: documents.len(),
            chunks: chunks.len(),
            dimension,
            persisted,
            backup,
        })
    }

    /// Re-embed every chunk already in the document store and replace the
    /// vector index with the result.
    ///
    /// This is the way out of a dimension mismatch after switching provider:
    /// the store keeps the text, so no corpus directory is needed. The store
    /// itself is not modified. Existing index artifacts are copied to
    /// `*.backup` first, and nothing is replaced unless every batch embeds.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::Provider`] if no provider is available or any
    /// batch fails, [`ReglaError::Timeout`] if a batch outlives the deadline,
    /// [`ReglaError::InvalidInput`] if the store is empty, and store or
    /// persistence errors as they occur.
    pub async fn reembed_index(&self) -> Result<RebuildReport> {
        self.require_provider()?;
        let _admin = self.admin.lock().await;

        let chunks = self.store.all_chunks().await?;
        if chunks.is_empty() {
            return Err(ReglaError::InvalidInput(
                "document store is empty; nothing to re-embed".into(),
            ));
        }
        let documents = chunks
            .iter()
            .map(|c| c.meta.doc_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        info!(documents, chunks = chunks.len(), "re-embedding stored chunks");

        let index = self.embed_all(&chunks).await?;
        let dimension = index.dimension();
        let backup = persist::backup(self.index.paths())?;
        let persisted = self.index.replace(index).await;

        info!(
            documents,
            chunks = chunks.len(),
            dimension,
            persisted,
            "index re-embedded from store"
        );
        Ok(RebuildReport {
            documents,
            chunks: chunks.len(),
            dimension,
            persisted,
            backup,
        })
    }

    fn require_provider(&self) -> Result<()> {
        if self.provider.is_available() {
            Ok(())
        } else {
            Err(ReglaError::Provider(
                "no embedding provider available; cannot rebuild the vector index".into(),
            ))
        }
    }

    /// Embed every chunk in configured batches into a fresh index. Any failed,
    /// short or timed-out batch aborts.
    async fn embed_all(&self, chunks: &[Chunk]) -> Result<VectorIndex> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for (batch_no, batch) in texts.chunks(self.batch_size).enumerate() {
            let embedded =
                match embed_batch_within(self.provider.as_ref(), batch, self.embed_timeout).await {
                    Ok(embedded) => embedded,
                    Err(e @ ReglaError::Timeout { .. }) => {
                        warn!(batch = batch_no, error = %e, "embedding batch timed out; aborting");
                        return Err(e);
                    }
                    Err(e) => {
                        return Err(ReglaError::Provider(format!(
                            "batch {batch_no} failed, rebuild aborted: {e}"
                        )))
                    }
                };
            if embedded.len() != batch.len() {
                return Err(ReglaError::Provider(format!(
                    "batch {batch_no} returned {} vectors for {} texts, rebuild aborted",
                    embedded.len(),
                    batch.len()
                )));
            }
            vectors.extend(embedded);
            debug!(batch = batch_no, done = vectors.len(), "batch embedded");
        }

        let metas = chunks.iter().map(|c| c.meta.clone()).collect();
        VectorIndex::build(self.provider.dimension(), vectors, metas)
    }

    /// Drop index entries shadowed by later re-adds.
    pub async fn compact_index(&self) -> Result<usize> {
        let _admin = self.admin.lock().await;
        self.index.compact().await
    }

    pub async fn stats(&self) -> Result<RetrieverStats> {
        Ok(RetrieverStats {
            provider: self.provider.kind(),
            model: self.provider.model().to_string(),
            dimension: self.provider.dimension(),
            index: self.index.stats().await,
            store: self.store.store_stats().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use regla_embed::testing::HashingProvider;
    use regla_embed::NullProvider;

    use super::*;

    fn retriever(provider: Arc<dyn EmbeddingProvider>) -> (tempfile::TempDir, Retriever) {
        let dir = tempfile::tempdir().unwrap();
        let index = SharedIndex::empty(IndexPaths::in_dir(dir.path()));
        let store = SqliteDocumentStore::in_memory().unwrap();
        let retriever = Retriever::new(
            Arc::new(index),
            provider,
            Arc::new(store),
            &ReglaConfig::default(),
        );
        (dir, retriever)
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let (_dir, retriever) = retriever(Arc::new(HashingProvider::new(64)));
        let response = retriever.hybrid("   ", &HybridParams::default()).await;
        assert!(response.results.is_empty());
        assert_eq!(response.diagnostics, vec![SearchDiagnostic::NoCandidates]);
    }

    #[tokio::test]
    async fn add_generates_ids_for_store_and_index() {
        let (_dir, retriever) = retriever(Arc::new(HashingProvider::new(64)));
        let report = retriever
            .add_to_index(
                &["Requisitos de permisos".to_string()],
                vec![ChunkMeta {
                    doc_id: "tomo-1".into(),
                    ..ChunkMeta::default()
                }],
                64,
            )
            .await
            .unwrap();
        assert_eq!(report.added, 1);

        let response = retriever
            .hybrid("requisitos de permisos", &HybridParams::default())
            .await;
        let ids: Vec<&str> = response.results.iter().map(|r| r.candidate.chunk_id()).collect();
        assert_eq!(ids, [generated_chunk_id("tomo-1", "Requisitos de permisos")]);
        assert_eq!(response.results[0].text, "Requisitos de permisos");
    }

    #[tokio::test]
    async fn rebuild_requires_a_provider() {
        let (dir, retriever) = retriever(Arc::new(NullProvider));
        let err = retriever.rebuild_index(dir.path()).await.unwrap_err();
        assert!(matches!(err, ReglaError::Provider(_)));
    }

    #[tokio::test]
    async fn mismatched_lengths_are_rejected_before_storing() {
        let (_dir, retriever) = retriever(Arc::new(HashingProvider::new(64)));
        let err = retriever
            .add_to_index(&["a".to_string()], Vec::new(), 64)
            .await
            .unwrap_err();
        assert!(matches!(err, ReglaError::InvalidInput(_)));
        assert_eq!(retriever.stats().await.unwrap().store.chunks, 0);
    }
}
