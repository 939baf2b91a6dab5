use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Embedding backends known to the provider chain.
///
/// # Examples
///
/// ```
/// use regla_core::ProviderKind;
///
/// let kind: ProviderKind = "openai".parse().unwrap();
/// assert_eq!(kind, ProviderKind::OpenAi);
/// assert_eq!(kind.to_string(), "openai");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Azure OpenAI deployment.
    Azure,
    /// OpenAI or any API speaking its embeddings protocol.
    #[serde(rename = "openai")]
    OpenAi,
    /// In-process model, no network.
    Local,
    /// Produces no vectors; retrieval runs lexical-only.
    Null,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Azure => write!(f, "azure"),
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Local => write!(f, "local"),
            ProviderKind::Null => write!(f, "null"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "azure" => Ok(ProviderKind::Azure),
            "openai" => Ok(ProviderKind::OpenAi),
            "local" => Ok(ProviderKind::Local),
            "null" | "none" => Ok(ProviderKind::Null),
            other => Err(format!("unknown embedding provider: {other}")),
        }
    }
}

/// Location metadata stored alongside every vector in the index.
///
/// The i-th record in the metadata file describes the i-th vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(default)]
    pub chunk_id: String,
    #[serde(default)]
    pub doc_id: String,
    /// Human-readable location, e.g. `Tomo 2 > Capítulo 5 > Regla 5.1`.
    #[serde(default)]
    pub heading_path: String,
    #[serde(default)]
    pub page_start: Option<u32>,
    #[serde(default)]
    pub page_end: Option<u32>,
}

impl ChunkMeta {
    /// Stand-in record for position `position` when real metadata is lost.
    ///
    /// # Examples
    ///
    /// ```
    /// use regla_core::ChunkMeta;
    ///
    /// let meta = ChunkMeta::placeholder(7);
    /// assert_eq!(meta.chunk_id, "7");
    /// assert!(meta.doc_id.is_empty());
    /// ```
    pub fn placeholder(position: usize) -> Self {
        Self {
            chunk_id: position.to_string(),
            ..Self::default()
        }
    }
}

/// A unit of retrievable text, as held by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(flatten)]
    pub meta: ChunkMeta,
    pub text: String,
}

/// Which leg of the hybrid search produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Semantic,
    Lexical,
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchType::Semantic => write!(f, "semantic"),
            SearchType::Lexical => write!(f, "lexical"),
        }
    }
}

/// A chunk reference flowing through rerank and fusion.
///
/// `score` is the cosine similarity for semantic hits and `0.0` for lexical
/// hits, which carry no comparable score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(flatten)]
    pub meta: ChunkMeta,
    pub score: f32,
    pub search_type: SearchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranked_score: Option<f32>,
    pub combined_score: f32,
    /// Highlighted excerpt from full-text search.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl Candidate {
    /// A vector-search hit.
    pub fn semantic(meta: ChunkMeta, score: f32) -> Self {
        Self {
            meta,
            score,
            search_type: SearchType::Semantic,
            reranked_score: None,
            combined_score: score,
            snippet: None,
        }
    }

    /// A full-text hit.
    pub fn lexical(meta: ChunkMeta, snippet: Option<String>) -> Self {
        Self {
            meta,
            score: 0.0,
            search_type: SearchType::Lexical,
            reranked_score: None,
            combined_score: 0.0,
            snippet,
        }
    }

    pub fn chunk_id(&self) -> &str {
        &self.meta.chunk_id
    }
}

/// A final, hydrated search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    #[serde(flatten)]
    pub candidate: Candidate,
    pub text: String,
}

/// Why a hybrid query returned less than it could have.
///
/// Every degraded path of the retriever records one of these instead of
/// failing the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchDiagnostic {
    /// No index has been loaded or built.
    IndexUnavailable { reason: String },
    /// The index exists but holds no vectors.
    IndexEmpty,
    /// Query and index vectors differ in width.
    DimensionMismatch { index: usize, provider: usize },
    /// The active provider cannot embed (null provider).
    ProviderUnavailable,
    /// Embedding the query failed.
    ProviderFailed { reason: String },
    /// Embedding the query exceeded its deadline.
    ProviderTimeout { millis: u64 },
    /// Full-text search failed.
    LexicalFailed { reason: String },
    /// Text could not be fetched for the final results.
    HydrationFailed { reason: String },
    /// Neither leg produced a candidate.
    NoCandidates,
}

impl fmt::Display for SearchDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchDiagnostic::IndexUnavailable { reason } => {
                write!(f, "vector index unavailable: {reason}")
            }
            SearchDiagnostic::IndexEmpty => write!(f, "vector index is empty"),
            SearchDiagnostic::DimensionMismatch { index, provider } => write!(
                f,
                "dimension mismatch: index {index}, provider {provider}; semantic search skipped"
            ),
            SearchDiagnostic::ProviderUnavailable => {
                write!(f, "no embedding provider available; lexical-only")
            }
            SearchDiagnostic::ProviderFailed { reason } => {
                write!(f, "query embedding failed: {reason}")
            }
            SearchDiagnostic::ProviderTimeout { millis } => {
                write!(f, "query embedding timed out after {millis}ms")
            }
            SearchDiagnostic::LexicalFailed { reason } => {
                write!(f, "full-text search failed: {reason}")
            }
            SearchDiagnostic::HydrationFailed { reason } => {
                write!(f, "text hydration failed: {reason}")
            }
            SearchDiagnostic::NoCandidates => write!(f, "no candidates from either source"),
        }
    }
}

/// Ranked results of a hybrid query plus the degradations it went through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<RetrievedChunk>,
    pub diagnostics: Vec<SearchDiagnostic>,
}

impl SearchResponse {
    /// Whether any degradation was recorded.
    pub fn is_degraded(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// Output format for CLI results.
///
/// # Examples
///
/// ```
/// use regla_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable summaries.
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
    /// Markdown-formatted output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}
