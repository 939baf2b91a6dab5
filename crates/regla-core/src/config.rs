use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ReglaError;
use crate::types::ProviderKind;

/// Top-level configuration loaded from `.regla.toml`.
///
/// Every section is optional; a missing file or section yields defaults.
///
/// # Examples
///
/// ```
/// use regla_core::ReglaConfig;
///
/// let config = ReglaConfig::default();
/// assert_eq!(config.retrieval.final_k, 6);
/// assert_eq!(config.retrieval.similarity_threshold, 0.7);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReglaConfig {
    /// Embedding provider chain and credentials.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Vector index location.
    #[serde(default)]
    pub index: IndexConfig,
    /// Document store location.
    #[serde(default)]
    pub store: StoreConfig,
    /// Default query parameters.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Rerank and fusion weights.
    #[serde(default)]
    pub fusion: FusionConfig,
    /// Corpus chunking for `rebuild`.
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl ReglaConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::Io`] if the file cannot be read, or
    /// [`ReglaError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use regla_core::ReglaConfig;
    /// use std::path::Path;
    ///
    /// let config = ReglaConfig::from_file(Path::new(".regla.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ReglaError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use regla_core::ReglaConfig;
    ///
    /// let toml = r#"
    /// [retrieval]
    /// final_k = 10
    /// "#;
    /// let config = ReglaConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.retrieval.final_k, 10);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, ReglaError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }
}

/// Embedding provider configuration.
///
/// `chain` lists the providers to probe, in order. The null provider is
/// always tried last whether or not it is listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Probe order (default: azure, openai, local).
    #[serde(default = "default_chain")]
    pub chain: Vec<ProviderKind>,
    /// Deadline for a single embedding call, probes included (default: 15).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Texts per embedding request when indexing (default: 64).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub local: LocalModelConfig,
}

fn default_chain() -> Vec<ProviderKind> {
    vec![ProviderKind::Azure, ProviderKind::OpenAi, ProviderKind::Local]
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_batch_size() -> usize {
    64
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            chain: default_chain(),
            timeout_secs: default_timeout_secs(),
            batch_size: default_batch_size(),
            azure: AzureConfig::default(),
            openai: OpenAiConfig::default(),
            local: LocalModelConfig::default(),
        }
    }
}

/// Azure OpenAI embedding deployment.
///
/// Unset fields fall back to `AZURE_OPENAI_ENDPOINT`, `AZURE_OPENAI_KEY`,
/// `AZURE_OPENAI_EMBEDDING_DEPLOYMENT` and `AZURE_OPENAI_API_VERSION`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub deployment: Option<String>,
    #[serde(default = "default_azure_api_version")]
    pub api_version: String,
}

fn default_azure_api_version() -> String {
    "2024-12-01-preview".into()
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            deployment: None,
            api_version: default_azure_api_version(),
        }
    }
}

/// OpenAI (or compatible) embedding endpoint.
///
/// Unset `api_key` falls back to `OPENAI_API_KEY`; `MODEL_EMBED` overrides
/// the default model name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_openai_model() -> String {
    "text-embedding-3-small".into()
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base_url(),
            model: default_openai_model(),
        }
    }
}

/// In-process embedding model (requires the `local-model` feature).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalModelConfig {
    #[serde(default = "default_local_model")]
    pub model: String,
    /// Where model weights are cached (default: `.regla/models`).
    #[serde(default = "default_local_cache_dir")]
    pub cache_dir: PathBuf,
}

fn default_local_model() -> String {
    "multilingual-e5-small".into()
}

fn default_local_cache_dir() -> PathBuf {
    PathBuf::from(".regla/models")
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            model: default_local_model(),
            cache_dir: default_local_cache_dir(),
        }
    }
}

/// Vector index location.
///
/// # Examples
///
/// ```
/// use regla_core::IndexConfig;
///
/// let config = IndexConfig::default();
/// assert!(config.vectors_path().ends_with("vectors.idx"));
/// assert!(config.metadata_path().ends_with("metas.jsonl"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Directory holding `vectors.idx` and `metas.jsonl` (default: `.regla/index`).
    #[serde(default = "default_index_dir")]
    pub dir: PathBuf,
}

fn default_index_dir() -> PathBuf {
    PathBuf::from(".regla/index")
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: default_index_dir(),
        }
    }
}

impl IndexConfig {
    /// Path of the binary vector artifact.
    pub fn vectors_path(&self) -> PathBuf {
        self.dir.join("vectors.idx")
    }

    /// Path of the line-delimited metadata file.
    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join("metas.jsonl")
    }
}

/// Document store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (default: `.regla/regla.db`).
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".regla/regla.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Default parameters for hybrid queries.
///
/// # Examples
///
/// ```
/// use regla_core::RetrievalConfig;
///
/// let config = RetrievalConfig::default();
/// assert_eq!(config.k_vec, 12);
/// assert_eq!(config.k_lex, 12);
/// assert_eq!(config.oversample, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k_vec: usize,
    #[serde(default = "default_k")]
    pub k_lex: usize,
    #[serde(default = "default_final_k")]
    pub final_k: usize,
    /// Minimum cosine similarity for a semantic candidate (default: 0.7).
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Neighbours fetched per requested semantic result before filtering (default: 3).
    #[serde(default = "default_oversample")]
    pub oversample: usize,
}

fn default_k() -> usize {
    12
}

fn default_final_k() -> usize {
    6
}

fn default_similarity_threshold() -> f32 {
    0.7
}

fn default_oversample() -> usize {
    3
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_vec: default_k(),
            k_lex: default_k(),
            final_k: default_final_k(),
            similarity_threshold: default_similarity_threshold(),
            oversample: default_oversample(),
        }
    }
}

/// Rerank and fusion weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Added the first time a document appears among semantic hits (default: 0.1).
    #[serde(default = "default_doc_diversity_bonus")]
    pub doc_diversity_bonus: f32,
    /// Added when a query token occurs in the heading path (default: 0.05).
    #[serde(default = "default_heading_match_bonus")]
    pub heading_match_bonus: f32,
    /// Added to every semantic candidate's combined score (default: 0.1).
    #[serde(default = "default_semantic_bonus")]
    pub semantic_bonus: f32,
}

fn default_doc_diversity_bonus() -> f32 {
    0.1
}

fn default_heading_match_bonus() -> f32 {
    0.05
}

fn default_semantic_bonus() -> f32 {
    0.1
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            doc_diversity_bonus: default_doc_diversity_bonus(),
            heading_match_bonus: default_heading_match_bonus(),
            semantic_bonus: default_semantic_bonus(),
        }
    }
}

/// Corpus chunking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Upper bound on chunk length in characters (default: 1800).
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// File extensions picked up by `rebuild` (default: txt, md).
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_max_chars() -> usize {
    1800
}

fn default_extensions() -> Vec<String> {
    vec!["txt".into(), "md".into()]
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            extensions: default_extensions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = ReglaConfig::default();
        assert_eq!(
            config.embedding.chain,
            vec![ProviderKind::Azure, ProviderKind::OpenAi, ProviderKind::Local]
        );
        assert_eq!(config.embedding.timeout_secs, 15);
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.embedding.azure.api_version, "2024-12-01-preview");
        assert_eq!(config.embedding.openai.model, "text-embedding-3-small");
        assert_eq!(config.embedding.local.model, "multilingual-e5-small");
        assert_eq!(config.retrieval.k_vec, 12);
        assert_eq!(config.retrieval.k_lex, 12);
        assert_eq!(config.retrieval.final_k, 6);
        assert_eq!(config.retrieval.similarity_threshold, 0.7);
        assert_eq!(config.fusion.doc_diversity_bonus, 0.1);
        assert_eq!(config.fusion.heading_match_bonus, 0.05);
        assert_eq!(config.fusion.semantic_bonus, 0.1);
        assert_eq!(config.ingest.max_chars, 1800);
    }

    #[test]
    fn parse_minimal_toml() {
        let toml = r#"
[retrieval]
final_k = 3
similarity_threshold = 0.5
"#;
        let config = ReglaConfig::from_toml(toml).unwrap();
        assert_eq!(config.retrieval.final_k, 3);
        assert_eq!(config.retrieval.similarity_threshold, 0.5);
        assert_eq!(config.retrieval.k_vec, 12);
        assert_eq!(config.fusion.semantic_bonus, 0.1);
    }

    #[test]
    fn parse_provider_chain() {
        let toml = r#"
[embedding]
chain = ["local", "openai"]
timeout_secs = 5

[embedding.openai]
api_key = "sk-test-1234567890"
model = "text-embedding-3-large"
"#;
        let config = ReglaConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.embedding.chain,
            vec![ProviderKind::Local, ProviderKind::OpenAi]
        );
        assert_eq!(config.embedding.timeout_secs, 5);
        assert_eq!(
            config.embedding.openai.api_key.as_deref(),
            Some("sk-test-1234567890")
        );
        assert_eq!(config.embedding.openai.model, "text-embedding-3-large");
        assert_eq!(config.embedding.openai.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[embedding.azure]
endpoint = "https://legal.openai.azure.com"
api_key = "0123456789abcdef"
deployment = "embed-small"
api_version = "2024-02-01"

[index]
dir = "/srv/regla/index"

[store]
db_path = "/srv/regla/regla.db"

[fusion]
doc_diversity_bonus = 0.2
heading_match_bonus = 0.0

[ingest]
max_chars = 900
extensions = ["txt"]
"#;
        let config = ReglaConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.embedding.azure.endpoint.as_deref(),
            Some("https://legal.openai.azure.com")
        );
        assert_eq!(config.embedding.azure.api_version, "2024-02-01");
        assert_eq!(
            config.index.vectors_path(),
            PathBuf::from("/srv/regla/index/vectors.idx")
        );
        assert_eq!(
            config.index.metadata_path(),
            PathBuf::from("/srv/regla/index/metas.jsonl")
        );
        assert_eq!(config.store.db_path, PathBuf::from("/srv/regla/regla.db"));
        assert_eq!(config.fusion.doc_diversity_bonus, 0.2);
        assert_eq!(config.fusion.heading_match_bonus, 0.0);
        assert_eq!(config.fusion.semantic_bonus, 0.1);
        assert_eq!(config.ingest.max_chars, 900);
        assert_eq!(config.ingest.extensions, vec!["txt".to_string()]);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let toml = r#"
[embedding]
chain = ["voyage"]
"#;
        assert!(ReglaConfig::from_toml(toml).is_err());
    }

    #[test]
    fn invalid_toml_is_rejected() {
        assert!(ReglaConfig::from_toml("[retrieval\nfinal_k = ").is_err());
    }
}
