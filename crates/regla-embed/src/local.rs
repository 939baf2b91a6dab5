//! In-process embedding via fastembed (feature `local-model`).
//!
//! E5 models expect `query: ` / `passage: ` prefixes; they are added here so
//! callers never see them.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use regla_core::{LocalModelConfig, ProviderKind, ReglaError, Result};

use crate::provider::{normalize, EmbeddingProvider};

pub struct LocalProvider {
    model: Arc<Mutex<TextEmbedding>>,
    name: String,
    dimension: usize,
    e5_prefixes: bool,
}

impl std::fmt::Debug for LocalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProvider")
            .field("name", &self.name)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

fn resolve_model(name: &str) -> Result<EmbeddingModel> {
    match name {
        "multilingual-e5-small" | "intfloat/multilingual-e5-small" => {
            Ok(EmbeddingModel::MultilingualE5Small)
        }
        "multilingual-e5-base" | "intfloat/multilingual-e5-base" => {
            Ok(EmbeddingModel::MultilingualE5Base)
        }
        "bge-small-en-v1.5" | "BAAI/bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        other => Err(ReglaError::Config(format!(
            "unsupported local embedding model '{other}'"
        ))),
    }
}

impl LocalProvider {
    /// Load the model (downloading weights on first use) and probe its width.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::Config`] for an unknown model name and
    /// [`ReglaError::Provider`] if loading or the probe embedding fails.
    pub async fn load(config: &LocalModelConfig) -> Result<Self> {
        let model_kind = resolve_model(&config.model)?;
        let cache_dir = config.cache_dir.clone();
        let name = config.model.clone();
        let e5_prefixes = name.contains("e5");

        let (model, dimension) = tokio::task::spawn_blocking(move || {
            let mut model = TextEmbedding::try_new(
                InitOptions::new(model_kind)
                    .with_cache_dir(cache_dir)
                    .with_show_download_progress(false),
            )
            .map_err(|e| ReglaError::Provider(format!("failed to load local model: {e}")))?;
            let probe = model
                .embed(vec!["query: test".to_string()], None)
                .map_err(|e| ReglaError::Provider(format!("local model probe failed: {e}")))?;
            let dimension = probe.first().map(Vec::len).unwrap_or(0);
            Ok::<_, ReglaError>((model, dimension))
        })
        .await
        .map_err(|e| ReglaError::Provider(format!("local model task panicked: {e}")))??;

        if dimension == 0 {
            return Err(ReglaError::Provider(
                "local model probe returned an empty embedding".into(),
            ));
        }

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            name,
            dimension,
            e5_prefixes,
        })
    }

    async fn run(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let mut vectors = tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| ReglaError::Provider("local model lock poisoned".into()))?;
            guard
                .embed(inputs, None)
                .map_err(|e| ReglaError::Provider(format!("local embedding failed: {e}")))
        })
        .await
        .map_err(|e| ReglaError::Provider(format!("local embedding task panicked: {e}")))??;

        for vector in &mut vectors {
            normalize(vector);
        }
        Ok(vectors)
    }

    fn prefixed(&self, prefix: &str, text: &str) -> String {
        if self.e5_prefixes {
            format!("{prefix}{text}")
        } else {
            text.to_string()
        }
    }
}

#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn model(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.run(vec![self.prefixed("query: ", text)]).await?;
        vectors
            .pop()
            .ok_or_else(|| ReglaError::Provider("local model returned no embedding".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs = texts
            .iter()
            .map(|t| self.prefixed("passage: ", t))
            .collect();
        self.run(inputs).await
    }
}
