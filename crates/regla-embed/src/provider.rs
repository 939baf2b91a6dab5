//! The provider abstraction shared by every embedding backend.

use std::time::Duration;

use async_trait::async_trait;
use regla_core::{ProviderKind, ReglaError, Result};

/// Turns text into fixed-width, unit-length vectors.
///
/// `embed` is used for queries and `embed_batch` for indexed passages; some
/// models encode the two differently. Implementations return vectors that are
/// already L2-normalized.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> ProviderKind;

    /// Model or deployment name, for diagnostics.
    fn model(&self) -> &str;

    /// Width of every vector this provider returns. `0` for the null provider.
    fn dimension(&self) -> usize;

    /// Whether this provider can produce vectors at all.
    fn is_available(&self) -> bool {
        self.dimension() > 0
    }

    /// Embed a search query.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed passages for indexing. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Scale `vector` to unit length in place. Zero vectors are left untouched.
///
/// # Examples
///
/// ```
/// let mut v = vec![3.0_f32, 4.0];
/// regla_embed::normalize(&mut v);
/// assert!((v[0] - 0.6).abs() < 1e-6);
/// assert!((v[1] - 0.8).abs() < 1e-6);
/// ```
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Run `provider.embed_batch(texts)` under `timeout`.
///
/// An expired deadline is reported as [`ReglaError::Timeout`]. For the local
/// model the inference thread keeps running, but the caller is released.
pub async fn embed_batch_within(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    timeout: Duration,
) -> Result<Vec<Vec<f32>>> {
    match tokio::time::timeout(timeout, provider.embed_batch(texts)).await {
        Ok(result) => result,
        Err(_) => Err(ReglaError::Timeout {
            provider: provider.kind().to_string(),
            millis: timeout.as_millis() as u64,
        }),
    }
}

/// Terminal fallback: reports itself unavailable and yields empty vectors.
///
/// Selecting it means retrieval continues lexical-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProvider;

#[async_trait]
impl EmbeddingProvider for NullProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Null
    }

    fn model(&self) -> &str {
        "none"
    }

    fn dimension(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(Vec::new())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![Vec::new(); texts.len()])
    }
}
