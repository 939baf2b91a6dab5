//! Deterministic providers for tests (feature `testing`).

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use regla_core::{ProviderKind, ReglaError, Result};
use sha2::{Digest, Sha256};

use crate::provider::{normalize, EmbeddingProvider};

/// Bag-of-words embedder: each lowercase alphanumeric token increments one
/// SHA-256-chosen bucket, then the vector is normalized.
///
/// Identical texts embed identically, and cosine similarity tracks token
/// overlap, which makes ranking assertions predictable.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
    kind: ProviderKind,
    delay: Option<Duration>,
}

impl HashingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            kind: ProviderKind::Local,
            delay: None,
        }
    }

    /// Report a different backend kind.
    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Synchronous embedding, for building fixtures.
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        if self.dimension == 0 {
            return vector;
        }
        for token in tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let slot = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            vector[slot] += 1.0;
        }
        normalize(&mut vector);
        vector
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn model(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.pause().await;
        Ok(self.vector(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.pause().await;
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// Wraps [`HashingProvider`] and fails selected calls.
///
/// `embed_batch` calls are numbered from zero; those listed in
/// `failing_batches` return a provider error. Query embedding fails when
/// `fail_queries` is set.
#[derive(Debug)]
pub struct FlakyProvider {
    inner: HashingProvider,
    failing_batches: HashSet<usize>,
    fail_queries: bool,
    batch_calls: AtomicUsize,
}

impl FlakyProvider {
    pub fn new(inner: HashingProvider) -> Self {
        Self {
            inner,
            failing_batches: HashSet::new(),
            fail_queries: false,
            batch_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_batches(mut self, batches: impl IntoIterator<Item = usize>) -> Self {
        self.failing_batches = batches.into_iter().collect();
        self
    }

    pub fn failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    /// Number of `embed_batch` calls seen so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyProvider {
    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    fn model(&self) -> &str {
        "flaky-hashing"
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail_queries {
            return Err(ReglaError::Provider("scripted query failure".into()));
        }
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_batches.contains(&call) {
            return Err(ReglaError::Provider(format!(
                "scripted failure on batch {call}"
            )));
        }
        self.inner.embed_batch(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn identical_text_has_unit_similarity() {
        let provider = HashingProvider::new(256);
        let v = provider.vector("Zoning permit requirements");
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn token_overlap_drives_similarity() {
        let provider = HashingProvider::new(1024);
        let query = provider.vector("permit requirements");
        let related = provider.vector("Zoning permit requirements");
        let unrelated = provider.vector("Historic preservation criteria");
        assert!(cosine(&query, &related) > 0.7);
        assert!(cosine(&query, &unrelated) < cosine(&query, &related));
    }

    #[test]
    fn case_and_punctuation_are_ignored() {
        let provider = HashingProvider::new(64);
        assert_eq!(provider.vector("Permit, REQUIREMENTS!"), provider.vector("permit requirements"));
    }

    #[tokio::test]
    async fn flaky_provider_fails_listed_batches() {
        let provider = FlakyProvider::new(HashingProvider::new(16)).failing_batches([1]);
        let texts = vec!["a".to_string()];
        assert!(provider.embed_batch(&texts).await.is_ok());
        assert!(provider.embed_batch(&texts).await.is_err());
        assert!(provider.embed_batch(&texts).await.is_ok());
        assert_eq!(provider.batch_calls(), 3);
    }
}
