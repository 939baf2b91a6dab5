//! Startup provider selection.
//!
//! Providers are probed once, in configured order, and the first healthy one
//! wins. A provider that fails its probe is not retried for the life of the
//! process. The null provider always terminates the chain.

use std::sync::Arc;
use std::time::Duration;

use regla_core::{EmbeddingConfig, ProviderKind, ReglaError, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::provider::{EmbeddingProvider, NullProvider};
use crate::remote::{RemoteEndpoint, RemoteProvider};

/// What happened when one chain entry was tried.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Healthy; this provider is now active.
    Selected { model: String, dimension: usize },
    /// Not configured (credentials or feature missing); never contacted.
    Skipped { reason: String },
    /// Configured but the probe call failed or timed out.
    Failed { reason: String },
}

/// One step of the fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub provider: ProviderKind,
    #[serde(flatten)]
    pub status: ProbeStatus,
}

/// The active provider plus the record of how it was chosen.
pub struct Selection {
    pub provider: Arc<dyn EmbeddingProvider>,
    pub outcomes: Vec<ProbeOutcome>,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("provider", &self.provider.kind())
            .field("outcomes", &self.outcomes)
            .finish()
    }
}

/// Walk the configured chain and return the first provider that passes its
/// health probe, falling back to [`NullProvider`].
///
/// Never fails: every error along the way is logged and recorded in
/// [`Selection::outcomes`].
pub async fn select_provider(config: &EmbeddingConfig) -> Selection {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let mut outcomes = Vec::new();
    let mut tried = Vec::new();

    for &kind in &config.chain {
        if kind == ProviderKind::Null {
            break;
        }
        if tried.contains(&kind) {
            continue;
        }
        tried.push(kind);

        match connect(kind, config, timeout).await {
            Ok(provider) => {
                info!(
                    provider = %kind,
                    model = provider.model(),
                    dimension = provider.dimension(),
                    "embedding provider selected"
                );
                outcomes.push(ProbeOutcome {
                    provider: kind,
                    status: ProbeStatus::Selected {
                        model: provider.model().to_string(),
                        dimension: provider.dimension(),
                    },
                });
                return Selection { provider, outcomes };
            }
            Err(ReglaError::Config(reason)) => {
                info!(provider = %kind, %reason, "embedding provider skipped");
                outcomes.push(ProbeOutcome {
                    provider: kind,
                    status: ProbeStatus::Skipped { reason },
                });
            }
            Err(e) => {
                warn!(provider = %kind, error = %e, "embedding provider probe failed");
                outcomes.push(ProbeOutcome {
                    provider: kind,
                    status: ProbeStatus::Failed {
                        reason: e.to_string(),
                    },
                });
            }
        }
    }

    warn!("no embedding provider available; retrieval will be lexical-only");
    outcomes.push(ProbeOutcome {
        provider: ProviderKind::Null,
        status: ProbeStatus::Selected {
            model: NullProvider.model().to_string(),
            dimension: 0,
        },
    });
    Selection {
        provider: Arc::new(NullProvider),
        outcomes,
    }
}

async fn connect(
    kind: ProviderKind,
    config: &EmbeddingConfig,
    timeout: Duration,
) -> Result<Arc<dyn EmbeddingProvider>> {
    match kind {
        ProviderKind::Azure => {
            let endpoint = RemoteEndpoint::azure(&config.azure)?;
            probe_remote(endpoint, timeout).await
        }
        ProviderKind::OpenAi => {
            let endpoint = RemoteEndpoint::openai(&config.openai)?;
            probe_remote(endpoint, timeout).await
        }
        ProviderKind::Local => connect_local(config).await,
        ProviderKind::Null => Ok(Arc::new(NullProvider)),
    }
}

async fn probe_remote(
    endpoint: RemoteEndpoint,
    timeout: Duration,
) -> Result<Arc<dyn EmbeddingProvider>> {
    let kind = endpoint.kind();
    let provider = tokio::time::timeout(timeout, RemoteProvider::connect(endpoint, timeout))
        .await
        .map_err(|_| ReglaError::Timeout {
            provider: kind.to_string(),
            millis: timeout.as_millis() as u64,
        })??;
    Ok(Arc::new(provider))
}

#[cfg(feature = "local-model")]
async fn connect_local(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    // Model loading may download weights, so it is not bounded by the probe timeout.
    let provider = crate::local::LocalProvider::load(&config.local).await?;
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "local-model"))]
async fn connect_local(_config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    Err(ReglaError::Config(
        "built without the `local-model` feature".into(),
    ))
}
