//! Embedding providers and the startup fallback chain.
//!
//! Azure OpenAI, OpenAI, an optional in-process model and a null provider all
//! sit behind [`EmbeddingProvider`]. [`select_provider`] probes them once in
//! configured order and returns the first healthy one.

#[cfg(feature = "local-model")]
pub mod local;
pub mod provider;
pub mod remote;
pub mod select;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(feature = "local-model")]
pub use local::LocalProvider;
pub use provider::{embed_batch_within, normalize, EmbeddingProvider, NullProvider};
pub use remote::{RemoteEndpoint, RemoteProvider};
pub use select::{select_provider, ProbeOutcome, ProbeStatus, Selection};
