//! Core types, configuration, and error handling for regla.
//!
//! This crate provides the shared foundation used by the other regla crates:
//! - [`ReglaError`]: unified error type using `thiserror`
//! - [`ReglaConfig`]: configuration loaded from `.regla.toml`
//! - Shared types: [`ChunkMeta`], [`Chunk`], [`Candidate`], [`RetrievedChunk`],
//!   [`SearchDiagnostic`], [`SearchResponse`], [`ProviderKind`], [`OutputFormat`]

mod config;
mod error;
mod types;

pub use config::{
    AzureConfig, EmbeddingConfig, FusionConfig, IndexConfig, IngestConfig, LocalModelConfig,
    OpenAiConfig, ReglaConfig, RetrievalConfig, StoreConfig,
};
pub use error::ReglaError;
pub use types::{
    Candidate, Chunk, ChunkMeta, OutputFormat, ProviderKind, RetrievedChunk, SearchDiagnostic,
    SearchResponse, SearchType,
};

/// A convenience `Result` type for regla operations.
pub type Result<T> = std::result::Result<T, ReglaError>;
