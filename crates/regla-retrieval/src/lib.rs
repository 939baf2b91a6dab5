//! Hybrid retrieval over a legal-regulation corpus.
//!
//! - [`walker`] and [`chunker`] turn a directory of documents into chunks
//! - [`store`] keeps chunk text in SQLite with FTS5 for lexical search
//! - [`fusion`] reranks semantic hits and merges them with lexical hits
//! - [`Retriever`] ties the provider, vector index and store together

pub mod chunker;
pub mod fusion;
pub mod retriever;
pub mod store;
pub mod walker;

pub use retriever::{HybridParams, RebuildReport, Retriever, RetrieverStats};
pub use store::{DocumentStore, LexicalHit, SqliteDocumentStore, StoreStats};
