//! Vector index for regla.
//!
//! - [`VectorIndex`]: exact inner-product search over an aligned
//!   vector/metadata arena
//! - [`persist`]: the `vectors.idx` + `metas.jsonl` on-disk pair
//! - [`SharedIndex`]: the lock-protected, persisted handle used by the retriever

pub mod index;
pub mod persist;
pub mod shared;

pub use index::{VectorHit, VectorIndex};
pub use persist::{IndexPaths, LoadedIndex};
pub use shared::{generated_chunk_id, AddReport, IndexStats, SharedIndex, VectorSearch};
