//! In-memory exact inner-product index.
//!
//! Vectors live in one flat `Vec<f32>` and metadata in a parallel
//! `Vec<ChunkMeta>`; both only grow through [`VectorIndex::push`], so the
//! i-th vector always belongs to the i-th record. Re-adding a `chunk_id`
//! appends a new entry that shadows the older ones until [`VectorIndex::compact`].

use std::cmp::Ordering;
use std::collections::HashMap;

use regla_core::{ChunkMeta, ReglaError, Result};

/// A scored neighbour returned by [`VectorIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    /// Inner product with the query (cosine for unit vectors).
    pub score: f32,
    /// Entry position in the index.
    pub position: usize,
    pub meta: ChunkMeta,
}

/// Exact nearest-neighbour store with positionally aligned metadata.
///
/// # Examples
///
/// ```
/// use regla_core::ChunkMeta;
/// use regla_index::VectorIndex;
///
/// let meta = |id: &str| ChunkMeta { chunk_id: id.into(), ..ChunkMeta::default() };
/// let index = VectorIndex::build(
///     2,
///     vec![vec![1.0, 0.0], vec![0.0, 1.0]],
///     vec![meta("a"), meta("b")],
/// )
/// .unwrap();
///
/// let hits = index.search(&[0.0, 1.0], 1).unwrap();
/// assert_eq!(hits[0].meta.chunk_id, "b");
/// ```
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    vectors: Vec<f32>,
    metas: Vec<ChunkMeta>,
    latest: HashMap<String, usize>,
}

impl VectorIndex {
    /// An empty index accepting vectors of width `dimension`.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
            metas: Vec::new(),
            latest: HashMap::new(),
        }
    }

    /// Build an index from parallel vectors and metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::InvalidInput`] if the two lists differ in length
    /// and [`ReglaError::DimensionMismatch`] if any vector is not `dimension`
    /// wide. Nothing is built on error.
    pub fn build(dimension: usize, vectors: Vec<Vec<f32>>, metas: Vec<ChunkMeta>) -> Result<Self> {
        if vectors.len() != metas.len() {
            return Err(ReglaError::InvalidInput(format!(
                "{} vectors but {} metadata records",
                vectors.len(),
                metas.len()
            )));
        }
        if dimension == 0 {
            return Err(ReglaError::InvalidInput(
                "index dimension must be positive".into(),
            ));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(ReglaError::DimensionMismatch {
                index: dimension,
                provider: bad.len(),
            });
        }

        let mut index = Self::new(dimension);
        index.vectors.reserve(vectors.len() * dimension);
        index.metas.reserve(metas.len());
        for (vector, meta) in vectors.into_iter().zip(metas) {
            index.push(&vector, meta)?;
        }
        Ok(index)
    }

    /// Rebuild from a flat vector buffer, as read from disk.
    pub(crate) fn from_flat(
        dimension: usize,
        vectors: Vec<f32>,
        metas: Vec<ChunkMeta>,
    ) -> Result<Self> {
        if dimension == 0 || vectors.len() != metas.len() * dimension {
            return Err(ReglaError::InvalidInput(format!(
                "{} floats do not fit {} entries of dimension {dimension}",
                vectors.len(),
                metas.len()
            )));
        }
        let latest = metas
            .iter()
            .enumerate()
            .map(|(i, m)| (m.chunk_id.clone(), i))
            .collect();
        Ok(Self {
            dimension,
            vectors,
            metas,
            latest,
        })
    }

    /// Append one entry; it shadows any earlier entry with the same `chunk_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::DimensionMismatch`] if `vector` has the wrong width.
    pub fn push(&mut self, vector: &[f32], meta: ChunkMeta) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(ReglaError::DimensionMismatch {
                index: self.dimension,
                provider: vector.len(),
            });
        }
        self.vectors.extend_from_slice(vector);
        self.latest.insert(meta.chunk_id.clone(), self.metas.len());
        self.metas.push(meta);
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Stored entries, shadowed ones included.
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Entries visible to search.
    pub fn live_len(&self) -> usize {
        self.latest.len()
    }

    pub fn metas(&self) -> &[ChunkMeta] {
        &self.metas
    }

    /// The flat vector buffer, `len() * dimension()` floats.
    pub fn raw_vectors(&self) -> &[f32] {
        &self.vectors
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.vectors.get(start..start + self.dimension)
    }

    fn is_live(&self, position: usize) -> bool {
        self.latest.get(&self.metas[position].chunk_id) == Some(&position)
    }

    /// Top-`k` live entries by inner product with `query`, best first.
    ///
    /// Ties keep insertion order. Returns fewer than `k` hits when the index
    /// holds fewer live entries.
    ///
    /// # Errors
    ///
    /// Returns [`ReglaError::DimensionMismatch`] if `query` has the wrong
    /// width; no scoring is attempted.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if query.len() != self.dimension {
            return Err(ReglaError::DimensionMismatch {
                index: self.dimension,
                provider: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, usize)> = self
            .vectors
            .chunks_exact(self.dimension)
            .enumerate()
            .filter(|(i, _)| self.is_live(*i))
            .map(|(i, v)| (dot(query, v), i))
            .collect();

        let by_score = |a: &(f32, usize), b: &(f32, usize)| -> Ordering {
            b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
        };
        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, by_score);
            scored.truncate(k);
        }
        scored.sort_by(by_score);

        Ok(scored
            .into_iter()
            .map(|(score, position)| VectorHit {
                score,
                position,
                meta: self.metas[position].clone(),
            })
            .collect())
    }

    /// Drop shadowed entries, keeping live ones in their original order.
    ///
    /// Returns the number of entries removed.
    pub fn compact(&mut self) -> usize {
        let before = self.len();
        if self.live_len() == before {
            return 0;
        }

        let mut vectors = Vec::with_capacity(self.live_len() * self.dimension);
        let mut metas = Vec::with_capacity(self.live_len());
        for position in 0..before {
            if self.is_live(position) {
                let start = position * self.dimension;
                vectors.extend_from_slice(&self.vectors[start..start + self.dimension]);
                metas.push(self.metas[position].clone());
            }
        }

        self.latest = metas
            .iter()
            .enumerate()
            .map(|(i, m)| (m.chunk_id.clone(), i))
            .collect();
        self.vectors = vectors;
        self.metas = metas;
        before - self.len()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, doc: &str) -> ChunkMeta {
        ChunkMeta {
            chunk_id: id.into(),
            doc_id: doc.into(),
            heading_path: format!("{doc} > {id}"),
            page_start: None,
            page_end: None,
        }
    }

    fn unit(values: &[f32]) -> Vec<f32> {
        let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        values.iter().map(|x| x / norm).collect()
    }

    fn sample() -> VectorIndex {
        VectorIndex::build(
            3,
            vec![
                unit(&[1.0, 0.0, 0.0]),
                unit(&[0.8, 0.6, 0.0]),
                unit(&[0.0, 0.0, 1.0]),
            ],
            vec![meta("a", "d1"), meta("b", "d1"), meta("c", "d2")],
        )
        .unwrap()
    }

    #[test]
    fn build_rejects_wrong_width() {
        let err = VectorIndex::build(
            3,
            vec![vec![1.0, 0.0, 0.0], vec![1.0, 0.0]],
            vec![meta("a", "d"), meta("b", "d")],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ReglaError::DimensionMismatch {
                index: 3,
                provider: 2
            }
        ));
    }

    #[test]
    fn build_rejects_misaligned_metadata() {
        let err = VectorIndex::build(2, vec![vec![1.0, 0.0]], vec![]).unwrap_err();
        assert!(matches!(err, ReglaError::InvalidInput(_)));
    }

    #[test]
    fn search_orders_by_score() {
        let index = sample();
        let hits = index.search(&[1.0, 0.0, 0.0], 3).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.meta.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!((hits[1].score - 0.8).abs() < 1e-6);
        assert!(hits[2].score.abs() < 1e-6);
    }

    #[test]
    fn search_returns_fewer_than_k_when_small() {
        let index = sample();
        assert_eq!(index.search(&[0.0, 0.0, 1.0], 10).unwrap().len(), 3);
        assert!(index.search(&[0.0, 0.0, 1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn search_on_empty_index_is_empty() {
        let index = VectorIndex::new(4);
        assert!(index.search(&[0.5; 4], 5).unwrap().is_empty());
    }

    #[test]
    fn search_rejects_wrong_query_width() {
        let index = sample();
        let err = index.search(&[1.0, 0.0], 1).unwrap_err();
        assert!(matches!(err, ReglaError::DimensionMismatch { .. }));
    }

    #[test]
    fn ties_keep_insertion_order() {
        let index = VectorIndex::build(
            2,
            vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]],
            vec![meta("x", "d"), meta("y", "d"), meta("z", "d")],
        )
        .unwrap();
        let hits = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].meta.chunk_id, "x");
        assert_eq!(hits[1].meta.chunk_id, "y");
    }

    #[test]
    fn newer_entry_shadows_older() {
        let mut index = sample();
        index.push(&unit(&[0.0, 1.0, 0.0]), meta("a", "d1")).unwrap();

        assert_eq!(index.len(), 4);
        assert_eq!(index.live_len(), 3);

        let hits = index.search(&[1.0, 0.0, 0.0], 4).unwrap();
        let a_hits: Vec<_> = hits.iter().filter(|h| h.meta.chunk_id == "a").collect();
        assert_eq!(a_hits.len(), 1);
        assert_eq!(a_hits[0].position, 3);
        assert!(a_hits[0].score.abs() < 1e-6);
    }

    #[test]
    fn compact_drops_shadowed_entries() {
        let mut index = sample();
        index.push(&unit(&[0.0, 1.0, 0.0]), meta("b", "d1")).unwrap();
        assert_eq!(index.compact(), 1);
        assert_eq!(index.len(), 3);
        assert_eq!(index.live_len(), 3);

        let ids: Vec<&str> = index.metas().iter().map(|m| m.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert_eq!(index.vector(2).unwrap(), &[0.0, 1.0, 0.0][..]);
        assert_eq!(index.compact(), 0);
    }

    #[test]
    fn push_rejects_wrong_width() {
        let mut index = sample();
        assert!(index.push(&[1.0], meta("q", "d")).is_err());
        assert_eq!(index.len(), 3);
        assert_eq!(index.raw_vectors().len(), 9);
    }
}
