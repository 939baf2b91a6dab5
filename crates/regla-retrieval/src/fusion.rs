//! Semantic rerank and semantic/lexical fusion.
//!
//! Lexical hits carry no score comparable to cosine similarity, so fusion is
//! positional: semantic candidates first, lexical fill-ins after, then a
//! composite score that favours semantic evidence.

use std::collections::HashSet;

use regla_core::{Candidate, FusionConfig, SearchType};

/// Split semantic candidates at `threshold`.
///
/// Returns the candidates scoring at or above it and the ids of those below.
/// Runs before [`rerank`], so bonuses cannot lift a weak match over the bar;
/// the rejected ids are kept out of the fused list entirely, lexical matches
/// included.
pub fn apply_threshold(
    candidates: Vec<Candidate>,
    threshold: f32,
) -> (Vec<Candidate>, HashSet<String>) {
    let (kept, rejected): (Vec<Candidate>, Vec<Candidate>) =
        candidates.into_iter().partition(|c| c.score >= threshold);
    let rejected = rejected.into_iter().map(|c| c.meta.chunk_id).collect();
    (kept, rejected)
}

/// Score semantic candidates with document-diversity and heading bonuses.
///
/// Input must be ordered by descending similarity; the first candidate seen
/// for each `doc_id` gets `doc_diversity_bonus`, and any candidate whose
/// heading path contains a query token gets `heading_match_bonus`. The result
/// is stably re-sorted by `reranked_score`.
///
/// # Examples
///
/// ```
/// use regla_core::{Candidate, ChunkMeta, FusionConfig};
/// use regla_retrieval::fusion::rerank;
///
/// let meta = |id: &str, doc: &str| ChunkMeta {
///     chunk_id: id.into(),
///     doc_id: doc.into(),
///     ..ChunkMeta::default()
/// };
/// let ranked = rerank(
///     vec![
///         Candidate::semantic(meta("a", "d1"), 0.90),
///         Candidate::semantic(meta("b", "d1"), 0.88),
///         Candidate::semantic(meta("c", "d2"), 0.85),
///     ],
///     "permisos",
///     &FusionConfig::default(),
/// );
/// // "c" opens a new document and overtakes "b".
/// let ids: Vec<&str> = ranked.iter().map(|c| c.chunk_id()).collect();
/// assert_eq!(ids, ["a", "c", "b"]);
/// ```
pub fn rerank(mut candidates: Vec<Candidate>, query: &str, config: &FusionConfig) -> Vec<Candidate> {
    let query = query.to_lowercase();
    let tokens: Vec<&str> = query.split_whitespace().collect();
    let mut seen_docs: HashSet<String> = HashSet::new();

    for candidate in &mut candidates {
        let mut score = candidate.score;
        if seen_docs.insert(candidate.meta.doc_id.clone()) {
            score += config.doc_diversity_bonus;
        }
        let heading = candidate.meta.heading_path.to_lowercase();
        if tokens.iter().any(|t| heading.contains(t)) {
            score += config.heading_match_bonus;
        }
        candidate.reranked_score = Some(score);
    }

    candidates.sort_by(|a, b| rank_key(b).total_cmp(&rank_key(a)));
    candidates
}

fn rank_key(candidate: &Candidate) -> f32 {
    candidate.reranked_score.unwrap_or(candidate.score)
}

/// Merge semantic and lexical candidates into at most `final_k` results.
///
/// Semantic candidates all enter the pool; lexical candidates fill it up to
/// `2 * final_k` entries, skipping ids already present. Each candidate's
/// `combined_score` is its reranked score (or raw score) plus
/// `semantic_bonus` when it came from the vector index. The pool is stably
/// sorted by that score and truncated.
pub fn fuse(
    semantic: Vec<Candidate>,
    lexical: Vec<Candidate>,
    final_k: usize,
    config: &FusionConfig,
) -> Vec<Candidate> {
    let lexical_cap = final_k.saturating_mul(2);
    let mut seen: HashSet<String> = HashSet::new();
    let mut pool: Vec<Candidate> = Vec::with_capacity(semantic.len() + lexical.len());

    for mut candidate in semantic {
        if !seen.insert(candidate.meta.chunk_id.clone()) {
            continue;
        }
        candidate.search_type = SearchType::Semantic;
        pool.push(candidate);
    }

    for mut candidate in lexical {
        if pool.len() >= lexical_cap {
            break;
        }
        if !seen.insert(candidate.meta.chunk_id.clone()) {
            continue;
        }
        candidate.search_type = SearchType::Lexical;
        pool.push(candidate);
    }

    for candidate in &mut pool {
        let mut combined = rank_key(candidate);
        if candidate.search_type == SearchType::Semantic {
            combined += config.semantic_bonus;
        }
        candidate.combined_score = combined;
    }

    pool.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
    pool.truncate(final_k);
    pool
}
