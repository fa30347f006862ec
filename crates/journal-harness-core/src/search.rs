//! Hybrid search over an [`ArticleStore`].
//!
//! The algorithm runs entirely through the store trait. The calling
//! application embeds the query (or fails to), builds a [`SearchRequest`],
//! and applies its own timeout around [`hybrid_search`].
//!
//! # Scoring
//!
//! 1. Issue the lexical sub-query (title ×3, abstract ×2, content ×1 by
//!    default) and, when a query vector is present, the vector sub-query.
//!    Both run concurrently and are merged only after both complete.
//! 2. Lexical scores are scaled by the best lexical score in the candidate
//!    set; cosine scores are clamped to `[0, 1]`.
//! 3. `combined = (1 - α) × lexical + α × vector`. When the vector channel
//!    is missing the search is *degraded* and `α` drops to `0`. When only
//!    the lexical channel fails `α` rises to `1`; vector ranking is the
//!    primary signal, so that outcome is not flagged as degraded.
//! 4. Drop hits below `min_score`.
//! 5. Sort by combined score (desc), `published_at` (desc, unknown last),
//!    id (asc).
//! 6. Truncate to `max_results`.

use anyhow::{bail, Result};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::Article;
use crate::store::{ArticleStore, FieldWeights, ScoredCandidate};

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Vector weight: `combined = (1-α)*lexical + α*vector`.
    pub hybrid_alpha: f64,
    /// Candidates fetched from each sub-query.
    pub candidate_k: usize,
    /// Lexical field weights.
    pub weights: FieldWeights,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            hybrid_alpha: 0.4,
            candidate_k: 50,
            weights: FieldWeights::default(),
        }
    }
}

/// All inputs for one search.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    /// Query embedding. `None` means the embedding service was unavailable.
    pub query_vec: Option<&'a [f32]>,
    pub source_filter: Option<&'a str>,
    pub max_results: usize,
    /// Hits with a combined score below this are dropped.
    pub min_score: f64,
    pub params: SearchParams,
}

/// One ranked result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub article_id: String,
    /// Cosine similarity clamped to `[0, 1]`; `0` when the vector channel missed.
    pub vector_score: f64,
    /// Lexical score scaled to `[0, 1]`; `0` when the article had no term match.
    pub lexical_score: f64,
    pub combined_score: f64,
    /// The stored article, without its vector.
    pub source_article: Article,
}

/// Result of a search, tagged with whether it ran on both channels.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    /// True when the vector channel was unavailable and lexical scoring
    /// carried the search alone.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    pub hits: Vec<SearchHit>,
}

impl SearchOutcome {
    fn empty() -> Self {
        Self {
            degraded: false,
            degraded_reason: None,
            hits: Vec::new(),
        }
    }
}

/// Run a hybrid search against a store.
///
/// Fails only when every available scoring channel failed. A missing or
/// failed vector channel produces a degraded, lexical-only outcome; a
/// failed lexical channel leaves a vector-only outcome.
pub async fn hybrid_search<S: ArticleStore + ?Sized>(
    store: &S,
    req: &SearchRequest<'_>,
) -> Result<SearchOutcome> {
    if req.query.trim().is_empty() || req.max_results == 0 {
        return Ok(SearchOutcome::empty());
    }

    let keyword = store.keyword_search(
        req.query,
        req.params.weights,
        req.params.candidate_k,
        req.source_filter,
    );
    let vector = async {
        match req.query_vec {
            Some(qv) => store
                .vector_search(qv, req.params.candidate_k, req.source_filter)
                .await
                .map(Some),
            None => Ok(None),
        }
    };
    let (keyword, vector) = futures::join!(keyword, vector);

    let (keyword_candidates, vector_candidates, effective_alpha, degraded_reason) =
        match (keyword, vector) {
            (Ok(k), Ok(Some(v))) => (k, v, req.params.hybrid_alpha, None),
            (Ok(k), Ok(None)) => (
                k,
                Vec::new(),
                0.0,
                Some("query embedding unavailable".to_string()),
            ),
            (Ok(k), Err(e)) => (
                k,
                Vec::new(),
                0.0,
                Some(format!("vector search failed: {}", e)),
            ),
            (Err(_), Ok(Some(v))) => (Vec::new(), v, 1.0, None),
            (Err(e), Ok(None)) => bail!("keyword search failed with no vector fallback: {}", e),
            (Err(kw), Err(vec)) => bail!(
                "keyword search failed: {}; vector search failed: {}",
                kw,
                vec
            ),
        };

    let kw_map: HashMap<&str, f64> = normalize_lexical_scores(&keyword_candidates)
        .into_iter()
        .map(|(c, s)| (c.article_id.as_str(), s))
        .collect();
    let vec_map: HashMap<&str, f64> = vector_candidates
        .iter()
        .map(|c| (c.article_id.as_str(), clamp_unit(c.raw_score)))
        .collect();

    let mut ids: Vec<&str> = kw_map.keys().chain(vec_map.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut hits = Vec::with_capacity(ids.len());
    for id in ids {
        let lexical = kw_map.get(id).copied().unwrap_or(0.0);
        let vector = vec_map.get(id).copied().unwrap_or(0.0);
        let combined = (1.0 - effective_alpha) * lexical + effective_alpha * vector;
        if combined < req.min_score {
            continue;
        }
        // Candidates can vanish between the sub-query and the fetch; skip them.
        let Some(article) = store.get_article(id).await? else {
            continue;
        };
        hits.push(SearchHit {
            article_id: id.to_string(),
            vector_score: vector,
            lexical_score: lexical,
            combined_score: combined,
            source_article: article.without_embedding(),
        });
    }

    rank_hits(&mut hits);
    hits.truncate(req.max_results);

    Ok(SearchOutcome {
        degraded: degraded_reason.is_some(),
        degraded_reason,
        hits,
    })
}

/// Sort hits by combined score (desc), publication date (desc, unknown
/// last), then id (asc).
pub fn rank_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                let (pa, pb) = (a.source_article.published_at, b.source_article.published_at);
                pb.is_some().cmp(&pa.is_some()).then_with(|| pb.cmp(&pa))
            })
            .then_with(|| a.article_id.cmp(&b.article_id))
    });
}

/// Scale lexical scores into `[0, 1]` by dividing by the best score.
///
/// Every candidate that matched keeps a positive score, unlike min-max
/// scaling which pins the weakest match to zero. Non-positive raw scores
/// map to `0`.
pub fn normalize_lexical_scores(candidates: &[ScoredCandidate]) -> Vec<(&ScoredCandidate, f64)> {
    let best = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(0.0f64, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if best > 0.0 {
                clamp_unit(c.raw_score / best)
            } else {
                0.0
            };
            (c, norm)
        })
        .collect()
}

fn clamp_unit(score: f64) -> f64 {
    // NaN.max(0.0) is 0.0
    score.max(0.0).min(1.0)
}
