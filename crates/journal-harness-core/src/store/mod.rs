//! Storage abstraction for Journal Harness.
//!
//! The [`ArticleStore`] trait covers everything the ingestion controller,
//! hybrid search, re-vectorize, and stats paths need from a document
//! index: point lookup, upsert, per-source aggregation, weighted lexical
//! search, and vector similarity search.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::Article;

/// A candidate returned from keyword or vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub article_id: String,
    /// Raw backend score (weighted BM25 relevance or cosine similarity).
    /// Higher is better.
    pub raw_score: f64,
}

/// Per-field weights for lexical scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldWeights {
    pub title: f64,
    pub abstract_text: f64,
    pub content: f64,
}

impl Default for FieldWeights {
    fn default() -> Self {
        Self {
            title: 3.0,
            abstract_text: 2.0,
            content: 1.0,
        }
    }
}

/// Article counts for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub articles: i64,
    pub embedded: i64,
}

/// An article whose ingestion failed, kept so a later run can try it again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingRetry {
    pub article_id: String,
    pub source: String,
    /// The upstream listing record, serialized by the ingestion layer.
    pub record: String,
    /// Failed attempts so far.
    pub attempts: u32,
    pub last_error: String,
}

/// Split a free-text query into lowercase alphanumeric terms, deduplicated
/// in first-seen order.
///
/// Both store implementations match on these terms, so punctuation in user
/// queries never reaches a query parser.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for term in query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
    {
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

/// Abstract article index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_article`](ArticleStore::get_article) | Point lookup by id |
/// | [`contains`](ArticleStore::contains) | Existence check used for dedup |
/// | [`upsert_article`](ArticleStore::upsert_article) | Insert or replace one article |
/// | [`count_by_source`](ArticleStore::count_by_source) | Smart-offset aggregation |
/// | [`source_counts`](ArticleStore::source_counts) | Per-source stats |
/// | [`keyword_search`](ArticleStore::keyword_search) | Weighted multi-field lexical search |
/// | [`vector_search`](ArticleStore::vector_search) | Cosine similarity search |
/// | [`pending_embeddings`](ArticleStore::pending_embeddings) | Articles needing (re-)embedding |
/// | [`update_embedding`](ArticleStore::update_embedding) | Replace one article's vector |
/// | [`clear_embeddings`](ArticleStore::clear_embeddings) | Drop vectors before a rebuild |
/// | [`list_articles`](ArticleStore::list_articles) | Most recent articles first |
/// | [`record_failure`](ArticleStore::record_failure) | Remember a failed article for retry |
/// | [`pending_retries`](ArticleStore::pending_retries) | Failed articles still eligible for retry |
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Fetch one article by id. `None` when absent.
    async fn get_article(&self, id: &str) -> Result<Option<Article>>;

    /// Whether an article with this id is stored.
    async fn contains(&self, id: &str) -> Result<bool>;

    /// Insert or replace an article. Last writer wins. Storing an article
    /// clears any pending retry for its id.
    async fn upsert_article(&self, article: &Article) -> Result<()>;

    /// Number of stored articles whose `source` equals `source`.
    async fn count_by_source(&self, source: &str) -> Result<i64>;

    /// Article and embedding counts grouped by source, largest first.
    async fn source_counts(&self) -> Result<Vec<SourceCount>>;

    /// Lexical search over title, abstract, and content with per-field weights.
    async fn keyword_search(
        &self,
        query: &str,
        weights: FieldWeights,
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredCandidate>>;

    /// Nearest articles to `query_vec` by cosine similarity.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredCandidate>>;

    /// Articles with no vector, or a vector from a model other than `model`.
    async fn pending_embeddings(
        &self,
        model: &str,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>>;

    /// Replace the vector of an existing article.
    async fn update_embedding(&self, id: &str, vector: &[f32], model: &str) -> Result<()>;

    /// Remove vectors (optionally only for one source). Returns rows touched.
    async fn clear_embeddings(&self, source: Option<&str>) -> Result<u64>;

    /// Stored articles ordered by publication date, newest first.
    async fn list_articles(&self, source: Option<&str>, limit: usize) -> Result<Vec<Article>>;

    /// Insert or replace the retry entry for `retry.article_id`.
    async fn record_failure(&self, retry: &PendingRetry) -> Result<()>;

    /// Retry entries for `source` with fewer than `max_attempts` attempts,
    /// oldest first.
    async fn pending_retries(
        &self,
        source: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<PendingRetry>>;
}
