//! In-memory [`ArticleStore`] for tests and embedding use.
//!
//! Articles live in a `HashMap` behind `std::sync::RwLock`. Keyword search
//! is a weighted term-frequency score over title, abstract, and content;
//! vector search is brute-force cosine similarity. Retry entries are kept
//! in first-failure order.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::Article;

use super::{query_terms, ArticleStore, FieldWeights, PendingRetry, ScoredCandidate, SourceCount};

/// In-memory article store.
#[derive(Default)]
pub struct InMemoryStore {
    articles: RwLock<HashMap<String, Article>>,
    retries: RwLock<Vec<PendingRetry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored articles across all sources.
    pub fn len(&self) -> usize {
        self.articles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn term_frequency(text: &str, terms: &[String]) -> f64 {
    let mut count = 0usize;
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let token = token.to_lowercase();
        if terms.iter().any(|t| *t == token) {
            count += 1;
        }
    }
    count as f64
}

fn matches_source(article: &Article, source: Option<&str>) -> bool {
    source.map_or(true, |s| article.source == s)
}

fn sort_candidates(candidates: &mut Vec<ScoredCandidate>, limit: usize) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.article_id.cmp(&b.article_id))
    });
    candidates.truncate(limit);
}

#[async_trait]
impl ArticleStore for InMemoryStore {
    async fn get_article(&self, id: &str) -> Result<Option<Article>> {
        let articles = self.articles.read().unwrap_or_else(PoisonError::into_inner);
        Ok(articles.get(id).cloned())
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        let articles = self.articles.read().unwrap_or_else(PoisonError::into_inner);
        Ok(articles.contains_key(id))
    }

    async fn upsert_article(&self, article: &Article) -> Result<()> {
        let mut articles = self.articles.write().unwrap_or_else(PoisonError::into_inner);
        articles.insert(article.id.clone(), article.clone());
        drop(articles);
        self.retries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| r.article_id != article.id);
        Ok(())
    }

    async fn count_by_source(&self, source: &str) -> Result<i64> {
        let articles = self.articles.read().unwrap_or_else(PoisonError::into_inner);
        Ok(articles.values().filter(|a| a.source == source).count() as i64)
    }

    async fn source_counts(&self) -> Result<Vec<SourceCount>> {
        let articles = self.articles.read().unwrap_or_else(PoisonError::into_inner);
        let mut by_source: HashMap<&str, SourceCount> = HashMap::new();
        for article in articles.values() {
            let entry = by_source
                .entry(article.source.as_str())
                .or_insert_with(|| SourceCount {
                    source: article.source.clone(),
                    articles: 0,
                    embedded: 0,
                });
            entry.articles += 1;
            if article.embedding.is_some() {
                entry.embedded += 1;
            }
        }
        let mut counts: Vec<SourceCount> = by_source.into_values().collect();
        counts.sort_by(|a, b| b.articles.cmp(&a.articles).then_with(|| a.source.cmp(&b.source)));
        Ok(counts)
    }

    async fn keyword_search(
        &self,
        query: &str,
        weights: FieldWeights,
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredCandidate>> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let articles = self.articles.read().unwrap_or_else(PoisonError::into_inner);
        let mut candidates: Vec<ScoredCandidate> = articles
            .values()
            .filter(|a| matches_source(a, source))
            .filter_map(|a| {
                let score = weights.title * term_frequency(&a.title, &terms)
                    + weights.abstract_text * term_frequency(&a.abstract_text, &terms)
                    + weights.content * term_frequency(&a.content, &terms);
                (score > 0.0).then(|| ScoredCandidate {
                    article_id: a.id.clone(),
                    raw_score: score,
                })
            })
            .collect();
        sort_candidates(&mut candidates, limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredCandidate>> {
        let articles = self.articles.read().unwrap_or_else(PoisonError::into_inner);
        let mut candidates: Vec<ScoredCandidate> = articles
            .values()
            .filter(|a| matches_source(a, source))
            .filter_map(|a| {
                a.embedding.as_ref().map(|vec| ScoredCandidate {
                    article_id: a.id.clone(),
                    raw_score: cosine_similarity(query_vec, vec) as f64,
                })
            })
            .collect();
        sort_candidates(&mut candidates, limit);
        Ok(candidates)
    }

    async fn pending_embeddings(
        &self,
        model: &str,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>> {
        let articles = self.articles.read().unwrap_or_else(PoisonError::into_inner);
        let mut pending: Vec<Article> = articles
            .values()
            .filter(|a| matches_source(a, source))
            .filter(|a| a.embedding.is_none() || a.embedding_model.as_deref() != Some(model))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at).then_with(|| a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn update_embedding(&self, id: &str, vector: &[f32], model: &str) -> Result<()> {
        let mut articles = self.articles.write().unwrap_or_else(PoisonError::into_inner);
        match articles.get_mut(id) {
            Some(article) => {
                article.embedding = Some(vector.to_vec());
                article.embedding_model = Some(model.to_string());
                Ok(())
            }
            None => bail!("article not found: {}", id),
        }
    }

    async fn clear_embeddings(&self, source: Option<&str>) -> Result<u64> {
        let mut articles = self.articles.write().unwrap_or_else(PoisonError::into_inner);
        let mut cleared = 0u64;
        for article in articles.values_mut().filter(|a| matches_source(a, source)) {
            if article.embedding.take().is_some() {
                cleared += 1;
            }
            article.embedding_model = None;
        }
        Ok(cleared)
    }

    async fn list_articles(&self, source: Option<&str>, limit: usize) -> Result<Vec<Article>> {
        let articles = self.articles.read().unwrap_or_else(PoisonError::into_inner);
        let mut listed: Vec<Article> = articles
            .values()
            .filter(|a| matches_source(a, source))
            .cloned()
            .collect();
        listed.sort_by(|a, b| {
            b.published_at
                .is_some()
                .cmp(&a.published_at.is_some())
                .then_with(|| b.published_at.cmp(&a.published_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        listed.truncate(limit);
        Ok(listed)
    }

    async fn record_failure(&self, retry: &PendingRetry) -> Result<()> {
        let mut retries = self.retries.write().unwrap_or_else(PoisonError::into_inner);
        match retries.iter_mut().find(|r| r.article_id == retry.article_id) {
            Some(existing) => *existing = retry.clone(),
            None => retries.push(retry.clone()),
        }
        Ok(())
    }

    async fn pending_retries(
        &self,
        source: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<PendingRetry>> {
        let retries = self.retries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(retries
            .iter()
            .filter(|r| r.source == source && r.attempts < max_attempts)
            .take(limit)
            .cloned()
            .collect())
    }
}
