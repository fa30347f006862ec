//! Hybrid retriever: query embedding plus the core hybrid search, under
//! one total timeout.
//!
//! The query vector comes from the cached embedder. Each embedding
//! attempt has its own timeout (`embed_timeout`). A failed or timed-out
//! attempt is retried once after a short backoff; a second failure (or a
//! disabled provider) drops to a lexical-only, `degraded` search instead
//! of failing the request. The store search gets whatever remains of the
//! total budget, so a hung embedding service still leaves time for the
//! lexical fallback.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use journal_harness_core::embedding::EmbeddingProvider;
use journal_harness_core::search::{hybrid_search, SearchOutcome, SearchParams, SearchRequest};
use journal_harness_core::store::ArticleStore;

use crate::config::RetrievalConfig;
use crate::error::HarnessError;

#[derive(Debug, Clone)]
pub struct RetrieverSettings {
    pub params: SearchParams,
    pub default_max_results: usize,
    pub max_results_cap: usize,
    pub min_score: f64,
    pub timeout: Duration,
    /// Bound on each query-embedding attempt.
    pub embed_timeout: Duration,
    pub embed_retry_backoff: Duration,
}

impl RetrieverSettings {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            params: config.search_params(),
            default_max_results: config.default_max_results,
            max_results_cap: config.max_results_cap,
            min_score: config.min_score,
            timeout: Duration::from_millis(config.timeout_ms),
            embed_timeout: Duration::from_millis(config.embed_timeout_ms),
            embed_retry_backoff: Duration::from_millis(config.embed_retry_backoff_ms),
        }
    }
}

/// Options for one search. `None` fields fall back to configured defaults.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    pub source: Option<String>,
}

#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn ArticleStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: RetrieverSettings,
}

impl Retriever {
    /// `embedder` should already be wrapped in a
    /// [`CachedEmbedder`](crate::embedding::CachedEmbedder).
    pub fn new(
        store: Arc<dyn ArticleStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: RetrieverSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrieverSettings {
        &self.settings
    }

    #[tracing::instrument(skip(self, options), fields(max_results = ?options.max_results))]
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchOutcome, HarnessError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(HarnessError::InvalidRequest("query must not be empty".into()));
        }
        let max_results = options
            .max_results
            .unwrap_or(self.settings.default_max_results);
        if max_results == 0 {
            return Err(HarnessError::InvalidRequest("max_results must be > 0".into()));
        }
        let max_results = max_results.min(self.settings.max_results_cap);
        let min_score = options.min_score.unwrap_or(self.settings.min_score);
        let deadline = Instant::now() + self.settings.timeout;

        let (query_vec, embed_error) = match self.query_embedding(query, deadline).await {
            Ok(v) => (Some(v), None),
            Err(e) => {
                warn!(error = %e, "query embedding failed; searching lexically");
                (None, Some(e))
            }
        };

        let request = SearchRequest {
            query,
            query_vec: query_vec.as_deref(),
            source_filter: options.source.as_deref(),
            max_results,
            min_score,
            params: self.settings.params.clone(),
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut outcome = match timeout(remaining, hybrid_search(self.store.as_ref(), &request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HarnessError::Timeout(format!(
                    "search exceeded {}ms",
                    self.settings.timeout.as_millis()
                )))
            }
        };

        if let Some(e) = embed_error {
            outcome.degraded = true;
            outcome.degraded_reason = Some(e.to_string());
        }
        debug!(hits = outcome.hits.len(), degraded = outcome.degraded, "search finished");
        Ok(outcome)
    }

    async fn query_embedding(&self, query: &str, deadline: Instant) -> Result<Vec<f32>, HarnessError> {
        if self.embedder.dims() == 0 {
            return Err(HarnessError::EmbeddingUnavailable(
                "embedding provider is disabled".into(),
            ));
        }
        let text = truncate_query(query, self.embedder.max_input_chars());

        match self.embed_attempt(text, deadline).await {
            Ok(v) => Ok(v),
            Err(first) => {
                debug!(error = %first, "query embedding failed; retrying once");
                let backoff = self
                    .settings
                    .embed_retry_backoff
                    .min(deadline.saturating_duration_since(Instant::now()));
                tokio::time::sleep(backoff).await;
                self.embed_attempt(text, deadline).await
            }
        }
    }

    async fn embed_attempt(&self, text: &str, deadline: Instant) -> Result<Vec<f32>, HarnessError> {
        let budget = self
            .settings
            .embed_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        match timeout(budget, self.embedder.embed_one(text)).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(HarnessError::EmbeddingUnavailable(format!("{:#}", e))),
            Err(_) => Err(HarnessError::EmbeddingUnavailable(format!(
                "query embedding timed out after {}ms",
                budget.as_millis()
            ))),
        }
    }
}

fn truncate_query(query: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        query
    } else {
        journal_harness_core::models::truncate_chars(query, max_chars)
    }
}

/// Display shape of a search, shared by the CLI and HTTP surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    pub results: Vec<SearchResultItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub rank: usize,
    pub article_id: String,
    pub title: String,
    pub source: String,
    pub published: Option<String>,
    pub combined_score: f64,
    pub lexical_score: f64,
    pub vector_score: f64,
    pub snippet: String,
}

const SNIPPET_CHARS: usize = 240;

impl SearchResponse {
    pub fn from_outcome(query: &str, outcome: SearchOutcome) -> Self {
        let results = outcome
            .hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| {
                let article = hit.source_article;
                let text = if article.abstract_text.is_empty() {
                    &article.content
                } else {
                    &article.abstract_text
                };
                SearchResultItem {
                    rank: i + 1,
                    snippet: snippet(text),
                    published: article.published_date(),
                    article_id: hit.article_id,
                    title: article.title,
                    source: article.source,
                    combined_score: hit.combined_score,
                    lexical_score: hit.lexical_score,
                    vector_score: hit.vector_score,
                }
            })
            .collect();
        Self {
            query: query.to_string(),
            degraded: outcome.degraded,
            degraded_reason: outcome.degraded_reason,
            results,
        }
    }
}

fn snippet(text: &str) -> String {
    let cut = journal_harness_core::models::truncate_chars(text, SNIPPET_CHARS);
    if cut.len() < text.len() {
        format!("{}…", cut.trim_end())
    } else {
        cut.to_string()
    }
}

pub fn print_results(response: &SearchResponse) {
    if response.degraded {
        eprintln!(
            "note: lexical-only results ({})",
            response.degraded_reason.as_deref().unwrap_or("vector search unavailable")
        );
    }
    if response.results.is_empty() {
        println!("No results.");
        return;
    }
    for item in &response.results {
        println!(
            "{}. [{:.2}] {}",
            item.rank, item.combined_score, item.title
        );
        println!(
            "    id: {}  source: {}  published: {}",
            item.article_id,
            item.source,
            item.published.as_deref().unwrap_or("unknown")
        );
        if !item.snippet.is_empty() {
            println!("    {}", item.snippet);
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use journal_harness_core::models::{content_hash, Article};
    use journal_harness_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then embeds everything as `[1, 0]`.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            2
        }
        fn max_input_chars(&self) -> usize {
            1000
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("connection refused");
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// Never answers, like a service that accepts connections and hangs.
    struct Hanging {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Hanging {
        fn model_name(&self) -> &str {
            "hanging"
        }
        fn dims(&self) -> usize {
            2
        }
        fn max_input_chars(&self) -> usize {
            1000
        }
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            anyhow::bail!("unreachable")
        }
    }

    async fn store() -> Arc<dyn ArticleStore> {
        let store = InMemoryStore::new();
        store
            .upsert_article(&Article {
                id: "10.1056/a".into(),
                title: "Sepsis bundles".into(),
                abstract_text: "Early antibiotics in sepsis.".into(),
                content: String::new(),
                source: "nejm".into(),
                authors: None,
                published_at: None,
                ingested_at: 0,
                content_hash: content_hash("Sepsis bundles", "", ""),
                embedding: Some(vec![1.0, 0.0]),
                embedding_model: Some("flaky".into()),
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    fn settings() -> RetrieverSettings {
        RetrieverSettings {
            params: SearchParams::default(),
            default_max_results: 10,
            max_results_cap: 50,
            min_score: 0.0,
            timeout: Duration::from_secs(5),
            embed_timeout: Duration::from_secs(1),
            embed_retry_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn single_embedding_failure_is_retried() {
        let embedder = Arc::new(Flaky {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let retriever = Retriever::new(store().await, embedder.clone(), settings());
        let outcome = retriever.search("sepsis", &SearchOptions::default()).await.unwrap();
        assert!(!outcome.degraded);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert!(outcome.hits[0].vector_score > 0.99);
    }

    #[tokio::test]
    async fn persistent_embedding_failure_degrades() {
        let embedder = Arc::new(Flaky {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let retriever = Retriever::new(store().await, embedder, settings());
        let outcome = retriever.search("sepsis", &SearchOptions::default()).await.unwrap();
        assert!(outcome.degraded);
        assert_eq!(outcome.hits.len(), 1);
        assert!(outcome
            .degraded_reason
            .as_deref()
            .unwrap_or_default()
            .contains("connection refused"));
    }

    #[tokio::test]
    async fn hanging_embedder_times_out_into_lexical_search() {
        let embedder = Arc::new(Hanging {
            calls: AtomicUsize::new(0),
        });
        let settings = RetrieverSettings {
            timeout: Duration::from_millis(600),
            embed_timeout: Duration::from_millis(100),
            ..settings()
        };
        let retriever = Retriever::new(store().await, embedder.clone(), settings);

        let started = std::time::Instant::now();
        let outcome = retriever.search("sepsis", &SearchOptions::default()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(600));
        assert!(outcome.degraded);
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].vector_score, 0.0);
        assert!(outcome
            .degraded_reason
            .as_deref()
            .unwrap_or_default()
            .contains("timed out"));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejects_empty_query() {
        let embedder = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let retriever = Retriever::new(store().await, embedder, settings());
        let err = retriever.search("   ", &SearchOptions::default()).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidRequest(_)));
    }

    #[test]
    fn snippet_is_bounded() {
        let long = "word ".repeat(200);
        let s = snippet(&long);
        assert!(s.chars().count() <= SNIPPET_CHARS + 1);
        assert!(s.ends_with('…'));
        assert_eq!(snippet("short"), "short");
    }
}
