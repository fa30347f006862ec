//! Shared fakes for the integration tests: an in-process upstream, a
//! deterministic bag-of-words embedder, and scripted generators.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use journal_harness::config::{self, Config};
use journal_harness::connector::{
    ArticleStub, FullArticle, MalformedRecord, SourceConnector, SourcePage,
};
use journal_harness::harness::Harness;
use journal_harness::sqlite_store::SqliteStore;
use journal_harness::{db, migrate};
use journal_harness_core::embedding::EmbeddingProvider;
use journal_harness_core::generation::GenerationProvider;
use journal_harness_core::models::Article;
use journal_harness_core::store::{
    ArticleStore, FieldWeights, PendingRetry, ScoredCandidate, SourceCount,
};

// ============ Upstream ============

#[derive(Debug, Clone)]
pub struct FakeArticle {
    pub id: String,
    pub title: String,
    pub abstract_text: String,
    pub body: String,
}

impl FakeArticle {
    pub fn new(id: &str, title: &str, abstract_text: &str, body: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            abstract_text: abstract_text.to_string(),
            body: body.to_string(),
        }
    }
}

/// `n` generic articles with ids `10.1056/{prefix}{i}`.
pub fn numbered(prefix: &str, n: usize) -> Vec<FakeArticle> {
    (0..n)
        .map(|i| {
            FakeArticle::new(
                &format!("10.1056/{}{:03}", prefix, i),
                &format!("Study {} on {}", i, prefix),
                &format!("Abstract of study {} in the {} series.", i, prefix),
                &format!("Full text of study {} in the {} series. Methods and results follow.", i, prefix),
            )
        })
        .collect()
}

/// In-process [`SourceConnector`] with failure injection.
#[derive(Default)]
pub struct FakeUpstream {
    collections: HashMap<String, Vec<FakeArticle>>,
    malformed: HashSet<(String, usize)>,
    failing_fetch: Mutex<HashSet<String>>,
    listing_down: AtomicBool,
    fail_listing_after: Mutex<Option<usize>>,
    list_delay: Duration,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, filter: &str, articles: Vec<FakeArticle>) -> Self {
        self.collections.insert(filter.to_string(), articles);
        self
    }

    /// Serve the record at `position` of `filter` as a schema mismatch.
    pub fn with_malformed(mut self, filter: &str, position: usize) -> Self {
        self.malformed.insert((filter.to_string(), position));
        self
    }

    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    pub fn fail_fetch(&self, id: &str) {
        self.failing_fetch.lock().unwrap().insert(id.to_string());
    }

    pub fn heal_fetch(&self, id: &str) {
        self.failing_fetch.lock().unwrap().remove(id);
    }

    pub fn set_listing_down(&self, down: bool) {
        self.listing_down.store(down, Ordering::SeqCst);
    }

    /// Let `calls` listing calls succeed, then fail every later one.
    pub fn fail_listing_after(&self, calls: usize) {
        *self.fail_listing_after.lock().unwrap() = Some(calls);
    }
}

#[async_trait]
impl SourceConnector for FakeUpstream {
    async fn list_articles(&self, filter: &str, offset: usize, page_size: usize) -> Result<SourcePage> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        if self.listing_down.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        if let Some(limit) = *self.fail_listing_after.lock().unwrap() {
            if call >= limit {
                bail!("503 Service Unavailable");
            }
        }

        let articles = self.collections.get(filter).map(Vec::as_slice).unwrap_or(&[]);
        let end = (offset + page_size).min(articles.len());
        let mut page = SourcePage {
            has_more: offset + page_size < articles.len(),
            ..SourcePage::default()
        };
        for (position, article) in articles.iter().enumerate().take(end).skip(offset) {
            if self.malformed.contains(&(filter.to_string(), position)) {
                page.malformed.push(MalformedRecord {
                    id: Some(article.id.clone()),
                    reason: "missing field `text`".to_string(),
                });
                continue;
            }
            page.items.push(ArticleStub {
                id: article.id.clone(),
                title: article.title.clone(),
                abstract_text: Some(article.abstract_text.clone()),
                published_at: Some(1_700_000_000 + position as i64 * 86_400),
                authors: Some("A. Author, B. Author".to_string()),
                journal: Some(filter.to_string()),
            });
        }
        Ok(page)
    }

    async fn fetch_content(&self, filter: &str, article_id: &str) -> Result<FullArticle> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_fetch.lock().unwrap().contains(article_id) {
            bail!("content endpoint returned 502");
        }
        let article = self
            .collections
            .get(filter)
            .and_then(|articles| articles.iter().find(|a| a.id == article_id));
        match article {
            Some(a) => Ok(FullArticle {
                id: a.id.clone(),
                abstract_text: Some(a.abstract_text.clone()),
                body: a.body.clone(),
            }),
            None => bail!("404 no such article: {}", article_id),
        }
    }
}

// ============ Embedders ============

pub const BOW_DIMS: usize = 256;

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Hashed bag-of-words vector, L2-normalized.
pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; BOW_DIMS];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
    {
        let token = token.to_lowercase();
        v[(fnv1a(&token) % BOW_DIMS as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Deterministic embedder: texts containing `poison` fail.
#[derive(Default)]
pub struct BagOfWords {
    pub poison: Option<String>,
    pub calls: AtomicUsize,
}

impl BagOfWords {
    pub fn poisoned(needle: &str) -> Self {
        Self {
            poison: Some(needle.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for BagOfWords {
    fn model_name(&self) -> &str {
        "bow-256"
    }
    fn dims(&self) -> usize {
        BOW_DIMS
    }
    fn max_input_chars(&self) -> usize {
        4000
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(needle) = &self.poison {
            if texts.iter().any(|t| t.contains(needle.as_str())) {
                bail!("embedding service rejected input");
            }
        }
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

/// Same model and dimensions as [`BagOfWords`], but always unreachable.
pub struct UnreachableEmbedder;

#[async_trait]
impl EmbeddingProvider for UnreachableEmbedder {
    fn model_name(&self) -> &str {
        "bow-256"
    }
    fn dims(&self) -> usize {
        BOW_DIMS
    }
    fn max_input_chars(&self) -> usize {
        4000
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embedding service unreachable")
    }
}

// ============ Generators ============

/// Records every prompt and answers with a fixed reply.
pub struct RecordingGenerator {
    pub reply: String,
    pub prompts: Mutex<Vec<String>>,
}

impl RecordingGenerator {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationProvider for RecordingGenerator {
    fn model_name(&self) -> &str {
        "recording"
    }
    fn max_prompt_chars(&self) -> usize {
        32_000
    }
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.reply.clone())
    }
}

pub struct FailingGenerator;

#[async_trait]
impl GenerationProvider for FailingGenerator {
    fn model_name(&self) -> &str {
        "failing"
    }
    fn max_prompt_chars(&self) -> usize {
        32_000
    }
    async fn generate(&self, _prompt: &str) -> Result<String> {
        bail!("model server returned 500")
    }
}

// ============ Stores ============

/// Delegates to `inner`, except that `contains` starts failing once it
/// has been called `contains_ok` times, and `pending_retries` fails while
/// `retries_down` is set.
pub struct FlakyStore {
    inner: Arc<dyn ArticleStore>,
    contains_ok: usize,
    pub contains_calls: AtomicUsize,
    pub retries_down: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ArticleStore>, contains_ok: usize) -> Self {
        Self {
            inner,
            contains_ok,
            contains_calls: AtomicUsize::new(0),
            retries_down: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ArticleStore for FlakyStore {
    async fn get_article(&self, id: &str) -> Result<Option<Article>> {
        self.inner.get_article(id).await
    }
    async fn contains(&self, id: &str) -> Result<bool> {
        let n = self.contains_calls.fetch_add(1, Ordering::SeqCst);
        if n >= self.contains_ok {
            bail!("database is locked");
        }
        self.inner.contains(id).await
    }
    async fn upsert_article(&self, article: &Article) -> Result<()> {
        self.inner.upsert_article(article).await
    }
    async fn count_by_source(&self, source: &str) -> Result<i64> {
        self.inner.count_by_source(source).await
    }
    async fn source_counts(&self) -> Result<Vec<SourceCount>> {
        self.inner.source_counts().await
    }
    async fn keyword_search(
        &self,
        query: &str,
        weights: FieldWeights,
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredCandidate>> {
        self.inner.keyword_search(query, weights, limit, source).await
    }
    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredCandidate>> {
        self.inner.vector_search(query_vec, limit, source).await
    }
    async fn pending_embeddings(
        &self,
        model: &str,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>> {
        self.inner.pending_embeddings(model, source, limit).await
    }
    async fn update_embedding(&self, id: &str, vector: &[f32], model: &str) -> Result<()> {
        self.inner.update_embedding(id, vector, model).await
    }
    async fn clear_embeddings(&self, source: Option<&str>) -> Result<u64> {
        self.inner.clear_embeddings(source).await
    }
    async fn list_articles(&self, source: Option<&str>, limit: usize) -> Result<Vec<Article>> {
        self.inner.list_articles(source, limit).await
    }
    async fn record_failure(&self, retry: &PendingRetry) -> Result<()> {
        self.inner.record_failure(retry).await
    }
    async fn pending_retries(
        &self,
        source: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<PendingRetry>> {
        if self.retries_down.load(Ordering::SeqCst) {
            bail!("no such table: ingest_retries");
        }
        self.inner.pending_retries(source, max_attempts, limit).await
    }
}

// ============ Harness setup ============

pub fn test_config(db_path: &Path) -> Config {
    let text = format!(
        r#"
[db]
path = "{}"

[source]
page_size = 5
max_pages_to_scan = 20
timeout_secs = 5
max_retries = 1
retry_backoff_ms = 1

[ingest]
run_budget_secs = 60

[embedding]
cache_size = 16
timeout_secs = 5
max_retries = 0

[retrieval]
timeout_ms = 5000
embed_retry_backoff_ms = 1
"#,
        db_path.display()
    );
    let config: Config = toml::from_str(&text).unwrap();
    config::validate(&config).unwrap();
    config
}

/// A migrated SQLite store in `tmp`.
pub async fn sqlite_store(tmp: &TempDir) -> (Config, Arc<dyn ArticleStore>) {
    let config = test_config(&tmp.path().join("jh.sqlite"));
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    (config, Arc::new(SqliteStore::new(pool)))
}

pub async fn harness(
    tmp: &TempDir,
    upstream: Arc<FakeUpstream>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
) -> Harness {
    let (config, store) = sqlite_store(tmp).await;
    Harness::from_parts(config, store, upstream, embedder, generator)
}

/// A harness over an existing store, e.g. to swap in a failing embedder.
pub fn harness_on(
    config: Config,
    store: Arc<dyn ArticleStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
) -> Harness {
    Harness::from_parts(
        config,
        store,
        Arc::new(FakeUpstream::new()),
        embedder,
        generator,
    )
}

/// Three diabetes articles among seven on other topics.
pub fn diabetes_corpus() -> Vec<FakeArticle> {
    vec![
        FakeArticle::new(
            "10.1056/cardio001",
            "Statin therapy after myocardial infarction",
            "Cardiology cohort of patients with coronary disease.",
            "Statins lowered cholesterol and cardiac events over five years.",
        ),
        FakeArticle::new(
            "10.1056/diab001",
            "Metformin as diabetes treatment in adults",
            "Diabetes treatment with metformin improved glycemic control.",
            "Type 2 diabetes patients received metformin as first-line treatment.",
        ),
        FakeArticle::new(
            "10.1056/onc001",
            "Immunotherapy for metastatic melanoma",
            "Checkpoint inhibitors in advanced melanoma.",
            "Response rates for checkpoint blockade in melanoma were durable.",
        ),
        FakeArticle::new(
            "10.1056/diab002",
            "GLP-1 agonists for diabetes treatment",
            "Semaglutide treatment reduced HbA1c in diabetes.",
            "Diabetes outcomes improved with weekly semaglutide treatment.",
        ),
        FakeArticle::new(
            "10.1056/inf001",
            "Early antibiotics in sepsis",
            "Time to antibiotics and sepsis mortality.",
            "Each hour of delay in antibiotics raised sepsis mortality.",
        ),
        FakeArticle::new(
            "10.1056/neuro001",
            "Thrombectomy for large-vessel stroke",
            "Endovascular thrombectomy in stroke.",
            "Thrombectomy within six hours improved functional independence.",
        ),
        FakeArticle::new(
            "10.1056/diab003",
            "Insulin pumps and diabetes treatment in children",
            "Pediatric diabetes treatment with insulin pumps.",
            "Children with type 1 diabetes used closed-loop insulin treatment.",
        ),
        FakeArticle::new(
            "10.1056/pulm001",
            "Inhaled corticosteroids in asthma",
            "Asthma exacerbations with inhaled steroids.",
            "Inhaled corticosteroids reduced asthma exacerbations in adults.",
        ),
        FakeArticle::new(
            "10.1056/renal001",
            "Dialysis timing in acute kidney injury",
            "Early versus delayed dialysis.",
            "Early dialysis did not lower mortality in kidney injury.",
        ),
        FakeArticle::new(
            "10.1056/gi001",
            "Vedolizumab in ulcerative colitis",
            "Integrin blockade for colitis.",
            "Vedolizumab induced remission in moderate colitis.",
        ),
    ]
}

pub const DIABETES_IDS: [&str; 3] = ["10.1056/diab001", "10.1056/diab002", "10.1056/diab003"];
