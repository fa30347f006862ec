//! Ingestion controller.
//!
//! Pulls `requested_count` *new* articles for one source filter into the
//! store, each with its embedding. The starting offset is derived from
//! what is already stored (`count_by_source`), so repeated runs walk
//! further into the upstream listing instead of re-reading its head.
//!
//! # Pipeline (per new article)
//!
//! ```text
//! ArticleStub ─► fetch_content ─► truncate ─► embed ─► upsert
//!                (timeout)                    (timeout)
//! ```
//!
//! Any stage failing marks that one article failed; the run continues.
//! A store read that fails mid-run (existence check, retry list) is
//! recorded the same way. Only a first page that cannot be fetched after
//! bounded retries, or an unreadable stored count before the run starts,
//! aborts the call.
//!
//! A failed article is remembered in the store with its listing record.
//! The next run for the same filter tries it again before reading new
//! pages, up to [`MAX_RETRY_ATTEMPTS`] attempts in total.
//!
//! # Concurrency
//!
//! Runs on the same source filter are serialized through [`SourceLocks`],
//! which every clone of the controller shares. Different filters proceed
//! independently.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use journal_harness_core::embedding::EmbeddingProvider;
use journal_harness_core::models::{content_hash, embedding_input, truncate_chars, Article, IngestionRequest};
use journal_harness_core::store::{ArticleStore, PendingRetry};

use crate::config::Config;
use crate::connector::{ArticleStub, SourceConnector, SourcePage};
use crate::error::{HarnessError, ProcessingStage};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Attempts an article gets across runs before it is left alone.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Satisfied,
    UpstreamExhausted,
    PageLimit,
    Deadline,
    UpstreamError,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Satisfied => "satisfied",
            StopReason::UpstreamExhausted => "upstream_exhausted",
            StopReason::PageLimit => "page_limit",
            StopReason::Deadline => "deadline",
            StopReason::UpstreamError => "upstream_error",
        };
        f.write_str(name)
    }
}

/// One article that could not be ingested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleFailure {
    /// `None` for malformed upstream records without a usable id.
    pub article_id: Option<String>,
    pub stage: ProcessingStage,
    pub reason: String,
}

impl From<ArticleFailure> for HarnessError {
    fn from(failure: ArticleFailure) -> Self {
        HarnessError::ArticleProcessingFailed {
            id: failure.article_id.unwrap_or_else(|| "<unknown>".to_string()),
            stage: failure.stage,
            reason: failure.reason,
        }
    }
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: String,
    pub source_filter: String,
    pub requested: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub pages_scanned: usize,
    /// Articles neither stored before nor seen earlier in this run.
    pub found_new: usize,
    pub indexed: usize,
    pub skipped_duplicates: usize,
    /// Previously failed articles attempted again at the start of the run.
    pub retried: usize,
    pub failed: usize,
    pub failures: Vec<ArticleFailure>,
    pub per_article_titles: Vec<String>,
    pub stop_reason: StopReason,
    /// `min(found_new, requested) / requested`.
    pub discovery_rate: f64,
    /// `indexed / found_new`, or `1.0` when nothing new was found.
    pub indexing_rate: f64,
    pub elapsed_ms: u64,
}

/// Tunables for the controller, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub page_size: usize,
    pub max_pages_to_scan: usize,
    pub content_max_chars: usize,
    pub run_budget: Duration,
    /// Bound on each upstream call and store write.
    pub call_timeout: Duration,
    /// Bound on one embedding call, provider retries included.
    pub embed_timeout: Duration,
    pub first_page_retries: u32,
    pub retry_backoff: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        let embed_attempts = u64::from(config.embedding.max_retries) + 1;
        Self {
            page_size: config.source.page_size,
            max_pages_to_scan: config.source.max_pages_to_scan,
            content_max_chars: config.ingest.content_max_chars,
            run_budget: Duration::from_secs(config.ingest.run_budget_secs),
            call_timeout: Duration::from_secs(config.source.timeout_secs),
            embed_timeout: Duration::from_secs(config.embedding.timeout_secs * embed_attempts),
            first_page_retries: config.source.max_retries,
            retry_backoff: Duration::from_millis(config.source.retry_backoff_ms),
        }
    }
}

/// Per-source-filter locks shared by all clones of a controller.
#[derive(Clone, Default)]
pub struct SourceLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SourceLocks {
    /// Wait for exclusive use of `source`.
    pub async fn acquire(&self, source: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(source.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

#[derive(Clone)]
pub struct IngestionController {
    store: Arc<dyn ArticleStore>,
    connector: Arc<dyn SourceConnector>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: IngestSettings,
    locks: SourceLocks,
    progress: Arc<dyn ProgressReporter>,
}

impl IngestionController {
    pub fn new(
        store: Arc<dyn ArticleStore>,
        connector: Arc<dyn SourceConnector>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            connector,
            embedder,
            settings,
            locks: SourceLocks::default(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    /// Run one ingestion.
    #[tracing::instrument(
        skip(self, request),
        fields(source = %request.source_filter, requested = request.requested_count)
    )]
    pub async fn ingest(&self, request: &IngestionRequest) -> Result<IngestionReport, HarnessError> {
        let filter = request.source_filter.trim();
        if filter.is_empty() {
            return Err(HarnessError::InvalidRequest("source filter must not be empty".into()));
        }
        if request.requested_count == 0 {
            return Err(HarnessError::InvalidRequest("count must be > 0".into()));
        }
        if request.max_pages_to_scan == 0 {
            return Err(HarnessError::InvalidRequest("max_pages must be > 0".into()));
        }
        if self.embedder.dims() == 0 {
            return Err(HarnessError::InvalidRequest(
                "ingestion requires an embedding provider; set [embedding] provider".into(),
            ));
        }

        let _guard = self.locks.acquire(filter).await;
        let started = Instant::now();
        let deadline = started + self.settings.run_budget;
        let requested = request.requested_count;

        let stored = self.store_call(self.store.count_by_source(filter)).await?;
        let start_offset = usize::try_from(stored).unwrap_or(0);

        let mut run = RunState {
            offset: start_offset,
            seen: HashSet::new(),
            pages_scanned: 0,
            found_new: 0,
            indexed: 0,
            skipped_duplicates: 0,
            failures: Vec::new(),
            titles: Vec::new(),
        };

        info!(start_offset, "ingestion started");

        let retried = self.retry_failed(filter, requested, deadline, &mut run).await;

        let stop_reason = loop {
            if run.indexed >= requested {
                break StopReason::Satisfied;
            }
            if run.pages_scanned >= request.max_pages_to_scan {
                break StopReason::PageLimit;
            }
            if Instant::now() >= deadline {
                break StopReason::Deadline;
            }

            self.progress.report(ProgressEvent::Scanning {
                source: filter.to_string(),
                page: run.pages_scanned + 1,
                offset: run.offset,
            });

            let page = if run.pages_scanned == 0 {
                self.first_page(filter, run.offset)
                    .await
                    .map_err(|e| HarnessError::UpstreamUnavailable(format!("{:#}", e)))?
            } else {
                match self.fetch_page(filter, run.offset).await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(offset = run.offset, error = %format!("{:#}", e), "upstream failed mid-run");
                        break StopReason::UpstreamError;
                    }
                }
            };
            run.pages_scanned += 1;

            if page.is_empty() {
                break StopReason::UpstreamExhausted;
            }

            for record in &page.malformed {
                let failure = ArticleFailure {
                    article_id: record.id.clone(),
                    stage: ProcessingStage::Schema,
                    reason: record.reason.clone(),
                };
                warn!(error = %HarnessError::from(failure.clone()), "skipping malformed record");
                run.failures.push(failure);
                run.offset += 1;
            }

            if let Some(reason) = self
                .process_items(filter, requested, deadline, &page.items, &mut run)
                .await?
            {
                break reason;
            }
            if !page.has_more {
                break StopReason::UpstreamExhausted;
            }
        };

        let failed = run.failures.len();
        let report = IngestionReport {
            run_id: Uuid::new_v4().to_string(),
            source_filter: filter.to_string(),
            requested,
            start_offset,
            end_offset: run.offset,
            pages_scanned: run.pages_scanned,
            found_new: run.found_new,
            indexed: run.indexed,
            skipped_duplicates: run.skipped_duplicates,
            retried,
            failed,
            failures: run.failures,
            per_article_titles: run.titles,
            stop_reason,
            discovery_rate: run.found_new.min(requested) as f64 / requested as f64,
            indexing_rate: if run.found_new == 0 {
                1.0
            } else {
                run.indexed as f64 / run.found_new as f64
            },
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            indexed = report.indexed,
            failed = report.failed,
            skipped = report.skipped_duplicates,
            pages = report.pages_scanned,
            stop_reason = %report.stop_reason,
            "ingestion finished"
        );
        Ok(report)
    }

    /// Walk one page's items. Returns a stop reason when the run should
    /// end before the page is exhausted.
    async fn process_items(
        &self,
        filter: &str,
        requested: usize,
        deadline: Instant,
        items: &[ArticleStub],
        run: &mut RunState,
    ) -> Result<Option<StopReason>, HarnessError> {
        for stub in items {
            if run.indexed >= requested {
                return Ok(Some(StopReason::Satisfied));
            }
            if Instant::now() >= deadline {
                return Ok(Some(StopReason::Deadline));
            }
            run.offset += 1;

            if !run.seen.insert(stub.id.clone()) {
                run.skipped_duplicates += 1;
                continue;
            }
            match self.is_stored(&stub.id, run).await {
                Some(true) => run.skipped_duplicates += 1,
                Some(false) => {
                    run.found_new += 1;
                    self.attempt(filter, requested, stub, 0, run).await;
                }
                None => {}
            }
        }
        Ok(None)
    }

    /// Existence check that records a store-stage failure instead of
    /// aborting the run. `None` means the article's state is unknown.
    async fn is_stored(&self, id: &str, run: &mut RunState) -> Option<bool> {
        match self.store_call(self.store.contains(id)).await {
            Ok(stored) => Some(stored),
            Err(e) => {
                let failure = ArticleFailure {
                    article_id: Some(id.to_string()),
                    stage: ProcessingStage::Store,
                    reason: format!("existence check failed: {}", e),
                };
                warn!(error = %HarnessError::from(failure.clone()), "article skipped");
                run.failures.push(failure);
                None
            }
        }
    }

    /// Give articles that failed in earlier runs another attempt.
    async fn retry_failed(
        &self,
        filter: &str,
        requested: usize,
        deadline: Instant,
        run: &mut RunState,
    ) -> usize {
        let pending = match self
            .store_call(self.store.pending_retries(filter, MAX_RETRY_ATTEMPTS, requested))
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "could not read retry list; continuing with new pages");
                return 0;
            }
        };
        let mut attempted = 0;

        for retry in pending {
            if run.indexed >= requested || Instant::now() >= deadline {
                break;
            }
            let stub: ArticleStub = match serde_json::from_str(&retry.record) {
                Ok(stub) => stub,
                Err(e) => {
                    warn!(article_id = %retry.article_id, error = %e, "unreadable retry record; retiring it");
                    let retired = PendingRetry {
                        attempts: MAX_RETRY_ATTEMPTS,
                        last_error: format!("unreadable record: {}", e),
                        ..retry
                    };
                    if let Err(e) = self.store_call(self.store.record_failure(&retired)).await {
                        warn!(error = %e, "could not retire retry record");
                    }
                    continue;
                }
            };
            if !run.seen.insert(stub.id.clone()) || self.is_stored(&stub.id, run).await != Some(false) {
                continue;
            }
            attempted += 1;
            run.found_new += 1;
            info!(article_id = %stub.id, attempt = retry.attempts + 1, "retrying failed article");
            self.attempt(filter, requested, &stub, retry.attempts, run).await;
        }
        attempted
    }

    /// Index one new article, recording the outcome in `run`. A failure is
    /// remembered for the next run.
    async fn attempt(
        &self,
        filter: &str,
        requested: usize,
        stub: &ArticleStub,
        prior_attempts: u32,
        run: &mut RunState,
    ) {
        match self.index_article(filter, stub).await {
            Ok(()) => {
                run.indexed += 1;
                run.titles.push(stub.title.clone());
                self.progress.report(ProgressEvent::Indexed {
                    source: filter.to_string(),
                    indexed: run.indexed,
                    requested,
                });
            }
            Err(failure) => {
                warn!(error = %HarnessError::from(failure.clone()), "article skipped");
                self.remember_failure(filter, stub, prior_attempts + 1, &failure)
                    .await;
                run.failures.push(failure);
            }
        }
    }

    async fn remember_failure(
        &self,
        filter: &str,
        stub: &ArticleStub,
        attempts: u32,
        failure: &ArticleFailure,
    ) {
        let record = match serde_json::to_string(stub) {
            Ok(record) => record,
            Err(e) => {
                warn!(article_id = %stub.id, error = %e, "could not serialize record for retry");
                return;
            }
        };
        let retry = PendingRetry {
            article_id: stub.id.clone(),
            source: filter.to_string(),
            record,
            attempts,
            last_error: format!("{}: {}", failure.stage, failure.reason),
        };
        if let Err(e) = self.store_call(self.store.record_failure(&retry)).await {
            warn!(article_id = %stub.id, error = %e, "could not record failure for retry");
        }
    }

    async fn index_article(&self, filter: &str, stub: &ArticleStub) -> Result<(), ArticleFailure> {
        let fail = |stage: ProcessingStage, reason: String| ArticleFailure {
            article_id: Some(stub.id.clone()),
            stage,
            reason,
        };

        let full = match timeout(
            self.settings.call_timeout,
            self.connector.fetch_content(filter, &stub.id),
        )
        .await
        {
            Ok(Ok(full)) => full,
            Ok(Err(e)) => return Err(fail(ProcessingStage::ContentFetch, format!("{:#}", e))),
            Err(_) => return Err(fail(ProcessingStage::ContentFetch, "timed out".into())),
        };

        let cap = self.settings.content_max_chars;
        let abstract_text = stub
            .abstract_text
            .clone()
            .or(full.abstract_text)
            .unwrap_or_default();
        let content = truncate_chars(&full.body, cap).to_string();
        let input_cap = match self.embedder.max_input_chars() {
            0 => cap,
            limit => cap.min(limit),
        };
        let input = embedding_input(&stub.title, &abstract_text, &content, input_cap);

        let vector = match timeout(self.settings.embed_timeout, self.embedder.embed_one(&input)).await {
            Ok(Ok(vector)) => vector,
            Ok(Err(e)) => return Err(fail(ProcessingStage::Embedding, format!("{:#}", e))),
            Err(_) => return Err(fail(ProcessingStage::Embedding, "timed out".into())),
        };
        if vector.len() != self.embedder.dims() {
            return Err(fail(
                ProcessingStage::Embedding,
                format!(
                    "expected {} dimensions, got {}",
                    self.embedder.dims(),
                    vector.len()
                ),
            ));
        }

        let article = Article {
            id: stub.id.clone(),
            content_hash: content_hash(&stub.title, &abstract_text, &content),
            title: stub.title.clone(),
            abstract_text,
            content,
            source: filter.to_string(),
            authors: stub.authors.clone(),
            published_at: stub.published_at,
            ingested_at: Utc::now().timestamp(),
            embedding: Some(vector),
            embedding_model: Some(self.embedder.model_name().to_string()),
        };

        match timeout(self.settings.call_timeout, self.store.upsert_article(&article)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(fail(ProcessingStage::Store, format!("{:#}", e))),
            Err(_) => Err(fail(ProcessingStage::Store, "timed out".into())),
        }
    }

    /// First page with bounded retry and exponential backoff.
    async fn first_page(&self, filter: &str, offset: usize) -> anyhow::Result<SourcePage> {
        let mut attempt = 0;
        loop {
            match self.fetch_page(filter, offset).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt < self.settings.first_page_retries => {
                    let delay = self.settings.retry_backoff * 2u32.pow(attempt.min(5));
                    attempt += 1;
                    warn!(attempt, ?delay, error = %format!("{:#}", e), "first page failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_page(&self, filter: &str, offset: usize) -> anyhow::Result<SourcePage> {
        match timeout(
            self.settings.call_timeout,
            self.connector
                .list_articles(filter, offset, self.settings.page_size),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "listing timed out after {}s",
                self.settings.call_timeout.as_secs()
            ),
        }
    }

    async fn store_call<T>(
        &self,
        call: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, HarnessError> {
        match timeout(self.settings.call_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(HarnessError::Timeout("article store".into())),
        }
    }
}

struct RunState {
    offset: usize,
    seen: HashSet<String>,
    pages_scanned: usize,
    found_new: usize,
    indexed: usize,
    skipped_duplicates: usize,
    failures: Vec<ArticleFailure>,
    titles: Vec<String>,
}

pub fn print_report(report: &IngestionReport) {
    println!("ingest {}", report.source_filter);
    println!(
        "  indexed: {} of {} requested ({} new found, {} duplicates skipped, {} failed)",
        report.indexed, report.requested, report.found_new, report.skipped_duplicates, report.failed
    );
    if report.retried > 0 {
        println!("  retried from earlier runs: {}", report.retried);
    }
    println!(
        "  offset: {} -> {} over {} page(s)",
        report.start_offset, report.end_offset, report.pages_scanned
    );
    println!(
        "  stop: {}  discovery: {:.0}%  indexing: {:.0}%  elapsed: {}ms",
        report.stop_reason,
        report.discovery_rate * 100.0,
        report.indexing_rate * 100.0,
        report.elapsed_ms
    );
    for title in &report.per_article_titles {
        println!("    + {}", title);
    }
    for failure in &report.failures {
        println!(
            "    ! {} [{}] {}",
            failure.article_id.as_deref().unwrap_or("<unknown>"),
            failure.stage,
            failure.reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn source_locks_serialize_same_filter() {
        let locks = SourceLocks::default();
        let held = locks.acquire("nejm").await;

        let clone = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = clone.acquire("nejm").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different filter is independent.
        let _other = locks.acquire("catalyst").await;

        drop(held);
        waiter.await.unwrap();
    }

    #[test]
    fn stop_reason_names() {
        assert_eq!(StopReason::UpstreamExhausted.to_string(), "upstream_exhausted");
        assert_eq!(
            serde_json::to_value(StopReason::PageLimit).unwrap(),
            serde_json::json!("page_limit")
        );
    }

    #[test]
    fn failure_converts_to_processing_error() {
        let err: HarnessError = ArticleFailure {
            article_id: None,
            stage: ProcessingStage::Schema,
            reason: "missing field `doi`".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "article <unknown> failed at schema: missing field `doi`"
        );
    }
}
