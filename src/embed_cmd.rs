//! Re-vectorize stored articles.
//!
//! `embed pending` embeds articles with no vector or a vector from a
//! different model than the configured one; `embed rebuild` clears
//! vectors first and re-embeds everything. Both use the same embedding
//! input as ingestion. A failed batch is counted and skipped.

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use journal_harness_core::embedding::EmbeddingProvider;
use journal_harness_core::store::ArticleStore;

use crate::progress::{ProgressEvent, ProgressReporter};

#[derive(Debug, Clone, Default)]
pub struct EmbedOptions {
    pub source: Option<String>,
    pub limit: Option<usize>,
    pub batch_size: usize,
    /// Largest embedding input, in characters.
    pub max_input_chars: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EmbedReport {
    pub considered: usize,
    pub embedded: usize,
    pub failed: usize,
    /// Vectors cleared before re-embedding (`rebuild` only).
    pub cleared: u64,
    pub dry_run: bool,
}

/// Embed articles whose vector is missing or stale.
pub async fn embed_pending(
    store: &Arc<dyn ArticleStore>,
    embedder: &Arc<dyn EmbeddingProvider>,
    options: &EmbedOptions,
    progress: &dyn ProgressReporter,
) -> Result<EmbedReport> {
    if embedder.dims() == 0 {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let limit = options.limit.unwrap_or(i64::MAX as usize);
    let pending = store
        .pending_embeddings(embedder.model_name(), options.source.as_deref(), limit)
        .await?;

    let mut report = EmbedReport {
        considered: pending.len(),
        dry_run: options.dry_run,
        ..EmbedReport::default()
    };
    if options.dry_run || pending.is_empty() {
        return Ok(report);
    }

    let total = pending.len() as u64;
    for batch in pending.chunks(options.batch_size.max(1)) {
        let texts: Vec<String> = batch
            .iter()
            .map(|a| a.embedding_input(options.max_input_chars))
            .collect();

        match embedder.embed(&texts).await {
            Ok(vectors) if vectors.len() == batch.len() => {
                for (article, vector) in batch.iter().zip(vectors.iter()) {
                    if vector.len() != embedder.dims() {
                        warn!(article_id = %article.id, got = vector.len(), "dimension mismatch; skipping");
                        report.failed += 1;
                        continue;
                    }
                    store
                        .update_embedding(&article.id, vector, embedder.model_name())
                        .await?;
                    report.embedded += 1;
                }
            }
            Ok(vectors) => {
                warn!(expected = batch.len(), got = vectors.len(), "embedding batch size mismatch");
                report.failed += batch.len();
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), size = batch.len(), "embedding batch failed");
                report.failed += batch.len();
            }
        }

        progress.report(ProgressEvent::Embedding {
            done: (report.embedded + report.failed) as u64,
            total,
        });
    }

    info!(embedded = report.embedded, failed = report.failed, "embed pending finished");
    Ok(report)
}

/// Clear vectors (optionally for one source) and re-embed them all.
pub async fn embed_rebuild(
    store: &Arc<dyn ArticleStore>,
    embedder: &Arc<dyn EmbeddingProvider>,
    options: &EmbedOptions,
    progress: &dyn ProgressReporter,
) -> Result<EmbedReport> {
    if embedder.dims() == 0 {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let cleared = store.clear_embeddings(options.source.as_deref()).await?;
    info!(cleared, "cleared existing embeddings");

    let pending = EmbedOptions {
        limit: None,
        dry_run: false,
        ..options.clone()
    };
    let mut report = embed_pending(store, embedder, &pending, progress).await?;
    report.cleared = cleared;
    Ok(report)
}

pub fn print_report(command: &str, report: &EmbedReport) {
    if report.dry_run {
        println!("{} (dry-run)", command);
        println!("  articles needing embeddings: {}", report.considered);
        return;
    }
    println!("{}", command);
    if report.cleared > 0 {
        println!("  cleared: {}", report.cleared);
    }
    if report.considered == 0 {
        println!("  all articles up to date");
        return;
    }
    println!("  considered: {}", report.considered);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use journal_harness_core::models::{content_hash, Article};
    use journal_harness_core::store::memory::InMemoryStore;

    struct Fixed {
        model: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for Fixed {
        fn model_name(&self) -> &str {
            self.model
        }
        fn dims(&self) -> usize {
            2
        }
        fn max_input_chars(&self) -> usize {
            1000
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.fail {
                bail!("service down");
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn article(id: &str, model: Option<&str>) -> Article {
        Article {
            id: id.into(),
            title: format!("Title {}", id),
            abstract_text: String::new(),
            content: "Body".into(),
            source: "nejm".into(),
            authors: None,
            published_at: None,
            ingested_at: 0,
            content_hash: content_hash("t", "", "Body"),
            embedding: model.map(|_| vec![0.0, 1.0]),
            embedding_model: model.map(str::to_string),
        }
    }

    async fn seeded() -> Arc<dyn ArticleStore> {
        let store = InMemoryStore::new();
        store.upsert_article(&article("a", None)).await.unwrap();
        store.upsert_article(&article("b", Some("old-model"))).await.unwrap();
        store.upsert_article(&article("c", Some("new-model"))).await.unwrap();
        Arc::new(store)
    }

    fn options() -> EmbedOptions {
        EmbedOptions {
            batch_size: 8,
            max_input_chars: 1000,
            ..EmbedOptions::default()
        }
    }

    #[tokio::test]
    async fn pending_covers_missing_and_stale_models() {
        let store = seeded().await;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(Fixed {
            model: "new-model",
            fail: false,
        });

        let report = embed_pending(&store, &embedder, &options(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.considered, 2);
        assert_eq!(report.embedded, 2);

        let again = embed_pending(&store, &embedder, &options(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(again.considered, 0);
    }

    #[tokio::test]
    async fn failed_batch_is_counted_not_fatal() {
        let store = seeded().await;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(Fixed {
            model: "new-model",
            fail: true,
        });
        let report = embed_pending(&store, &embedder, &options(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.embedded, 0);
    }

    #[tokio::test]
    async fn rebuild_reembeds_everything() {
        let store = seeded().await;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(Fixed {
            model: "new-model",
            fail: false,
        });
        let report = embed_rebuild(&store, &embedder, &options(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.cleared, 2);
        assert_eq!(report.considered, 3);
        assert_eq!(report.embedded, 3);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let store = seeded().await;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(Fixed {
            model: "new-model",
            fail: false,
        });
        let opts = EmbedOptions {
            dry_run: true,
            ..options()
        };
        let report = embed_pending(&store, &embedder, &opts, &NoProgress).await.unwrap();
        assert_eq!(report.considered, 2);
        assert_eq!(report.embedded, 0);
        assert_eq!(store.get_article("a").await.unwrap().unwrap().embedding, None);
    }
}
