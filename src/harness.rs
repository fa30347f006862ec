//! Composition root.
//!
//! [`Harness`] wires the store, connector, embedding and generation
//! clients into the ingestion controller, retriever, and ask service,
//! and exposes the service operations the CLI and HTTP server call.
//! Cloning is cheap; clones share the store, caches, and ingestion locks.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use journal_harness_core::embedding::{cosine_similarity, EmbeddingProvider};
use journal_harness_core::generation::GenerationProvider;
use journal_harness_core::models::IngestionRequest;
use journal_harness_core::search::SearchOutcome;
use journal_harness_core::store::ArticleStore;

use crate::ask::{AskResponse, AskService, AskSettings};
use crate::config::Config;
use crate::connector::SourceConnector;
use crate::connector_onesearch::OneSearchConnector;
use crate::db;
use crate::embed_cmd::{self, EmbedOptions, EmbedReport};
use crate::embedding::{create_provider, CachedEmbedder};
use crate::error::HarnessError;
use crate::generation::create_generator;
use crate::get::{self, ArticleView};
use crate::ingest::{IngestSettings, IngestionController, IngestionReport};
use crate::migrate;
use crate::progress::{NoProgress, ProgressReporter};
use crate::retriever::{Retriever, RetrieverSettings, SearchOptions};
use crate::sqlite_store::SqliteStore;
use crate::stats::{self, StatsReport};

/// Cosine similarity of two texts under the configured embedding model.
#[derive(Debug, Clone, Serialize)]
pub struct TextSimilarity {
    pub model: String,
    pub dims: usize,
    pub similarity: f32,
}

#[derive(Clone)]
pub struct Harness {
    config: Arc<Config>,
    store: Arc<dyn ArticleStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn GenerationProvider>,
    ingestion: IngestionController,
    retriever: Retriever,
    asker: AskService,
    progress: Arc<dyn ProgressReporter>,
}

impl Harness {
    /// Connect to the configured database (migrating it) and build the
    /// production clients.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        let store: Arc<dyn ArticleStore> = Arc::new(SqliteStore::new(pool));
        let connector: Arc<dyn SourceConnector> = Arc::new(OneSearchConnector::new(&config.source)?);
        let embedder = create_provider(&config.embedding)?;
        let query_embedder = create_provider(&config.embedding.for_queries())?;
        let generator = create_generator(&config.generation)?;

        Ok(Self::assemble(
            config,
            store,
            connector,
            embedder,
            query_embedder,
            generator,
        ))
    }

    /// Assemble a harness from explicit components. Ingestion and search
    /// share `embedder`.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn ArticleStore>,
        connector: Arc<dyn SourceConnector>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        let query_embedder = Arc::clone(&embedder);
        Self::assemble(config, store, connector, embedder, query_embedder, generator)
    }

    fn assemble(
        config: Config,
        store: Arc<dyn ArticleStore>,
        connector: Arc<dyn SourceConnector>,
        embedder: Arc<dyn EmbeddingProvider>,
        query_embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        let query_embedder: Arc<dyn EmbeddingProvider> = Arc::new(CachedEmbedder::new(
            query_embedder,
            config.embedding.cache_size,
        ));

        let ingestion = IngestionController::new(
            Arc::clone(&store),
            connector,
            Arc::clone(&embedder),
            IngestSettings::from_config(&config),
        );
        let retriever = Retriever::new(
            Arc::clone(&store),
            query_embedder,
            RetrieverSettings::from_config(&config.retrieval),
        );
        let asker = AskService::new(
            retriever.clone(),
            Arc::clone(&generator),
            AskSettings {
                candidates: config.retrieval.ask_candidates,
                context: config.context.assemble_options(),
                generation_timeout: Duration::from_secs(config.generation.timeout_secs),
            },
        );

        Self {
            config: Arc::new(config),
            store,
            embedder,
            generator,
            ingestion,
            retriever,
            asker,
            progress: Arc::new(NoProgress),
        }
    }

    /// Report ingestion and embedding progress to `progress`.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.ingestion = self.ingestion.with_progress(Arc::clone(&progress));
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ArticleStore> {
        &self.store
    }

    /// Ingest up to `count` new articles from `source`.
    pub async fn ingest(
        &self,
        source: &str,
        count: usize,
        max_pages: Option<usize>,
    ) -> Result<IngestionReport, HarnessError> {
        let request = IngestionRequest {
            source_filter: source.to_string(),
            requested_count: count,
            max_pages_to_scan: max_pages.unwrap_or(self.config.source.max_pages_to_scan),
        };
        self.ingestion.ingest(&request).await
    }

    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchOutcome, HarnessError> {
        self.retriever.search(query, options).await
    }

    pub async fn ask(
        &self,
        question: &str,
        max_sources: Option<usize>,
    ) -> Result<AskResponse, HarnessError> {
        self.asker.ask(question, max_sources).await
    }

    pub async fn stats(&self) -> Result<StatsReport, HarnessError> {
        let db_path: PathBuf = self.config.db.path.clone();
        Ok(stats::collect_stats(
            self.store.as_ref(),
            &db_path,
            self.embedder.model_name(),
            self.generator.model_name(),
        )
        .await?)
    }

    /// Point lookup. A miss is `Ok(None)`.
    pub async fn get(&self, id: &str) -> Result<Option<ArticleView>, HarnessError> {
        Ok(get::get_article(self.store.as_ref(), id).await?)
    }

    pub async fn list(
        &self,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ArticleView>, HarnessError> {
        Ok(get::list_articles(self.store.as_ref(), source, limit).await?)
    }

    pub fn embed_options(&self) -> EmbedOptions {
        EmbedOptions {
            batch_size: self.config.embedding.batch_size,
            max_input_chars: self
                .config
                .ingest
                .content_max_chars
                .min(self.config.embedding.max_input_chars),
            ..EmbedOptions::default()
        }
    }

    pub async fn embed_pending(&self, options: &EmbedOptions) -> Result<EmbedReport, HarnessError> {
        self.require_embeddings()?;
        Ok(embed_cmd::embed_pending(&self.store, &self.embedder, options, self.progress.as_ref()).await?)
    }

    pub async fn embed_rebuild(&self, options: &EmbedOptions) -> Result<EmbedReport, HarnessError> {
        self.require_embeddings()?;
        Ok(embed_cmd::embed_rebuild(&self.store, &self.embedder, options, self.progress.as_ref()).await?)
    }

    pub async fn compare(&self, first: &str, second: &str) -> Result<TextSimilarity, HarnessError> {
        self.require_embeddings()?;
        if first.trim().is_empty() || second.trim().is_empty() {
            return Err(HarnessError::InvalidRequest("both texts must be non-empty".into()));
        }
        let max_chars = self.embedder.max_input_chars();
        let inputs: Vec<String> = [first, second]
            .iter()
            .map(|t| t.chars().take(max_chars).collect())
            .collect();
        let vectors = self
            .embedder
            .embed(&inputs)
            .await
            .map_err(|e| HarnessError::EmbeddingUnavailable(format!("{:#}", e)))?;
        let [a, b] = vectors.as_slice() else {
            return Err(HarnessError::EmbeddingUnavailable(format!(
                "expected 2 vectors, got {}",
                vectors.len()
            )));
        };
        Ok(TextSimilarity {
            model: self.embedder.model_name().to_string(),
            dims: a.len(),
            similarity: cosine_similarity(a, b),
        })
    }

    fn require_embeddings(&self) -> Result<(), HarnessError> {
        if self.embedder.dims() == 0 {
            return Err(HarnessError::InvalidRequest(
                "Embedding provider is disabled. Set [embedding] provider in config.".into(),
            ));
        }
        Ok(())
    }
}
