//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults
//! suitable for a local setup (Ollama for embeddings and generation, the
//! OneSearch QA endpoint upstream). [`load_config`] parses and validates.
//!
//! Secrets never live in the file: `OPENAI_API_KEY`, `NEJM_API_USER`, and
//! `NEJM_API_KEY` are read from the environment by the clients that need them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use journal_harness_core::context::AssembleOptions;
use journal_harness_core::search::SearchParams;
use journal_harness_core::store::FieldWeights;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Upstream article API.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Articles per upstream page (the API allows at most 100).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Default safety bound on pages fetched per ingestion run.
    #[serde(default = "default_max_pages")]
    pub max_pages_to_scan: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts per upstream request. The controller spends the same
    /// number again on the first page of a run.
    #[serde(default = "default_source_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            page_size: default_page_size(),
            max_pages_to_scan: default_max_pages(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_source_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_base_url() -> String {
    "https://onesearch-api.nejmgroup-qa.org".to_string()
}
fn default_page_size() -> usize {
    100
}
fn default_max_pages() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_source_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Cap on stored content and on embedding input, in characters.
    #[serde(default = "default_content_max_chars")]
    pub content_max_chars: usize,
    /// Overall wall-clock budget for one ingestion run.
    #[serde(default = "default_run_budget_secs")]
    pub run_budget_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            content_max_chars: default_content_max_chars(),
            run_budget_secs: default_run_budget_secs(),
        }
    }
}

fn default_content_max_chars() -> usize {
    8000
}
fn default_run_budget_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama (`http://localhost:11434`) or an OpenAI-compatible API.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Entries in the query embedding LRU cache; `0` disables caching.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_content_max_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_size: default_cache_size(),
            max_input_chars: default_content_max_chars(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// The same provider for the search path: no client-level retries,
    /// so the retriever's single retry and per-attempt timeout govern.
    pub fn for_queries(&self) -> Self {
        Self {
            max_retries: 0,
            ..self.clone()
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_cache_size() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            timeout_secs: default_generation_timeout_secs(),
            max_retries: default_generation_retries(),
            max_prompt_chars: default_max_prompt_chars(),
            temperature: default_temperature(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_generation_timeout_secs() -> u64 {
    120
}
fn default_generation_retries() -> u32 {
    1
}
fn default_max_prompt_chars() -> usize {
    32_000
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_title_weight")]
    pub title_weight: f64,
    #[serde(default = "default_abstract_weight")]
    pub abstract_weight: f64,
    #[serde(default = "default_content_weight")]
    pub content_weight: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
    #[serde(default = "default_max_results_cap")]
    pub max_results_cap: usize,
    #[serde(default)]
    pub min_score: f64,
    /// Total bound on one search, embedding retry included.
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_embed_retry_backoff_ms")]
    pub embed_retry_backoff_ms: u64,
    /// Bound on each query-embedding attempt. Two attempts plus the
    /// backoff must leave room for the lexical search inside `timeout_ms`.
    #[serde(default = "default_embed_timeout_ms")]
    pub embed_timeout_ms: u64,
    /// Hits retrieved before context assembly picks the top few.
    #[serde(default = "default_max_results")]
    pub ask_candidates: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            title_weight: default_title_weight(),
            abstract_weight: default_abstract_weight(),
            content_weight: default_content_weight(),
            candidate_k: default_candidate_k(),
            default_max_results: default_max_results(),
            max_results_cap: default_max_results_cap(),
            min_score: 0.0,
            timeout_ms: default_retrieval_timeout_ms(),
            embed_retry_backoff_ms: default_embed_retry_backoff_ms(),
            embed_timeout_ms: default_embed_timeout_ms(),
            ask_candidates: default_max_results(),
        }
    }
}

impl RetrievalConfig {
    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            hybrid_alpha: self.hybrid_alpha,
            candidate_k: self.candidate_k,
            weights: FieldWeights {
                title: self.title_weight,
                abstract_text: self.abstract_weight,
                content: self.content_weight,
            },
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.4
}
fn default_title_weight() -> f64 {
    3.0
}
fn default_abstract_weight() -> f64 {
    2.0
}
fn default_content_weight() -> f64 {
    1.0
}
fn default_candidate_k() -> usize {
    50
}
fn default_max_results() -> usize {
    10
}
fn default_max_results_cap() -> usize {
    50
}
fn default_retrieval_timeout_ms() -> u64 {
    3000
}
fn default_embed_retry_backoff_ms() -> u64 {
    200
}
fn default_embed_timeout_ms() -> u64 {
    1000
}

/// Grounding context limits for `ask`.
#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_char_budget")]
    pub char_budget: usize,
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    #[serde(default = "default_content_max_chars")]
    pub per_article_max_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            char_budget: default_char_budget(),
            max_sources: default_max_sources(),
            per_article_max_chars: default_content_max_chars(),
        }
    }
}

impl ContextConfig {
    pub fn assemble_options(&self) -> AssembleOptions {
        AssembleOptions {
            char_budget: self.char_budget,
            max_sources: self.max_sources,
            per_article_max_chars: self.per_article_max_chars,
        }
    }
}

fn default_char_budget() -> usize {
    24_000
}
fn default_max_sources() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

/// Read, parse, and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.page_size == 0 || config.source.page_size > 100 {
        bail!("source.page_size must be between 1 and 100");
    }
    if config.source.max_pages_to_scan == 0 {
        bail!("source.max_pages_to_scan must be > 0");
    }
    if config.ingest.content_max_chars == 0 {
        bail!("ingest.content_max_chars must be > 0");
    }

    let retrieval = &config.retrieval;
    if !(0.0..=1.0).contains(&retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    for (name, weight) in [
        ("title_weight", retrieval.title_weight),
        ("abstract_weight", retrieval.abstract_weight),
        ("content_weight", retrieval.content_weight),
    ] {
        if weight < 0.0 {
            bail!("retrieval.{} must be >= 0", name);
        }
    }
    if retrieval.candidate_k == 0 || retrieval.default_max_results == 0 {
        bail!("retrieval.candidate_k and retrieval.default_max_results must be > 0");
    }
    if retrieval.default_max_results > retrieval.max_results_cap {
        bail!("retrieval.default_max_results must not exceed retrieval.max_results_cap");
    }
    if retrieval.embed_timeout_ms == 0
        || 2 * retrieval.embed_timeout_ms + retrieval.embed_retry_backoff_ms >= retrieval.timeout_ms
    {
        bail!(
            "retrieval.embed_timeout_ms must be > 0 and leave time for the lexical search: \
             2 × embed_timeout_ms + embed_retry_backoff_ms must be below timeout_ms"
        );
    }
    if config.context.char_budget == 0 || config.context.max_sources == 0 {
        bail!("context.char_budget and context.max_sources must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() && config.embedding.provider != "local" {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    if config.generation.is_enabled() && config.generation.model.is_none() {
        bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }
    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse("[db]\npath = \"./data/jh.sqlite\"\n").unwrap();
        assert_eq!(config.source.page_size, 100);
        assert_eq!(config.ingest.content_max_chars, 8000);
        assert!(!config.embedding.is_enabled());
        assert!((config.retrieval.hybrid_alpha - 0.4).abs() < 1e-9);
        assert_eq!(config.retrieval.search_params().weights, FieldWeights::default());
        assert_eq!(config.context.max_sources, 3);
    }

    #[test]
    fn rejects_alpha_out_of_range() {
        let err = parse("[db]\npath = \"x\"\n[retrieval]\nhybrid_alpha = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("hybrid_alpha"));
    }

    #[test]
    fn rejects_oversized_page() {
        let err = parse("[db]\npath = \"x\"\n[source]\npage_size = 500\n").unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn enabled_embedding_requires_dims() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn unknown_generation_provider() {
        let err = parse("[db]\npath = \"x\"\n[generation]\nprovider = \"bedrock\"\nmodel = \"m\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown generation provider"));
    }

    #[test]
    fn embed_timeout_must_leave_room_for_lexical_search() {
        let err = parse("[db]\npath = \"x\"\n[retrieval]\ntimeout_ms = 2000\nembed_timeout_ms = 1000\n")
            .unwrap_err();
        assert!(err.to_string().contains("embed_timeout_ms"));
    }

    #[test]
    fn query_embedding_config_has_no_client_retries() {
        let config = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"ollama\"\nmodel = \"m\"\ndims = 8\nmax_retries = 4\n")
            .unwrap();
        let queries = config.embedding.for_queries();
        assert_eq!(queries.max_retries, 0);
        assert_eq!(queries.provider, "ollama");
        assert_eq!(config.embedding.max_retries, 4);
    }
}
