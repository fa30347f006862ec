//! `ask`: retrieve → assemble → answer.
//!
//! The response always says what happened. `status` is one of
//! `answered`, `no_sources` (retrieval found nothing; the generator was
//! not called), or `generation_unavailable` (sources are still returned).

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use journal_harness_core::answer::{answer, prompt_overhead, sources_for, SourceRef, SynthesisError};
use journal_harness_core::context::{assemble, AssembleOptions, GroundingContext};
use journal_harness_core::generation::GenerationProvider;

use crate::error::HarnessError;
use crate::retriever::{Retriever, SearchOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AskStatus {
    Answered,
    NoSources,
    GenerationUnavailable,
}

/// Shape of the grounding context that was (or would have been) sent.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSummary {
    pub total_characters: usize,
    pub char_budget: usize,
    pub truncated: bool,
    /// Article ids retrieved but left out for lack of budget.
    pub omitted: Vec<String>,
}

impl From<&GroundingContext> for ContextSummary {
    fn from(ctx: &GroundingContext) -> Self {
        Self {
            total_characters: ctx.total_characters,
            char_budget: ctx.char_budget,
            truncated: ctx.truncated(),
            omitted: ctx.omitted.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub question: String,
    pub status: AskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub sources: Vec<SourceRef>,
    pub context: ContextSummary,
    /// Retrieval ran without the vector channel.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AskSettings {
    /// Hits retrieved before assembly picks the top few.
    pub candidates: usize,
    pub context: AssembleOptions,
    pub generation_timeout: Duration,
}

#[derive(Clone)]
pub struct AskService {
    retriever: Retriever,
    generator: Arc<dyn GenerationProvider>,
    settings: AskSettings,
}

impl AskService {
    pub fn new(
        retriever: Retriever,
        generator: Arc<dyn GenerationProvider>,
        settings: AskSettings,
    ) -> Self {
        Self {
            retriever,
            generator,
            settings,
        }
    }

    /// Context budget for `question`, shrunk so the whole prompt fits the
    /// generator's limit.
    pub fn effective_options(&self, question: &str, max_sources: Option<usize>) -> AssembleOptions {
        let mut options = self.settings.context;
        if let Some(n) = max_sources {
            options.max_sources = n;
        }
        let prompt_limit = self.generator.max_prompt_chars();
        if prompt_limit > 0 {
            let room = prompt_limit.saturating_sub(prompt_overhead(question));
            options.char_budget = options.char_budget.min(room);
        }
        options
    }

    #[tracing::instrument(skip(self))]
    pub async fn ask(
        &self,
        question: &str,
        max_sources: Option<usize>,
    ) -> Result<AskResponse, HarnessError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(HarnessError::InvalidRequest("question must not be empty".into()));
        }
        if max_sources == Some(0) {
            return Err(HarnessError::InvalidRequest("max_sources must be > 0".into()));
        }

        let outcome = self
            .retriever
            .search(
                question,
                &SearchOptions {
                    max_results: Some(self.settings.candidates),
                    ..SearchOptions::default()
                },
            )
            .await?;

        let options = self.effective_options(question, max_sources);
        let context = assemble(&outcome.hits, question, options);
        let model = self.generator.model_name().to_string();

        let mut response = AskResponse {
            question: question.to_string(),
            status: AskStatus::NoSources,
            answer: None,
            sources: Vec::new(),
            context: ContextSummary::from(&context),
            degraded: outcome.degraded,
            degraded_reason: outcome.degraded_reason.clone(),
            model,
            error: None,
        };

        if context.is_empty() {
            info!("no sources retrieved; skipping generation");
            return Ok(response);
        }

        let result = match timeout(
            self.settings.generation_timeout,
            answer(self.generator.as_ref(), question, &context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SynthesisError::GenerationUnavailable {
                reason: format!(
                    "generation timed out after {}s",
                    self.settings.generation_timeout.as_secs()
                ),
                sources: sources_for(&context),
            }),
        };

        match result {
            Ok(answered) => {
                response.status = AskStatus::Answered;
                response.answer = Some(answered.text);
                response.sources = answered.sources;
                response.model = answered.model;
            }
            Err(err) => {
                warn!(error = %err, "answer synthesis failed; returning sources only");
                response.status = AskStatus::GenerationUnavailable;
                response.sources = err.sources().to_vec();
                response.error = Some(err.to_string());
            }
        }
        Ok(response)
    }
}

pub fn print_answer(response: &AskResponse) {
    if response.degraded {
        eprintln!(
            "note: lexical-only retrieval ({})",
            response.degraded_reason.as_deref().unwrap_or("vector search unavailable")
        );
    }
    match response.status {
        AskStatus::NoSources => {
            println!("No relevant articles found; nothing to answer from.");
            return;
        }
        AskStatus::GenerationUnavailable => {
            println!(
                "Answer unavailable: {}",
                response.error.as_deref().unwrap_or("generation failed")
            );
            println!("Relevant sources:");
        }
        AskStatus::Answered => {
            println!("{}", response.answer.as_deref().unwrap_or_default());
            println!();
            println!("Sources:");
        }
    }
    for source in &response.sources {
        println!(
            "  {} {}  ({}, score {:.2}{})",
            source.marker,
            source.title,
            source.article_id,
            source.relevance_score,
            if source.truncated { ", truncated" } else { "" }
        );
    }
    if !response.context.omitted.is_empty() {
        println!("  omitted for space: {}", response.context.omitted.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::RetrieverSettings;
    use async_trait::async_trait;
    use journal_harness_core::embedding::EmbeddingProvider;
    use journal_harness_core::search::SearchParams;
    use journal_harness_core::store::memory::InMemoryStore;

    struct Off;

    #[async_trait]
    impl EmbeddingProvider for Off {
        fn model_name(&self) -> &str {
            "disabled"
        }
        fn dims(&self) -> usize {
            0
        }
        fn max_input_chars(&self) -> usize {
            0
        }
        async fn embed(&self, _texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            anyhow::bail!("disabled")
        }
    }

    struct Tiny(usize);

    #[async_trait]
    impl GenerationProvider for Tiny {
        fn model_name(&self) -> &str {
            "tiny"
        }
        fn max_prompt_chars(&self) -> usize {
            self.0
        }
        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok("ok [1]".into())
        }
    }

    fn service(prompt_limit: usize) -> AskService {
        let retriever = Retriever::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(Off),
            RetrieverSettings {
                params: SearchParams::default(),
                default_max_results: 10,
                max_results_cap: 50,
                min_score: 0.0,
                timeout: Duration::from_secs(5),
                embed_timeout: Duration::from_secs(1),
                embed_retry_backoff: Duration::from_millis(1),
            },
        );
        AskService::new(
            retriever,
            Arc::new(Tiny(prompt_limit)),
            AskSettings {
                candidates: 10,
                context: AssembleOptions {
                    char_budget: 24_000,
                    max_sources: 3,
                    per_article_max_chars: 8000,
                },
                generation_timeout: Duration::from_secs(5),
            },
        )
    }

    #[test]
    fn budget_shrinks_to_prompt_limit() {
        let options = service(5_000).effective_options("what is sepsis?", Some(2));
        assert_eq!(options.max_sources, 2);
        assert!(options.char_budget < 5_000);

        let unlimited = service(0).effective_options("what is sepsis?", None);
        assert_eq!(unlimited.char_budget, 24_000);
        assert_eq!(unlimited.max_sources, 3);
    }

    #[tokio::test]
    async fn empty_corpus_reports_no_sources() {
        let response = service(0).ask("what is sepsis?", None).await.unwrap();
        assert_eq!(response.status, AskStatus::NoSources);
        assert!(response.answer.is_none());
        assert!(response.sources.is_empty());
        assert!(response.degraded);
    }

    #[tokio::test]
    async fn rejects_zero_sources() {
        let err = service(0).ask("q", Some(0)).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidRequest(_)));
    }
}
