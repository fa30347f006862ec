//! Grounded answer synthesis.
//!
//! Builds a single prompt from a fixed instruction preamble, the assembled
//! [`GroundingContext`], and the question, then calls the generation
//! provider once. Cited sources always come from the context's provenance
//! map, never from parsing the model's prose, so every source returned was
//! actually shown to the model.

use serde::Serialize;
use thiserror::Error;

use crate::context::GroundingContext;
use crate::generation::GenerationProvider;

/// Role and instruction preamble placed before the sources.
pub const PREAMBLE: &str = "You are a medical research assistant. Answer the question using only \
the numbered sources provided below.

Instructions:
1. Base every statement on the sources and cite them inline as [Source N].
2. If the sources do not contain enough information to answer, say so plainly.
3. Note relevant limitations of the evidence, such as study design or population.
4. Do not make claims that go beyond what the sources state.";

/// A source cited by an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub marker: String,
    pub article_id: String,
    pub title: String,
    pub relevance_score: f64,
    /// The article text shown to the model was cut short.
    pub truncated: bool,
}

/// A synthesized answer with its sources.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<SourceRef>,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The generation call failed, timed out, or returned nothing. Carries
    /// the sources that would have grounded the answer.
    #[error("generation unavailable: {reason}")]
    GenerationUnavailable {
        reason: String,
        sources: Vec<SourceRef>,
    },
}

impl SynthesisError {
    pub fn sources(&self) -> &[SourceRef] {
        match self {
            SynthesisError::GenerationUnavailable { sources, .. } => sources,
        }
    }
}

/// Sources for a context, in citation order.
pub fn sources_for(context: &GroundingContext) -> Vec<SourceRef> {
    context
        .entries
        .iter()
        .map(|e| SourceRef {
            marker: e.marker.clone(),
            article_id: e.article_id.clone(),
            title: e.title.clone(),
            relevance_score: e.relevance_score,
            truncated: e.truncated,
        })
        .collect()
}

/// Build the generation prompt.
pub fn build_prompt(question: &str, context: &GroundingContext) -> String {
    format!(
        "{}\n\nSources:\n\n{}\n\nQuestion: {}\n\nAnswer:",
        PREAMBLE,
        context.text,
        question.trim()
    )
}

/// Characters the prompt uses besides the context text.
///
/// Callers subtract this from the provider's prompt limit to size the
/// context budget.
pub fn prompt_overhead(question: &str) -> usize {
    PREAMBLE.chars().count()
        + "\n\nSources:\n\n\n\nQuestion: \n\nAnswer:".len()
        + question.trim().chars().count()
}

/// Answer `question` from `context` with one generation call.
pub async fn answer<G: GenerationProvider + ?Sized>(
    generator: &G,
    question: &str,
    context: &GroundingContext,
) -> Result<Answer, SynthesisError> {
    let sources = sources_for(context);
    let prompt = build_prompt(question, context);

    match generator.generate(&prompt).await {
        Ok(text) if !text.trim().is_empty() => Ok(Answer {
            text: text.trim().to_string(),
            sources,
            model: generator.model_name().to_string(),
        }),
        Ok(_) => Err(SynthesisError::GenerationUnavailable {
            reason: "generation returned empty text".to_string(),
            sources,
        }),
        Err(e) => Err(SynthesisError::GenerationUnavailable {
            reason: format!("{:#}", e),
            sources,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{assemble, AssembleOptions};
    use crate::models::{content_hash, Article};
    use crate::search::SearchHit;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use futures::executor::block_on;
    use std::sync::Mutex;

    struct Recording {
        reply: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationProvider for Recording {
        fn model_name(&self) -> &str {
            "recording"
        }
        fn max_prompt_chars(&self) -> usize {
            100_000
        }
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            match &self.reply {
                Some(r) => Ok(r.clone()),
                None => bail!("connection refused"),
            }
        }
    }

    fn context() -> GroundingContext {
        let hits: Vec<SearchHit> = ["10.1/a", "10.1/b"]
            .iter()
            .map(|id| SearchHit {
                article_id: id.to_string(),
                vector_score: 0.5,
                lexical_score: 0.5,
                combined_score: 0.5,
                source_article: Article {
                    id: id.to_string(),
                    title: format!("Title {}", id),
                    abstract_text: String::new(),
                    content: format!("Content of {}", id),
                    source: "nejm".to_string(),
                    authors: None,
                    published_at: None,
                    ingested_at: 0,
                    content_hash: content_hash("", "", ""),
                    embedding: None,
                    embedding_model: None,
                },
            })
            .collect();
        assemble(&hits, "What works?", AssembleOptions::default())
    }

    #[test]
    fn prompt_contains_preamble_context_and_question() {
        let ctx = context();
        let prompt = build_prompt("What works?", &ctx);
        assert!(prompt.starts_with(PREAMBLE));
        assert!(prompt.contains(&ctx.text));
        assert!(prompt.trim_end().ends_with("Question: What works?\n\nAnswer:"));
        assert_eq!(
            prompt.chars().count(),
            prompt_overhead("What works?") + ctx.text.chars().count()
        );
    }

    #[test]
    fn sources_come_from_provenance() {
        let ctx = context();
        let generator = Recording {
            reply: Some("Only [Source 1] matters.".to_string()),
            prompts: Mutex::new(Vec::new()),
        };
        let answer = block_on(answer(&generator, "What works?", &ctx)).unwrap();
        let ids: Vec<&str> = answer.sources.iter().map(|s| s.article_id.as_str()).collect();
        assert_eq!(ids, vec!["10.1/a", "10.1/b"]);
        assert_eq!(answer.model, "recording");

        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        for id in ids {
            assert!(prompts[0].contains(id));
        }
    }

    #[test]
    fn failure_carries_sources() {
        let ctx = context();
        let generator = Recording {
            reply: None,
            prompts: Mutex::new(Vec::new()),
        };
        let err = block_on(answer(&generator, "What works?", &ctx)).unwrap_err();
        assert_eq!(err.sources().len(), 2);
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn empty_reply_is_unavailable() {
        let ctx = context();
        let generator = Recording {
            reply: Some("  ".to_string()),
            prompts: Mutex::new(Vec::new()),
        };
        let err = block_on(answer(&generator, "What works?", &ctx)).unwrap_err();
        assert!(matches!(err, SynthesisError::GenerationUnavailable { .. }));
    }
}
