mod common;

use std::sync::Arc;
use tempfile::TempDir;

use common::{
    diabetes_corpus, harness, BagOfWords, FailingGenerator, FakeUpstream, RecordingGenerator,
    DIABETES_IDS,
};
use journal_harness::ask::AskStatus;
use journal_harness::error::HarnessError;
use journal_harness_core::generation::GenerationProvider;

const QUESTION: &str = "What is the preferred diabetes treatment?";

async fn ingested(
    tmp: &TempDir,
    generator: Arc<dyn GenerationProvider>,
) -> journal_harness::harness::Harness {
    let upstream = Arc::new(FakeUpstream::new().with_collection("nejm", diabetes_corpus()));
    let h = harness(tmp, upstream, Arc::new(BagOfWords::default()), generator).await;
    h.ingest("nejm", 10, None).await.unwrap();
    h
}

#[tokio::test]
async fn cited_sources_were_all_shown_to_the_model() {
    let tmp = TempDir::new().unwrap();
    let generator = Arc::new(RecordingGenerator::new(
        "Metformin is first-line therapy [Source 1].",
    ));
    let h = ingested(&tmp, generator.clone()).await;

    let response = h.ask(QUESTION, Some(2)).await.unwrap();
    assert_eq!(response.status, AskStatus::Answered);
    assert_eq!(
        response.answer.as_deref(),
        Some("Metformin is first-line therapy [Source 1].")
    );
    assert_eq!(response.model, "recording");
    assert!(!response.sources.is_empty());
    assert!(response.sources.len() <= 2);

    let prompts = generator.prompts();
    assert_eq!(prompts.len(), 1);
    for source in &response.sources {
        assert!(prompts[0].contains(&format!("Article ID: {}", source.article_id)));
        assert!(prompts[0].contains(&format!("[{}]", source.marker)));
        assert!(DIABETES_IDS.contains(&source.article_id.as_str()));
    }
    assert!(prompts[0].contains(QUESTION));
    assert!(response.context.total_characters <= response.context.char_budget);
}

#[tokio::test]
async fn generation_failure_still_returns_sources() {
    let tmp = TempDir::new().unwrap();
    let h = ingested(&tmp, Arc::new(FailingGenerator)).await;

    let response = h.ask(QUESTION, None).await.unwrap();
    assert_eq!(response.status, AskStatus::GenerationUnavailable);
    assert!(response.answer.is_none());
    assert!(!response.sources.is_empty());
    assert!(response
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("500"));
}

#[tokio::test]
async fn empty_corpus_skips_generation() {
    let tmp = TempDir::new().unwrap();
    let generator = Arc::new(RecordingGenerator::new("should not be called"));
    let upstream = Arc::new(FakeUpstream::new());
    let h = harness(&tmp, upstream, Arc::new(BagOfWords::default()), generator.clone()).await;

    let response = h.ask(QUESTION, None).await.unwrap();
    assert_eq!(response.status, AskStatus::NoSources);
    assert!(response.sources.is_empty());
    assert!(generator.prompts().is_empty());
}

#[tokio::test]
async fn blank_question_is_invalid() {
    let tmp = TempDir::new().unwrap();
    let h = ingested(&tmp, Arc::new(RecordingGenerator::new("x"))).await;
    let err = h.ask("  ", None).await.unwrap_err();
    assert!(matches!(err, HarnessError::InvalidRequest(_)));
}
