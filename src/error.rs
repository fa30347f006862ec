//! Error taxonomy for the service operations.
//!
//! Internals propagate `anyhow::Error`; the public operations on
//! [`Harness`](crate::harness::Harness) classify failures into
//! [`HarnessError`] so the CLI and HTTP surfaces can map them to exit
//! codes and status codes.

use std::fmt;
use thiserror::Error;

/// Pipeline stage at which a single article failed during ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// The upstream record could not be parsed.
    Schema,
    ContentFetch,
    Embedding,
    Store,
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessingStage::Schema => "schema",
            ProcessingStage::ContentFetch => "content_fetch",
            ProcessingStage::Embedding => "embedding",
            ProcessingStage::Store => "store",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The upstream article source could not be reached after retries.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// One article failed. Ingestion records these and keeps going.
    #[error("article {id} failed at {stage}: {reason}")]
    ArticleProcessingFailed {
        id: String,
        stage: ProcessingStage,
        reason: String,
    },

    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl HarnessError {
    /// Stable machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            HarnessError::UpstreamUnavailable(_) => "upstream_unavailable",
            HarnessError::ArticleProcessingFailed { .. } => "article_processing_failed",
            HarnessError::EmbeddingUnavailable(_) => "embedding_unavailable",
            HarnessError::InvalidRequest(_) => "bad_request",
            HarnessError::Timeout(_) => "timeout",
            HarnessError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_failure_message_names_stage() {
        let err = HarnessError::ArticleProcessingFailed {
            id: "10.1056/x".into(),
            stage: ProcessingStage::ContentFetch,
            reason: "404".into(),
        };
        assert_eq!(err.to_string(), "article 10.1056/x failed at content_fetch: 404");
        assert_eq!(err.code(), "article_processing_failed");
    }

    #[test]
    fn anyhow_converts_to_internal() {
        let err: HarnessError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, HarnessError::Internal(_)));
        assert_eq!(err.to_string(), "disk full");
    }
}
