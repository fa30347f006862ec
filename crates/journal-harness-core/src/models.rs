//! Core data models for Journal Harness.
//!
//! [`Article`] is the only persisted entity. Everything else that flows
//! through ingestion and retrieval (search hits, grounding contexts,
//! answers) is request-scoped and lives in the module that produces it.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// A journal article as stored in the [`ArticleStore`](crate::store::ArticleStore).
///
/// `id` is the upstream DOI and is the sole deduplication key: there is
/// exactly one record per `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Article {
    /// Stable external identifier (DOI).
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    /// Full text, already capped at the ingestion content limit.
    pub content: String,
    /// Upstream collection the article was ingested from (the source filter).
    pub source: String,
    pub authors: Option<String>,
    /// Publication time as a Unix timestamp, when the upstream supplied one.
    pub published_at: Option<i64>,
    /// Ingestion time as a Unix timestamp.
    pub ingested_at: i64,
    /// SHA-256 over title, abstract, and content.
    pub content_hash: String,
    /// Embedding vector. Never serialized; callers see `embedding_model` instead.
    #[serde(skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
}

impl Article {
    /// Text fed to the embedding model: title, abstract, and content joined
    /// by blank lines and capped at `max_chars`.
    pub fn embedding_input(&self, max_chars: usize) -> String {
        embedding_input(&self.title, &self.abstract_text, &self.content, max_chars)
    }

    /// Publication date as `YYYY-MM-DD`.
    pub fn published_date(&self) -> Option<String> {
        self.published_at
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.format("%Y-%m-%d").to_string())
    }

    /// Copy of the article without its vector, for display payloads.
    pub fn without_embedding(mut self) -> Self {
        self.embedding = None;
        self
    }
}

/// Inputs for one ingestion run. Not persisted.
#[derive(Debug, Clone)]
pub struct IngestionRequest {
    /// Upstream collection to pull from (e.g. `nejm`, `catalyst`).
    pub source_filter: String,
    /// Number of new articles the caller wants indexed.
    pub requested_count: usize,
    /// Safety bound on upstream pages fetched in this run.
    pub max_pages_to_scan: usize,
}

/// Build the embedding input for an article from its parts.
pub fn embedding_input(title: &str, abstract_text: &str, content: &str, max_chars: usize) -> String {
    let joined = [title, abstract_text, content]
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    truncate_chars(&joined, max_chars).to_string()
}

/// Hash the indexed text of an article.
pub fn content_hash(title: &str, abstract_text: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(abstract_text.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Return the prefix of `text` holding at most `max_chars` characters.
///
/// Counts Unicode scalar values, so the cut always lands on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn embedding_input_skips_empty_parts_and_caps() {
        assert_eq!(embedding_input("T", "", "body", 100), "T\n\nbody");
        assert_eq!(embedding_input("Title", "Abstract", "Body", 8), "Title\n\nA");
    }

    #[test]
    fn content_hash_separates_fields() {
        assert_ne!(content_hash("ab", "c", ""), content_hash("a", "bc", ""));
        assert_eq!(content_hash("a", "b", "c"), content_hash("a", "b", "c"));
    }
}
