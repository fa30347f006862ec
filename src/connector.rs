//! Upstream article source abstraction.
//!
//! A [`SourceConnector`] pages through one collection of an upstream
//! article API and fetches full text on demand. The ingestion controller
//! only talks to this trait; [`OneSearchConnector`](crate::connector_onesearch::OneSearchConnector)
//! is the production implementation.
//!
//! # Paging contract
//!
//! ```text
//! list_articles(filter, offset, page_size)
//!     → items at positions [offset, offset + page_size) in the upstream's
//!       stable ordering, minus records that failed to parse
//!       (returned separately as `malformed`).
//! ```
//!
//! The caller advances its offset by `items.len() + malformed.len()`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Listing metadata for one article. Serializable so a failed article
/// can be kept for a later retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleStub {
    /// DOI.
    pub id: String,
    pub title: String,
    pub abstract_text: Option<String>,
    pub published_at: Option<i64>,
    pub authors: Option<String>,
    pub journal: Option<String>,
}

/// An upstream record that did not match the expected schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MalformedRecord {
    /// The record's id, when it could be recovered.
    pub id: Option<String>,
    pub reason: String,
}

/// One page of listing results.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub items: Vec<ArticleStub>,
    pub malformed: Vec<MalformedRecord>,
    /// False when the upstream has nothing past this page.
    pub has_more: bool,
}

impl SourcePage {
    /// Upstream positions this page consumed, malformed records included.
    pub fn consumed(&self) -> usize {
        self.items.len() + self.malformed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumed() == 0
    }
}

/// Full text for one article.
#[derive(Debug, Clone, PartialEq)]
pub struct FullArticle {
    pub id: String,
    pub abstract_text: Option<String>,
    pub body: String,
}

#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// List articles of collection `filter` starting at absolute position `offset`.
    async fn list_articles(&self, filter: &str, offset: usize, page_size: usize)
        -> Result<SourcePage>;

    /// Fetch the full text of one article.
    async fn fetch_content(&self, filter: &str, article_id: &str) -> Result<FullArticle>;
}
