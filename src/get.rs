//! Article lookup and listing.
//!
//! [`ArticleView`] is the display shape shared by `jh get`, `jh list`, and
//! `GET /articles/{id}`: the stored article without its vector, with dates
//! rendered as ISO 8601.

use anyhow::Result;
use serde::Serialize;

use journal_harness_core::models::Article;
use journal_harness_core::store::ArticleStore;

#[derive(Debug, Clone, Serialize)]
pub struct ArticleView {
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub content: String,
    pub source: String,
    pub authors: Option<String>,
    pub published: Option<String>,
    pub ingested_at: String,
    pub content_hash: String,
    pub embedded: bool,
    pub embedding_model: Option<String>,
}

impl From<Article> for ArticleView {
    fn from(article: Article) -> Self {
        Self {
            published: article.published_date(),
            ingested_at: chrono::DateTime::from_timestamp(article.ingested_at, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| article.ingested_at.to_string()),
            embedded: article.embedding.is_some(),
            id: article.id,
            title: article.title,
            abstract_text: article.abstract_text,
            content: article.content,
            source: article.source,
            authors: article.authors,
            content_hash: article.content_hash,
            embedding_model: article.embedding_model,
        }
    }
}

/// Point lookup. A miss is `Ok(None)`.
pub async fn get_article(store: &dyn ArticleStore, id: &str) -> Result<Option<ArticleView>> {
    Ok(store.get_article(id.trim()).await?.map(ArticleView::from))
}

/// Most recent first.
pub async fn list_articles(
    store: &dyn ArticleStore,
    source: Option<&str>,
    limit: usize,
) -> Result<Vec<ArticleView>> {
    Ok(store
        .list_articles(source, limit)
        .await?
        .into_iter()
        .map(ArticleView::from)
        .collect())
}

pub fn print_article(view: &ArticleView) {
    println!("--- article ---");
    println!("id: {}", view.id);
    println!("title: {}", view.title);
    println!("source: {}", view.source);
    if let Some(authors) = &view.authors {
        println!("authors: {}", authors);
    }
    println!("published: {}", view.published.as_deref().unwrap_or("unknown"));
    println!("ingested: {}", view.ingested_at);
    println!(
        "embedding: {}",
        view.embedding_model.as_deref().filter(|_| view.embedded).unwrap_or("none")
    );
    if !view.abstract_text.is_empty() {
        println!();
        println!("{}", view.abstract_text);
    }
    println!();
    println!("{}", view.content);
}

pub fn print_listing(views: &[ArticleView]) {
    if views.is_empty() {
        println!("No articles.");
        return;
    }
    for view in views {
        println!(
            "{}  {:<28}  {}",
            view.published.as_deref().unwrap_or("----------"),
            view.id,
            view.title
        );
    }
}
