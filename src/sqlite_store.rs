//! SQLite-backed [`ArticleStore`].
//!
//! Articles live in the `articles` table with their vector as a
//! little-endian f32 BLOB. Lexical search runs on the `articles_fts` FTS5
//! table using `bm25()` with per-column weights; vector search is a
//! brute-force cosine scan over stored vectors. Failed ingestions wait in
//! `ingest_retries` until the article is stored.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use journal_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use journal_harness_core::models::Article;
use journal_harness_core::store::{
    query_terms, ArticleStore, FieldWeights, PendingRetry, ScoredCandidate, SourceCount,
};

const ARTICLE_COLUMNS: &str = "id, title, abstract_text, content, source, authors, published_at, \
     ingested_at, content_hash, embedding, embedding_model";

/// SQLite implementation of [`ArticleStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_article(row: &SqliteRow) -> Article {
    let embedding: Option<Vec<u8>> = row.get("embedding");
    Article {
        id: row.get("id"),
        title: row.get("title"),
        abstract_text: row.get("abstract_text"),
        content: row.get("content"),
        source: row.get("source"),
        authors: row.get("authors"),
        published_at: row.get("published_at"),
        ingested_at: row.get("ingested_at"),
        content_hash: row.get("content_hash"),
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        embedding_model: row.get("embedding_model"),
    }
}

/// Build an FTS5 MATCH expression that ORs every query term.
///
/// Terms are alphanumeric and double-quoted, so user input cannot inject
/// FTS5 operators. Returns `None` when the query has no terms.
pub fn fts_match_expression(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[async_trait]
impl ArticleStore for SqliteStore {
    async fn get_article(&self, id: &str) -> Result<Option<Article>> {
        let row = sqlx::query(&format!("SELECT {} FROM articles WHERE id = ?", ARTICLE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_article))
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM articles WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn upsert_article(&self, article: &Article) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let previous_hash: Option<String> =
            sqlx::query_scalar("SELECT content_hash FROM articles WHERE id = ?")
                .bind(&article.id)
                .fetch_optional(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO articles (id, title, abstract_text, content, source, authors,
                                  published_at, ingested_at, content_hash,
                                  embedding, embedding_model, embedding_dims)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                abstract_text = excluded.abstract_text,
                content = excluded.content,
                source = excluded.source,
                authors = excluded.authors,
                published_at = excluded.published_at,
                content_hash = excluded.content_hash,
                embedding = excluded.embedding,
                embedding_model = excluded.embedding_model,
                embedding_dims = excluded.embedding_dims
            "#,
        )
        .bind(&article.id)
        .bind(&article.title)
        .bind(&article.abstract_text)
        .bind(&article.content)
        .bind(&article.source)
        .bind(&article.authors)
        .bind(article.published_at)
        .bind(article.ingested_at)
        .bind(&article.content_hash)
        .bind(article.embedding.as_deref().map(vec_to_blob))
        .bind(&article.embedding_model)
        .bind(article.embedding.as_ref().map(|v| v.len() as i64))
        .execute(&mut *tx)
        .await?;

        if previous_hash.as_deref() != Some(article.content_hash.as_str()) {
            sqlx::query("DELETE FROM articles_fts WHERE article_id = ?")
                .bind(&article.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO articles_fts (article_id, title, abstract_text, content) VALUES (?, ?, ?, ?)",
            )
            .bind(&article.id)
            .bind(&article.title)
            .bind(&article.abstract_text)
            .bind(&article.content)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM ingest_retries WHERE article_id = ?")
            .bind(&article.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn count_by_source(&self, source: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles WHERE source = ?")
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn source_counts(&self) -> Result<Vec<SourceCount>> {
        let rows = sqlx::query(
            r#"
            SELECT source,
                   COUNT(*) AS articles,
                   COUNT(embedding) AS embedded
            FROM articles
            GROUP BY source
            ORDER BY articles DESC, source ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SourceCount {
                source: row.get("source"),
                articles: row.get("articles"),
                embedded: row.get("embedded"),
            })
            .collect())
    }

    async fn keyword_search(
        &self,
        query: &str,
        weights: FieldWeights,
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredCandidate>> {
        let Some(expression) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };

        // bm25() is lower-is-better; negate so higher is better. The first
        // weight belongs to the UNINDEXED article_id column.
        let sql = format!(
            r#"
            SELECT articles_fts.article_id AS article_id,
                   -bm25(articles_fts, 0.0, {:.4}, {:.4}, {:.4}) AS score
            FROM articles_fts
            JOIN articles ON articles.id = articles_fts.article_id
            WHERE articles_fts MATCH ?
              AND (? IS NULL OR articles.source = ?)
            ORDER BY score DESC, article_id ASC
            LIMIT ?
            "#,
            weights.title, weights.abstract_text, weights.content
        );

        let rows = sqlx::query(&sql)
            .bind(&expression)
            .bind(source)
            .bind(source)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| ScoredCandidate {
                article_id: row.get("article_id"),
                raw_score: row.get("score"),
            })
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredCandidate>> {
        let rows = sqlx::query(
            r#"
            SELECT id, embedding
            FROM articles
            WHERE embedding IS NOT NULL
              AND (? IS NULL OR source = ?)
            "#,
        )
        .bind(source)
        .bind(source)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<ScoredCandidate> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ScoredCandidate {
                    article_id: row.get("id"),
                    raw_score: cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.article_id.cmp(&b.article_id))
        });
        candidates.truncate(limit);

        Ok(candidates)
    }

    async fn pending_embeddings(
        &self,
        model: &str,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Article>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM articles
            WHERE (embedding IS NULL OR embedding_model IS NULL OR embedding_model != ?)
              AND (? IS NULL OR source = ?)
            ORDER BY ingested_at ASC, id ASC
            LIMIT ?
            "#,
            ARTICLE_COLUMNS
        ))
        .bind(model)
        .bind(source)
        .bind(source)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_article).collect())
    }

    async fn update_embedding(&self, id: &str, vector: &[f32], model: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE articles SET embedding = ?, embedding_model = ?, embedding_dims = ? WHERE id = ?",
        )
        .bind(vec_to_blob(vector))
        .bind(model)
        .bind(vector.len() as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("article not found: {}", id);
        }
        Ok(())
    }

    async fn clear_embeddings(&self, source: Option<&str>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE articles
            SET embedding = NULL, embedding_model = NULL, embedding_dims = NULL
            WHERE embedding IS NOT NULL
              AND (? IS NULL OR source = ?)
            "#,
        )
        .bind(source)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_articles(&self, source: Option<&str>, limit: usize) -> Result<Vec<Article>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM articles
            WHERE (? IS NULL OR source = ?)
            ORDER BY published_at IS NULL, published_at DESC, id ASC
            LIMIT ?
            "#,
            ARTICLE_COLUMNS
        ))
        .bind(source)
        .bind(source)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_article).collect())
    }

    async fn record_failure(&self, retry: &PendingRetry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_retries (article_id, source, record, attempts, last_error, failed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(article_id) DO UPDATE SET
                source = excluded.source,
                record = excluded.record,
                attempts = excluded.attempts,
                last_error = excluded.last_error
            "#,
        )
        .bind(&retry.article_id)
        .bind(&retry.source)
        .bind(&retry.record)
        .bind(i64::from(retry.attempts))
        .bind(&retry.last_error)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_retries(
        &self,
        source: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<PendingRetry>> {
        let rows = sqlx::query(
            r#"
            SELECT article_id, source, record, attempts, last_error
            FROM ingest_retries
            WHERE source = ? AND attempts < ?
            ORDER BY failed_at ASC, article_id ASC
            LIMIT ?
            "#,
        )
        .bind(source)
        .bind(i64::from(max_attempts))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PendingRetry {
                article_id: row.get("article_id"),
                source: row.get("source"),
                record: row.get("record"),
                attempts: u32::try_from(row.get::<i64, _>("attempts")).unwrap_or(0),
                last_error: row.get("last_error"),
            })
            .collect())
    }
}
