//! Corpus statistics: article counts, embedding coverage, per-source
//! breakdown, and database size. Used by `jh stats` and `GET /stats`.

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use journal_harness_core::store::{ArticleStore, SourceCount};

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub total_articles: i64,
    pub embedded_articles: i64,
    pub by_source: Vec<SourceCount>,
    pub embedding_model: String,
    pub generation_model: String,
    pub database: DatabaseInfo,
}

pub async fn collect_stats(
    store: &dyn ArticleStore,
    db_path: &Path,
    embedding_model: &str,
    generation_model: &str,
) -> Result<StatsReport> {
    let by_source = store.source_counts().await?;

    // WAL mode keeps recent writes in the -wal file.
    let size_bytes: u64 = [db_path.to_path_buf(), db_path.with_extension("sqlite-wal")]
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();

    Ok(StatsReport {
        total_articles: by_source.iter().map(|s| s.articles).sum(),
        embedded_articles: by_source.iter().map(|s| s.embedded).sum(),
        by_source,
        embedding_model: embedding_model.to_string(),
        generation_model: generation_model.to_string(),
        database: DatabaseInfo {
            path: db_path.display().to_string(),
            size_bytes,
        },
    })
}

pub fn print_stats(report: &StatsReport) {
    println!("Journal Harness database stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", report.database.path);
    println!("  Size:        {}", format_bytes(report.database.size_bytes));
    println!();
    println!("  Articles:    {}", report.total_articles);
    println!(
        "  Embedded:    {} / {} ({}%)",
        report.embedded_articles,
        report.total_articles,
        if report.total_articles > 0 {
            (report.embedded_articles * 100) / report.total_articles
        } else {
            0
        }
    );
    println!("  Embedding:   {}", report.embedding_model);
    println!("  Generation:  {}", report.generation_model);

    if !report.by_source.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<24} {:>8} {:>10}", "SOURCE", "ARTICLES", "EMBEDDED");
        println!("  {}", "-".repeat(44));
        for s in &report.by_source {
            println!("  {:<24} {:>8} {:>10}", s.source, s.articles, s.embedded);
        }
    }
    println!();
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
