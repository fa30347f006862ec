//! # Journal Harness CLI (`jh`)
//!
//! ## Usage
//!
//! ```bash
//! jh --config ./config/jh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `jh init` | Create the SQLite database and run schema migrations |
//! | `jh ingest <source> --count N` | Fetch, embed, and store N new articles |
//! | `jh search "<query>"` | Hybrid search over stored articles |
//! | `jh ask "<question>"` | Answer a question from retrieved articles |
//! | `jh get <id>` | Print one stored article |
//! | `jh list` | List stored articles, most recent first |
//! | `jh stats` | Corpus and database statistics |
//! | `jh embed pending` | Embed articles with missing or stale vectors |
//! | `jh embed rebuild` | Clear and regenerate vectors |
//! | `jh serve` | Start the JSON HTTP server |
//! | `jh serve mcp` | JSON HTTP server plus an MCP endpoint at `/mcp` |
//! | `jh serve mcp --stdio` | MCP tool server on stdin/stdout |
//!
//! ## Examples
//!
//! ```bash
//! jh init
//! jh ingest nejm --count 25
//! jh search "diabetes treatment" --limit 5
//! jh ask "What is the first-line therapy for type 2 diabetes?" --json
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use journal_harness::ask::print_answer;
use journal_harness::config::{self, Config};
use journal_harness::embed_cmd::print_report as print_embed_report;
use journal_harness::get::{print_article, print_listing};
use journal_harness::harness::Harness;
use journal_harness::ingest::print_report as print_ingest_report;
use journal_harness::progress::ProgressMode;
use journal_harness::retriever::{print_results, SearchOptions, SearchResponse};
use journal_harness::stats::print_stats;
use journal_harness::{db, mcp, migrate, server};

/// Journal Harness: ingest journal articles, search them, and answer
/// questions grounded in what was retrieved.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/jh.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "jh", version, about = "Journal article ingestion, hybrid search, and grounded answers")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/jh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest new articles for a source filter.
    ///
    /// Resumes from the number of articles already stored for the filter,
    /// skips anything already present, and stops once `--count` articles
    /// have been indexed or the upstream runs dry.
    Ingest {
        /// Source filter (a OneSearch context such as `nejm` or `catalyst`).
        source: String,

        /// Number of new articles to index.
        #[arg(long)]
        count: usize,

        /// Upper bound on upstream pages fetched in this run.
        #[arg(long)]
        max_pages: Option<usize>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search stored articles (keyword + vector).
    Search {
        query: String,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Drop results whose combined score is below this value.
        #[arg(long)]
        min_score: Option<f64>,

        /// Only search articles from this source.
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Answer a question using retrieved articles as the only evidence.
    Ask {
        question: String,

        /// Number of articles placed in the grounding context.
        #[arg(long)]
        max_sources: Option<usize>,

        #[arg(long)]
        json: bool,
    },

    /// Print a stored article by id (DOI).
    Get {
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// List stored articles, most recent first.
    List {
        #[arg(long)]
        source: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show corpus and database statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Start the JSON HTTP server on `[server].bind`.
    Serve {
        #[command(subcommand)]
        mode: Option<ServeMode>,
    },
}

#[derive(Subcommand)]
enum ServeMode {
    /// Expose search, ask, and lookup as MCP tools.
    Mcp {
        /// Speak MCP over stdin/stdout instead of HTTP.
        #[arg(long)]
        stdio: bool,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed articles that are missing a vector or were embedded with a
    /// different model.
    Pending {
        #[arg(long)]
        source: Option<String>,

        /// Maximum number of articles to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear vectors and re-embed every article (or one source).
    Rebuild {
        #[arg(long)]
        source: Option<String>,

        #[arg(long)]
        batch_size: Option<usize>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("journal_harness=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open(cfg: Config, progress: ProgressMode) -> anyhow::Result<Harness> {
    Ok(Harness::open(cfg)
        .await?
        .with_progress(Arc::from(progress.reporter())))
}

/// Progress goes to stderr; suppressed when stdout carries JSON.
fn progress_mode(json: bool) -> ProgressMode {
    if json {
        ProgressMode::Off
    } else {
        ProgressMode::default_for_tty()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
            pool.close().await;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Ingest {
            source,
            count,
            max_pages,
            json,
        } => {
            let harness = open(cfg, progress_mode(json)).await?;
            let report = harness.ingest(&source, count, max_pages).await?;
            if json {
                print_json(&report)?;
            } else {
                print_ingest_report(&report);
            }
        }
        Commands::Search {
            query,
            limit,
            min_score,
            source,
            json,
        } => {
            let harness = open(cfg, ProgressMode::Off).await?;
            let options = SearchOptions {
                max_results: limit,
                min_score,
                source,
            };
            let outcome = harness.search(&query, &options).await?;
            let response = SearchResponse::from_outcome(query.trim(), outcome);
            if json {
                print_json(&response)?;
            } else {
                print_results(&response);
            }
        }
        Commands::Ask {
            question,
            max_sources,
            json,
        } => {
            let harness = open(cfg, ProgressMode::Off).await?;
            let response = harness.ask(&question, max_sources).await?;
            if json {
                print_json(&response)?;
            } else {
                print_answer(&response);
            }
        }
        Commands::Get { id, json } => {
            let harness = open(cfg, ProgressMode::Off).await?;
            let Some(view) = harness.get(&id).await? else {
                anyhow::bail!("article not found: {}", id);
            };
            if json {
                print_json(&view)?;
            } else {
                print_article(&view);
            }
        }
        Commands::List { source, limit } => {
            let harness = open(cfg, ProgressMode::Off).await?;
            let views = harness.list(source.as_deref(), limit).await?;
            print_listing(&views);
        }
        Commands::Stats { json } => {
            let harness = open(cfg, ProgressMode::Off).await?;
            let report = harness.stats().await?;
            if json {
                print_json(&report)?;
            } else {
                print_stats(&report);
            }
        }
        Commands::Embed { action } => {
            let harness = open(cfg, progress_mode(false)).await?;
            let mut options = harness.embed_options();
            match action {
                EmbedAction::Pending {
                    source,
                    limit,
                    batch_size,
                    dry_run,
                } => {
                    options.source = source;
                    options.limit = limit;
                    options.dry_run = dry_run;
                    if let Some(b) = batch_size {
                        options.batch_size = b;
                    }
                    let report = harness.embed_pending(&options).await?;
                    print_embed_report("embed pending", &report);
                }
                EmbedAction::Rebuild { source, batch_size } => {
                    options.source = source;
                    if let Some(b) = batch_size {
                        options.batch_size = b;
                    }
                    let report = harness.embed_rebuild(&options).await?;
                    print_embed_report("embed rebuild", &report);
                }
            }
        }
        Commands::Serve { mode } => {
            let harness = open(cfg, ProgressMode::Off).await?;
            match mode {
                None => server::run_server(harness).await?,
                Some(ServeMode::Mcp { stdio: false }) => mcp::run_http(harness).await?,
                Some(ServeMode::Mcp { stdio: true }) => mcp::run_stdio(harness).await?,
            }
        }
    }

    Ok(())
}
