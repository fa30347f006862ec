//! # Journal Harness
//!
//! Ingests medical-journal articles from an upstream search API into a
//! local SQLite store, retrieves them with hybrid keyword + vector search,
//! and answers questions grounded only in the retrieved articles.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │  OneSearch  │──▶│  Ingestion   │──▶│  SQLite   │
//! │  connector  │   │ fetch+embed  │   │ FTS5+vec  │
//! └─────────────┘   └──────────────┘   └─────┬─────┘
//!                                            │
//!                     ┌──────────────────────┤
//!                     ▼                      ▼
//!               ┌───────────┐         ┌────────────┐
//!               │ Retriever │────────▶│ Ask: ctx + │
//!               │  hybrid   │         │ generation │
//!               └───────────┘         └────────────┘
//! ```
//!
//! Pure logic (models, store trait, hybrid ranking, context assembly,
//! prompt and citation handling) lives in `journal-harness-core`. This
//! crate adds the I/O: SQLite, HTTP clients, the CLI, and the server.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | `ArticleStore` over SQLite + FTS5 |
//! | [`connector`] | Source connector trait and page types |
//! | [`connector_onesearch`] | OneSearch API connector |
//! | [`embedding`] | Embedding clients and the query cache |
//! | [`generation`] | Text generation clients |
//! | [`ingest`] | Ingestion controller |
//! | [`retriever`] | Hybrid retrieval with lexical fallback |
//! | [`ask`] | Grounded question answering |
//! | [`embed_cmd`] | Re-vectorize stored articles |
//! | [`get`] | Article lookup and listing |
//! | [`stats`] | Corpus statistics |
//! | [`progress`] | Progress reporting for long runs |
//! | [`error`] | Service error taxonomy |
//! | [`harness`] | Composition root |
//! | [`server`] | JSON HTTP server |
//! | [`mcp`] | MCP tool server |

pub mod ask;
pub mod config;
pub mod connector;
pub mod connector_onesearch;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod get;
pub mod harness;
pub mod ingest;
pub mod mcp;
pub mod migrate;
pub mod progress;
pub mod retriever;
pub mod server;
pub mod sqlite_store;
pub mod stats;
