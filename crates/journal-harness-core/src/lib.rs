//! # Journal Harness Core
//!
//! Runtime-agnostic logic for Journal Harness: the article model, the
//! [`store::ArticleStore`] abstraction, embedding and generation traits,
//! the hybrid search algorithm, grounding-context assembly, and answer
//! synthesis.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem code. The
//! `journal-harness` application crate supplies concrete stores and
//! provider clients and wraps these algorithms with timeouts and retries.

pub mod answer;
pub mod context;
pub mod embedding;
pub mod generation;
pub mod models;
pub mod search;
pub mod store;
