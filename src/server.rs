//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/stats` | Corpus statistics |
//! | `POST` | `/ingest` | Ingest new articles: `{source, count, max_pages?}` |
//! | `POST` | `/search` | Hybrid search: `{query, max_results?, min_score?, source?}` |
//! | `POST` | `/ask` | Grounded answer: `{question, max_sources?}` |
//! | `GET`  | `/articles/{id}` | One stored article |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `upstream_unavailable` (502), `timeout` (504), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ask::AskResponse;
use crate::error::HarnessError;
use crate::get::ArticleView;
use crate::harness::Harness;
use crate::ingest::IngestionReport;
use crate::retriever::{SearchOptions, SearchResponse};
use crate::stats::StatsReport;

/// Build the router. Split from [`run_server`] so tests can serve it on
/// an ephemeral port.
pub fn router(harness: Harness) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/ingest", post(handle_ingest))
        .route("/search", post(handle_search))
        .route("/ask", post(handle_ask))
        .route("/articles/{id}", get(handle_get_article))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(harness)
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(harness: Harness) -> anyhow::Result<()> {
    let bind_addr = harness.config().server.bind.clone();
    serve(&bind_addr, router(harness)).await
}

pub(crate) async fn serve(bind_addr: &str, app: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "server listening");
    println!("Journal Harness listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

impl From<HarnessError> for AppError {
    fn from(err: HarnessError) -> Self {
        let (status, code) = match &err {
            HarnessError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            HarnessError::UpstreamUnavailable(_) | HarnessError::EmbeddingUnavailable(_) => {
                (StatusCode::BAD_GATEWAY, "upstream_unavailable")
            }
            HarnessError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            HarnessError::ArticleProcessingFailed { .. } | HarnessError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %format!("{:#}", err), "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /stats ============

async fn handle_stats(State(harness): State<Harness>) -> Result<Json<StatsReport>, AppError> {
    Ok(Json(harness.stats().await?))
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestBody {
    source: String,
    count: usize,
    #[serde(default)]
    max_pages: Option<usize>,
}

async fn handle_ingest(
    State(harness): State<Harness>,
    body: Result<Json<IngestBody>, JsonRejection>,
) -> Result<Json<IngestionReport>, AppError> {
    let Json(body) = body?;
    let report = harness
        .ingest(&body.source, body.count, body.max_pages)
        .await?;
    Ok(Json(report))
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    max_results: Option<usize>,
    #[serde(default)]
    min_score: Option<f64>,
    #[serde(default)]
    source: Option<String>,
}

async fn handle_search(
    State(harness): State<Harness>,
    body: Result<Json<SearchBody>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Json(body) = body?;
    let options = SearchOptions {
        max_results: body.max_results,
        min_score: body.min_score,
        source: body.source,
    };
    let outcome = harness.search(&body.query, &options).await?;
    Ok(Json(SearchResponse::from_outcome(body.query.trim(), outcome)))
}

// ============ POST /ask ============

#[derive(Deserialize)]
struct AskBody {
    question: String,
    #[serde(default)]
    max_sources: Option<usize>,
}

async fn handle_ask(
    State(harness): State<Harness>,
    body: Result<Json<AskBody>, JsonRejection>,
) -> Result<Json<AskResponse>, AppError> {
    let Json(body) = body?;
    Ok(Json(harness.ask(&body.question, body.max_sources).await?))
}

// ============ GET /articles/{id} ============

async fn handle_get_article(
    State(harness): State<Harness>,
    Path(id): Path<String>,
) -> Result<Json<ArticleView>, AppError> {
    harness
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("article not found: {}", id)))
}
