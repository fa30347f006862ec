//! MCP tool server.
//!
//! Exposes the harness operations as Model Context Protocol tools so an
//! assistant can search and question the local corpus directly:
//!
//! | Tool | Harness operation |
//! |------|-------------------|
//! | `search_articles` | [`Harness::search`] |
//! | `ask_research_question` | [`Harness::ask`] |
//! | `list_all_articles` | [`Harness::list`] |
//! | `get_database_stats` | [`Harness::stats`] |
//! | `get_article_by_doi` | [`Harness::get`] |
//! | `compare_embeddings` | [`Harness::compare`] |
//!
//! Tool results are pretty-printed JSON text. Service errors come back as
//! tool results with `is_error` set; unknown tools and malformed arguments
//! are protocol errors.
//!
//! Two transports: Streamable HTTP at `/mcp` next to the JSON API
//! (`jh serve mcp`), or stdio (`jh serve mcp --stdio`).

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::HarnessError;
use crate::get::ArticleView;
use crate::harness::Harness;
use crate::retriever::{SearchOptions, SearchResponse};
use crate::server;

const DEFAULT_LIST_LIMIT: usize = 100;

/// Each MCP session gets a clone; clones share the harness.
#[derive(Clone)]
pub struct McpBridge {
    harness: Harness,
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default, alias = "threshold")]
    min_score: Option<f64>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Deserialize)]
struct AskArgs {
    question: String,
    #[serde(default, alias = "limit")]
    max_sources: Option<usize>,
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    source_filter: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct GetArgs {
    doi: String,
}

#[derive(Deserialize)]
struct CompareArgs {
    text1: String,
    text2: String,
}

#[derive(Serialize)]
struct Listing {
    total_articles: usize,
    articles: Vec<ListingEntry>,
}

#[derive(Serialize)]
struct ListingEntry {
    doi: String,
    title: String,
    source: String,
    published: Option<String>,
    embedded: bool,
}

impl From<ArticleView> for ListingEntry {
    fn from(view: ArticleView) -> Self {
        Self {
            doi: view.id,
            title: view.title,
            source: view.source,
            published: view.published,
            embedded: view.embedded,
        }
    }
}

fn schema(value: Value) -> Arc<serde_json::Map<String, Value>> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(serde_json::Map::new()),
    }
}

fn descriptor(name: &'static str, description: &'static str, input_schema: Value) -> Tool {
    Tool {
        name: Cow::Borrowed(name),
        title: None,
        description: Some(Cow::Borrowed(description)),
        input_schema: schema(input_schema),
        output_schema: None,
        annotations: Some(ToolAnnotations::new().read_only(true)),
        execution: None,
        icons: None,
        meta: None,
    }
}

fn parse<T: DeserializeOwned>(tool: &str, arguments: serde_json::Map<String, Value>) -> Result<T, McpError> {
    serde_json::from_value(Value::Object(arguments)).map_err(|e| {
        McpError::new(
            ErrorCode::INVALID_PARAMS,
            format!("{}: invalid arguments: {}", tool, e),
            None,
        )
    })
}

fn render<T: Serialize>(result: Result<T, HarnessError>) -> CallToolResult {
    match result {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => CallToolResult::success(vec![Content::text(text)]),
            Err(e) => CallToolResult::error(vec![Content::text(e.to_string())]),
        },
        Err(e) => CallToolResult::error(vec![Content::text(e.to_string())]),
    }
}

impl McpBridge {
    pub fn new(harness: Harness) -> Self {
        Self { harness }
    }

    /// Descriptors for every tool, in a stable order.
    pub fn tools() -> Vec<Tool> {
        vec![
            descriptor(
                "search_articles",
                "Hybrid keyword and semantic search over the stored journal articles",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Natural language search query" },
                        "limit": { "type": "integer", "description": "Maximum results" },
                        "min_score": { "type": "number", "description": "Drop results below this combined score (0-1)" },
                        "source": { "type": "string", "description": "Only search this source, e.g. nejm" }
                    },
                    "required": ["query"]
                }),
            ),
            descriptor(
                "ask_research_question",
                "Answer a research question from retrieved articles, with cited sources",
                json!({
                    "type": "object",
                    "properties": {
                        "question": { "type": "string", "description": "The research question" },
                        "max_sources": { "type": "integer", "description": "Articles placed in the grounding context" }
                    },
                    "required": ["question"]
                }),
            ),
            descriptor(
                "list_all_articles",
                "List stored articles, most recent first",
                json!({
                    "type": "object",
                    "properties": {
                        "source_filter": { "type": "string", "description": "Only list this source" },
                        "limit": { "type": "integer", "description": "Maximum articles (default: 100)" }
                    }
                }),
            ),
            descriptor(
                "get_database_stats",
                "Corpus and database statistics",
                json!({ "type": "object", "properties": {} }),
            ),
            descriptor(
                "get_article_by_doi",
                "Retrieve one stored article by DOI",
                json!({
                    "type": "object",
                    "properties": {
                        "doi": { "type": "string", "description": "Article DOI" }
                    },
                    "required": ["doi"]
                }),
            ),
            descriptor(
                "compare_embeddings",
                "Cosine similarity of two texts under the configured embedding model",
                json!({
                    "type": "object",
                    "properties": {
                        "text1": { "type": "string", "description": "First text" },
                        "text2": { "type": "string", "description": "Second text" }
                    },
                    "required": ["text1", "text2"]
                }),
            ),
        ]
    }

    /// Run one tool by name.
    pub async fn call(
        &self,
        name: &str,
        arguments: serde_json::Map<String, Value>,
    ) -> Result<CallToolResult, McpError> {
        tracing::debug!(tool = name, "mcp tool call");
        let h = &self.harness;
        let result = match name {
            "search_articles" => {
                let args: SearchArgs = parse(name, arguments)?;
                let options = SearchOptions {
                    max_results: args.limit,
                    min_score: args.min_score,
                    source: args.source,
                };
                render(
                    h.search(&args.query, &options)
                        .await
                        .map(|outcome| SearchResponse::from_outcome(args.query.trim(), outcome)),
                )
            }
            "ask_research_question" => {
                let args: AskArgs = parse(name, arguments)?;
                render(h.ask(&args.question, args.max_sources).await)
            }
            "list_all_articles" => {
                let args: ListArgs = parse(name, arguments)?;
                let limit = args.limit.unwrap_or(DEFAULT_LIST_LIMIT);
                render(h.list(args.source_filter.as_deref(), limit).await.map(|views| {
                    Listing {
                        total_articles: views.len(),
                        articles: views.into_iter().map(ListingEntry::from).collect(),
                    }
                }))
            }
            "get_database_stats" => render(h.stats().await),
            "get_article_by_doi" => {
                let args: GetArgs = parse(name, arguments)?;
                match h.get(&args.doi).await {
                    Ok(Some(view)) => render(Ok::<_, HarnessError>(view)),
                    Ok(None) => CallToolResult::error(vec![Content::text(format!(
                        "No article found with DOI: {}",
                        args.doi
                    ))]),
                    Err(e) => render::<ArticleView>(Err(e)),
                }
            }
            "compare_embeddings" => {
                let args: CompareArgs = parse(name, arguments)?;
                render(h.compare(&args.text1, &args.text2).await)
            }
            other => {
                return Err(McpError::new(
                    ErrorCode::METHOD_NOT_FOUND,
                    format!("no tool registered with name: {}", other),
                    None,
                ))
            }
        };
        Ok(result)
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "journal-harness".to_string(),
                title: Some("Journal Harness".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Search and question a local corpus of medical journal articles. \
                 Use search_articles to find articles, ask_research_question for a \
                 cited answer, and get_article_by_doi to read one article."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(Self::tools())))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        Self::tools().into_iter().find(|t| t.name == name)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call(&request.name, request.arguments.unwrap_or_default())
            .await
    }
}

/// Serve the JSON API plus a Streamable HTTP MCP endpoint at `/mcp` on
/// `[server].bind`.
pub async fn run_http(harness: Harness) -> anyhow::Result<()> {
    let bridge = McpBridge::new(harness.clone());
    let service = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let app = server::router(harness.clone()).nest_service("/mcp", service);
    server::serve(&harness.config().server.bind, app).await
}

/// Serve MCP over stdin/stdout until the client disconnects.
pub async fn run_stdio(harness: Harness) -> anyhow::Result<()> {
    tracing::info!("mcp server on stdio");
    let running = McpBridge::new(harness)
        .serve(rmcp::transport::stdio())
        .await?;
    running.waiting().await?;
    Ok(())
}
