//! OneSearch API connector.
//!
//! Lists articles through `GET /api/v1/simple` (newest first) and fetches
//! full text through `GET /api/v1/content`. The API pages by 1-based page
//! number, so an absolute offset maps to
//! `startPage = offset / page_size + 1` plus an in-page skip of
//! `offset % page_size` items.
//!
//! # Authentication
//!
//! Two headers, `apiuser` and `apikey`, read from `NEJM_API_USER` and
//! `NEJM_API_KEY`. `NEJM_API_KEY` may instead hold both as `user|key`.
//! Without credentials requests are sent unauthenticated.
//!
//! # Record parsing
//!
//! Each listing item is parsed on its own against a strict record type.
//! An item that fails becomes a [`MalformedRecord`] and the rest of the
//! page is kept.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::connector::{ArticleStub, FullArticle, MalformedRecord, SourceConnector, SourcePage};
use crate::embedding::send_json_with_retry;

/// Collections the API is known to serve. Others are passed through as-is.
pub const KNOWN_CONTEXTS: &[&str] = &["nejm", "catalyst", "evidence", "clinician", "nejm-ai"];

/// Keys whose string values hold article text in a content payload.
const TEXT_KEYS: &[&str] = &["title", "abstract", "text", "content", "body"];

/// Strings inside arrays shorter than this are treated as labels, not prose.
const MIN_ARRAY_TEXT_CHARS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub key: String,
}

impl Credentials {
    pub fn from_env() -> Option<Self> {
        Self::from_values(
            std::env::var("NEJM_API_USER").ok(),
            std::env::var("NEJM_API_KEY").ok(),
        )
    }

    fn from_values(user: Option<String>, key: Option<String>) -> Option<Self> {
        let key = key.filter(|k| !k.is_empty())?;
        match user.filter(|u| !u.is_empty()) {
            Some(user) => Some(Self { user, key }),
            None => {
                let (user, key) = key.split_once('|')?;
                Some(Self {
                    user: user.to_string(),
                    key: key.to_string(),
                })
            }
        }
    }
}

pub struct OneSearchConnector {
    base_url: String,
    credentials: Option<Credentials>,
    client: reqwest::Client,
    max_retries: u32,
    retry_backoff: Duration,
}

impl OneSearchConnector {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        Self::with_credentials(config, Credentials::from_env())
    }

    pub fn with_credentials(config: &SourceConfig, credentials: Option<Credentials>) -> Result<Self> {
        if credentials.is_none() {
            tracing::warn!("NEJM_API_USER/NEJM_API_KEY not set; sending unauthenticated requests");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials,
            client,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// GET with the shared retry loop: 429, 5xx, and network errors are
    /// retried, any other non-success status fails at once.
    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        send_json_with_retry(
            || {
                let request = self.client.get(&url).query(query);
                match &self.credentials {
                    Some(creds) => request
                        .header("apiuser", &creds.user)
                        .header("apikey", &creds.key),
                    None => request,
                }
            },
            &url,
            self.max_retries,
            self.retry_backoff,
            "OneSearch",
        )
        .await
    }
}

/// Page number and in-page skip for an absolute offset.
pub fn page_for_offset(offset: usize, page_size: usize) -> (usize, usize) {
    (offset / page_size + 1, offset % page_size)
}

#[async_trait]
impl SourceConnector for OneSearchConnector {
    async fn list_articles(&self, filter: &str, offset: usize, page_size: usize) -> Result<SourcePage> {
        if page_size == 0 {
            bail!("page_size must be > 0");
        }
        let (start_page, skip) = page_for_offset(offset, page_size);

        let json = self
            .get_json(
                "/api/v1/simple",
                &[
                    ("context", filter.to_string()),
                    ("objectType", format!("{}-article", filter)),
                    ("sortBy", "pubdate-descending".to_string()),
                    ("pageLength", page_size.to_string()),
                    ("startPage", start_page.to_string()),
                    ("showFacets", "N".to_string()),
                ],
            )
            .await?;

        let results: &[Value] = match json.get("results") {
            Some(Value::Array(items)) => items.as_slice(),
            Some(Value::Null) | None => &[],
            Some(_) => bail!("OneSearch listing: `results` is not an array"),
        };

        let mut page = parse_listing(results.get(skip..).unwrap_or(&[]));
        page.has_more = results.len() >= page_size;
        Ok(page)
    }

    async fn fetch_content(&self, filter: &str, article_id: &str) -> Result<FullArticle> {
        let json = self
            .get_json(
                "/api/v1/content",
                &[
                    ("context", filter.to_string()),
                    ("doi", article_id.to_string()),
                    ("format", "json".to_string()),
                ],
            )
            .await?;

        let body = extract_body(&json);
        if body.is_empty() {
            return Err(anyhow!("no text in content payload for {}", article_id));
        }
        Ok(FullArticle {
            id: article_id.to_string(),
            abstract_text: json
                .get("displayAbstract")
                .and_then(Value::as_str)
                .map(strip_markup)
                .filter(|a| !a.is_empty()),
            body,
        })
    }
}

// ============ Listing records ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OneSearchRecord {
    doi: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    display_abstract: Option<String>,
    #[serde(default)]
    pubdate: Option<Value>,
    #[serde(default)]
    string_authors: Option<String>,
    #[serde(default, alias = "publication")]
    journal: Option<String>,
}

impl OneSearchRecord {
    fn into_stub(self) -> Result<ArticleStub, String> {
        let id = self.doi.trim().to_string();
        if id.is_empty() {
            return Err("empty `doi`".to_string());
        }
        let title = self
            .text
            .or(self.title)
            .map(|t| strip_markup(&t))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "missing field `text`".to_string())?;

        Ok(ArticleStub {
            id,
            title,
            abstract_text: self
                .display_abstract
                .map(|a| strip_markup(&a))
                .filter(|a| !a.is_empty()),
            published_at: self.pubdate.as_ref().and_then(parse_pubdate),
            authors: self.string_authors.filter(|a| !a.trim().is_empty()),
            journal: self.journal,
        })
    }
}

fn parse_listing(items: &[Value]) -> SourcePage {
    let mut page = SourcePage::default();
    for item in items {
        let parsed = serde_json::from_value::<OneSearchRecord>(item.clone())
            .map_err(|e| e.to_string())
            .and_then(OneSearchRecord::into_stub);
        match parsed {
            Ok(stub) => page.items.push(stub),
            Err(reason) => page.malformed.push(MalformedRecord {
                id: item.get("doi").and_then(Value::as_str).map(str::to_string),
                reason,
            }),
        }
    }
    page
}

/// Parse a `pubdate` that may be RFC 3339, `YYYY-MM-DD`, `YYYYMMDD`, a
/// bare year, or a number in either of the last two forms.
pub fn parse_pubdate(value: &Value) -> Option<i64> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(&raw) {
        return Some(dt.timestamp());
    }
    let date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&raw, "%Y%m%d"))
        .ok()
        .or_else(|| {
            let year: i32 = raw.get(..4)?.parse().ok()?;
            if raw.len() == 4 {
                NaiveDate::from_ymd_opt(year, 1, 1)
            } else {
                None
            }
        })?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&midnight).timestamp())
}

// ============ Content payloads ============

/// Collect article prose from a content payload: from `document` when
/// present, otherwise from the whole payload.
pub fn extract_body(json: &Value) -> String {
    let root = json.get("document").unwrap_or(json);
    let mut parts = Vec::new();
    match root {
        Value::String(s) => parts.push(strip_markup(s)),
        other => collect_text(other, &mut parts),
    }
    parts.retain(|p| !p.is_empty());
    parts.dedup();
    parts.join("\n\n")
}

fn collect_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for key in TEXT_KEYS {
                if let Some(Value::String(s)) = map.get(*key) {
                    out.push(strip_markup(s));
                }
            }
            for child in map.values() {
                if child.is_object() || child.is_array() {
                    collect_text(child, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) if s.chars().count() > MIN_ARRAY_TEXT_CHARS => {
                        out.push(strip_markup(s))
                    }
                    Value::Object(_) | Value::Array(_) => collect_text(item, out),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// Drop `<...>` tags and collapse runs of whitespace.
pub fn strip_markup(text: &str) -> String {
    let mut plain = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                plain.push(' ');
            }
            _ if !in_tag => plain.push(c),
            _ => {}
        }
    }
    plain.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offset_maps_to_page_and_skip() {
        assert_eq!(page_for_offset(0, 100), (1, 0));
        assert_eq!(page_for_offset(5, 100), (1, 5));
        assert_eq!(page_for_offset(100, 100), (2, 0));
        assert_eq!(page_for_offset(250, 100), (3, 50));
    }

    #[test]
    fn listing_isolates_malformed_records() {
        let items = vec![
            json!({ "doi": "10.1056/a", "text": "Insulin <i>pumps</i>", "pubdate": "2024-03-01" }),
            json!({ "text": "No DOI here" }),
            json!({ "doi": "10.1056/c" }),
            json!({ "doi": "10.1056/d", "title": "Fallback title", "stringAuthors": "A. Author" }),
        ];
        let page = parse_listing(&items);

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].title, "Insulin pumps");
        assert_eq!(page.items[1].title, "Fallback title");
        assert_eq!(page.items[1].authors.as_deref(), Some("A. Author"));
        assert_eq!(page.malformed.len(), 2);
        assert_eq!(page.malformed[0].id, None);
        assert_eq!(page.malformed[1].id.as_deref(), Some("10.1056/c"));
    }

    #[test]
    fn pubdate_formats() {
        let day = Some(1_709_251_200); // 2024-03-01T00:00:00Z
        assert_eq!(parse_pubdate(&json!("2024-03-01")), day);
        assert_eq!(parse_pubdate(&json!("20240301")), day);
        assert_eq!(parse_pubdate(&json!(20240301)), day);
        assert_eq!(parse_pubdate(&json!("2024-03-01T00:00:00Z")), day);
        assert_eq!(parse_pubdate(&json!("2024")), Some(1_704_067_200));
        assert_eq!(parse_pubdate(&json!("March 2024")), None);
        assert_eq!(parse_pubdate(&json!(null)), None);
    }

    #[test]
    fn body_prefers_document_subtree() {
        let payload = json!({
            "title": "Outer title",
            "document": {
                "sections": [
                    { "title": "Methods", "text": "We enrolled <b>120</b> adults." },
                    "short label",
                    "A long free-standing paragraph inside an array."
                ]
            }
        });
        let body = extract_body(&payload);
        assert!(!body.contains("Outer title"));
        assert!(body.contains("Methods"));
        assert!(body.contains("We enrolled 120 adults."));
        assert!(body.contains("A long free-standing paragraph"));
        assert!(!body.contains("short label"));
    }

    #[test]
    fn body_accepts_plain_string_document() {
        assert_eq!(extract_body(&json!({ "document": "<p>Full text</p>" })), "Full text");
        assert_eq!(extract_body(&json!({})), "");
    }

    #[test]
    fn credentials_from_combined_key() {
        let creds = Credentials::from_values(None, Some("me|secret".into())).unwrap();
        assert_eq!(creds.user, "me");
        assert_eq!(creds.key, "secret");
        assert_eq!(Credentials::from_values(None, Some("nopipe".into())), None);
        let split = Credentials::from_values(Some("u".into()), Some("k".into())).unwrap();
        assert_eq!(split, Credentials { user: "u".into(), key: "k".into() });
    }
}
