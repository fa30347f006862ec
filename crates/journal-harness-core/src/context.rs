//! Grounding-context assembly.
//!
//! Turns ranked [`SearchHit`]s into the block of source text handed to the
//! generation model. Each selected article contributes its full stored
//! content under a stable `[Source k]` marker. The rendered text never
//! exceeds the character budget: when the next article does not fit, it
//! is cut at a word boundary and flagged, and everything ranked below it
//! is omitted.

use serde::Serialize;

use crate::models::truncate_chars;
use crate::search::SearchHit;

/// Appended to any article text that was cut short.
pub const TRUNCATION_MARK: &str = " [truncated]";

/// Separator between rendered article blocks.
const BLOCK_SEPARATOR: &str = "\n\n";

/// A truncated block must keep at least this many characters of content,
/// otherwise the article is omitted instead.
const MIN_CONTENT_CHARS: usize = 200;

/// Selection limits for one assembly.
#[derive(Debug, Clone, Copy)]
pub struct AssembleOptions {
    /// Hard ceiling on rendered characters.
    pub char_budget: usize,
    /// Most articles to include.
    pub max_sources: usize,
    /// Longest content taken from a single article.
    pub per_article_max_chars: usize,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            char_budget: 24_000,
            max_sources: 3,
            per_article_max_chars: 8_000,
        }
    }
}

/// One article included in a [`GroundingContext`].
#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry {
    /// Citation marker without brackets, e.g. `Source 2`.
    pub marker: String,
    pub article_id: String,
    pub title: String,
    /// Article text exactly as it appears in the rendered context.
    pub included_text: String,
    pub relevance_score: f64,
    /// Character count of the article text before any truncation.
    pub original_chars: usize,
    pub truncated: bool,
}

/// The assembled grounding context for one question.
#[derive(Debug, Clone, Serialize)]
pub struct GroundingContext {
    pub question: String,
    pub entries: Vec<ContextEntry>,
    /// Rendered context, passed verbatim to the generation prompt.
    pub text: String,
    /// Characters in `text`. Never exceeds `char_budget`.
    pub total_characters: usize,
    pub char_budget: usize,
    /// Ids of selected hits dropped because the budget ran out.
    pub omitted: Vec<String>,
}

impl GroundingContext {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any included article was cut short.
    pub fn truncated(&self) -> bool {
        self.entries.iter().any(|e| e.truncated)
    }

    /// Citation marker to article id, in citation order.
    pub fn provenance(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|e| (e.marker.as_str(), e.article_id.as_str()))
    }

    /// Resolve a marker such as `Source 2` (brackets optional) to its article id.
    pub fn resolve(&self, marker: &str) -> Option<&str> {
        let marker = marker.trim().trim_start_matches('[').trim_end_matches(']');
        self.provenance()
            .find(|(m, _)| *m == marker)
            .map(|(_, id)| id)
    }
}

/// Assemble a grounding context from ranked hits.
pub fn assemble(hits: &[SearchHit], question: &str, options: AssembleOptions) -> GroundingContext {
    let mut text = String::new();
    let mut used = 0usize;
    let mut entries: Vec<ContextEntry> = Vec::new();
    let mut omitted: Vec<String> = Vec::new();
    let mut budget_exhausted = false;

    for hit in hits.iter().take(options.max_sources) {
        if budget_exhausted {
            omitted.push(hit.article_id.clone());
            continue;
        }

        let marker = format!("Source {}", entries.len() + 1);
        let separator = if entries.is_empty() { "" } else { BLOCK_SEPARATOR };
        let header = render_header(&marker, hit);
        let body = article_text(hit);
        let original_chars = body.chars().count();

        let (capped, mut truncated) = if original_chars > options.per_article_max_chars {
            (
                cut_at_word_boundary(body, options.per_article_max_chars.saturating_sub(TRUNCATION_MARK.len())),
                true,
            )
        } else {
            (body.to_string(), false)
        };

        let fixed = separator.chars().count() + header.chars().count();
        let remaining = options.char_budget.saturating_sub(used);
        let full_len = fixed + capped.chars().count() + if truncated { TRUNCATION_MARK.len() } else { 0 };

        let included = if full_len <= remaining {
            capped
        } else {
            budget_exhausted = true;
            let room = remaining.saturating_sub(fixed + TRUNCATION_MARK.len());
            if room < MIN_CONTENT_CHARS {
                omitted.push(hit.article_id.clone());
                continue;
            }
            truncated = true;
            cut_at_word_boundary(&capped, room)
        };

        let included_text = if truncated {
            format!("{}{}", included, TRUNCATION_MARK)
        } else {
            included
        };

        text.push_str(separator);
        text.push_str(&header);
        text.push_str(&included_text);
        used = text.chars().count();

        entries.push(ContextEntry {
            marker,
            article_id: hit.article_id.clone(),
            title: hit.source_article.title.clone(),
            included_text,
            relevance_score: hit.combined_score,
            original_chars,
            truncated,
        });
    }

    GroundingContext {
        question: question.to_string(),
        entries,
        total_characters: used,
        text,
        char_budget: options.char_budget,
        omitted,
    }
}

fn render_header(marker: &str, hit: &SearchHit) -> String {
    let article = &hit.source_article;
    let mut header = format!(
        "[{}] {}\nRelevance: {:.2}\n",
        marker, article.title, hit.combined_score
    );
    if let Some(date) = article.published_date() {
        header.push_str(&format!("Published: {}\n", date));
    }
    header.push_str(&format!("Article ID: {}\n", article.id));
    header
}

fn article_text(hit: &SearchHit) -> &str {
    let article = &hit.source_article;
    if article.content.trim().is_empty() {
        article.abstract_text.trim()
    } else {
        article.content.trim()
    }
}

/// Cut `text` to at most `max_chars` characters, preferring the last
/// whitespace in the second half of the allowed prefix.
fn cut_at_word_boundary(text: &str, max_chars: usize) -> String {
    let prefix = truncate_chars(text, max_chars);
    if prefix.len() == text.len() {
        return prefix.to_string();
    }
    let half = prefix.len() / 2;
    match prefix.rfind(char::is_whitespace) {
        Some(idx) if idx >= half => prefix[..idx].trim_end().to_string(),
        _ => prefix.to_string(),
    }
}
