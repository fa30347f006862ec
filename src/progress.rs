//! Ingestion and embedding progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts. The
//! HTTP server uses [`NoProgress`]; the CLI picks a reporter through
//! [`ProgressMode`].

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// A listing page is about to be fetched.
    Scanning {
        source: String,
        page: usize,
        offset: usize,
    },
    /// `indexed` of `requested` new articles stored so far.
    Indexed {
        source: String,
        indexed: usize,
        requested: usize,
    },
    /// Re-vectorize progress: `done` of `total` articles processed.
    Embedding { done: u64, total: u64 },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly lines: `ingest nejm  indexed 3 / 10`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning {
                source,
                page,
                offset,
            } => format!(
                "ingest {}  scanning page {} at offset {}\n",
                source,
                page,
                format_number(*offset as u64)
            ),
            ProgressEvent::Indexed {
                source,
                indexed,
                requested,
            } => format!("ingest {}  indexed {} / {}\n", source, indexed, requested),
            ProgressEvent::Embedding { done, total } => format!(
                "embed  {} / {} articles\n",
                format_number(*done),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Scanning {
                source,
                page,
                offset,
            } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "source": source,
                "page": page,
                "offset": offset
            }),
            ProgressEvent::Indexed {
                source,
                indexed,
                requested,
            } => serde_json::json!({
                "event": "progress",
                "phase": "indexing",
                "source": source,
                "n": indexed,
                "total": requested
            }),
            ProgressEvent::Embedding { done, total } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "n": done,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_groups_thousands() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
