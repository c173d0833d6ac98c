//! Request records from the Copilot Chat extension log.
//!
//! A record starts with a timestamped request line and may continue on
//! untimestamped lines until the next timestamped line:
//!
//! ```text
//! 2025-03-02 14:05:11.482 [info] ccreq:5a1b2c3d.copilotmd | success | gpt-4o -> gpt-4o-2024-11-20 | 1523ms | [panel/editAgent]
//!     promptTokens: 1200
//!     completionTokens: 312
//!     finishReason: stop
//! ```
//!
//! Timestamped lines that are not requests, and whatever follows them, are
//! skipped.

use std::path::Path;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::discovery::EditorVariant;

const REQUEST_PREFIX: &str = "ccreq:";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Which editor, process and window a log line came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct LogProvenance {
    pub variant: Option<EditorVariant>,
    pub session_dir: Option<String>,
    pub window: Option<String>,
}

impl LogProvenance {
    pub fn from_path(path: &Path) -> Self {
        let mut provenance = Self {
            variant: EditorVariant::from_path(path),
            ..Self::default()
        };
        for component in path.components() {
            let name = component.as_os_str().to_string_lossy();
            if is_session_dir_name(&name) {
                provenance.session_dir = Some(name.to_string());
            } else if is_window_dir_name(&name) {
                provenance.window = Some(name.to_string());
            }
        }
        provenance
    }

    pub fn tag(&self) -> String {
        format!(
            "[{}/{}/{}]",
            self.variant.map_or("?", EditorVariant::label),
            self.session_dir.as_deref().unwrap_or("?"),
            self.window.as_deref().unwrap_or("?"),
        )
    }
}

/// `YYYYMMDDTHHMMSS`
fn is_session_dir_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 15
        && bytes[8] == b'T'
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[9..].iter().all(u8::is_ascii_digit)
}

fn is_window_dir_name(name: &str) -> bool {
    name.strip_prefix("window")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompletionMetadata {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub level: LogLevel,
    pub request_id: String,
    pub model: String,
    pub resolved_model: Option<String>,
    pub response_time_ms: u64,
    pub status: String,
    pub location: Option<String>,
    pub raw: String,
    pub provenance: LogProvenance,
    pub completion: Option<CompletionMetadata>,
}

impl LogEntry {
    pub fn dedup_key(&self) -> (String, NaiveDateTime) {
        (self.request_id.clone(), self.timestamp)
    }

    /// Prefixes the raw line with its provenance tag.
    pub fn tag(&mut self, provenance: &LogProvenance) {
        self.raw = format!("{} {}", provenance.tag(), self.raw);
        self.provenance = provenance.clone();
    }

    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

struct PendingRecord {
    entry: LogEntry,
    completion: CompletionMetadata,
    has_completion: bool,
}

impl PendingRecord {
    fn push_continuation(&mut self, line: &str) {
        let Some((key, value)) = line.trim().split_once(':') else {
            return;
        };
        let value = value.trim();
        match key.trim() {
            "promptTokens" => self.completion.prompt_tokens = value.parse().ok(),
            "completionTokens" => self.completion.completion_tokens = value.parse().ok(),
            "finishReason" => {
                self.completion.finish_reason = (!value.is_empty()).then(|| value.to_string())
            }
            _ => return,
        }
        self.has_completion = true;
    }

    fn finish(mut self) -> LogEntry {
        if self.has_completion {
            self.entry.completion = Some(self.completion);
        }
        self.entry
    }
}

pub fn parse_multi_line_requests(text: &str) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    let mut pending: Option<PendingRecord> = None;

    for line in text.lines() {
        if let Some((timestamp, level, message)) = split_header(line) {
            if let Some(record) = pending.take() {
                entries.push(record.finish());
            }
            pending = parse_request(timestamp, level, message, line).map(|entry| PendingRecord {
                entry,
                completion: CompletionMetadata::default(),
                has_completion: false,
            });
            continue;
        }
        if let Some(record) = pending.as_mut() {
            record.push_continuation(line);
        }
    }

    if let Some(record) = pending.take() {
        entries.push(record.finish());
    }
    entries
}

fn split_header(line: &str) -> Option<(NaiveDateTime, LogLevel, &str)> {
    let (stamp, rest) = line.split_once(" [")?;
    let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    let (level, message) = rest.split_once(']')?;
    Some((timestamp, LogLevel::parse(level)?, message.trim()))
}

fn parse_request(
    timestamp: NaiveDateTime,
    level: LogLevel,
    message: &str,
    line: &str,
) -> Option<LogEntry> {
    let body = message.strip_prefix(REQUEST_PREFIX)?;
    let mut fields = body.split('|').map(str::trim);

    let request_id = fields.next()?.split('.').next()?.to_string();
    if request_id.is_empty() {
        return None;
    }
    let status = fields.next()?.to_string();
    let model_field = fields.next()?;
    let (model, resolved_model) = match model_field.split_once("->") {
        Some((requested, resolved)) => (
            requested.trim().to_string(),
            Some(resolved.trim().to_string()),
        ),
        None => (model_field.to_string(), None),
    };
    let response_time_ms = fields.next()?.strip_suffix("ms")?.trim().parse().ok()?;
    let location = fields
        .next()
        .map(|field| field.trim_matches(['[', ']']).to_string())
        .filter(|field| !field.is_empty());

    Some(LogEntry {
        timestamp,
        level,
        request_id,
        model,
        resolved_model,
        response_time_ms,
        status,
        location,
        raw: line.to_string(),
        provenance: LogProvenance::default(),
        completion: None,
    })
}
