use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::discovery::EditorVariant;
use crate::error::ScanError;

/// Key older extension builds used for the turn array.
const LEGACY_TURNS_KEY: &str = "requests";
const TURNS_KEY: &str = "turns";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub id: String,
    #[serde(deserialize_with = "number_as_i64")]
    pub creation_date: i64,
    #[serde(deserialize_with = "number_as_i64")]
    pub last_message_date: i64,
    #[serde(deserialize_with = "number_as_u32")]
    pub version: u32,
    pub turns: Vec<Turn>,
    #[serde(default, deserialize_with = "lenient")]
    pub requester_username: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub responder_username: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub initial_location: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub custom_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "RawTurn", rename_all = "camelCase")]
pub struct Turn {
    pub request_id: String,
    pub response_id: Option<String>,
    pub timestamp: i64,
    pub model_id: Option<String>,
    pub agent: Option<AgentDescriptor>,
    pub message: String,
    pub content_references: Vec<ContentReference>,
    pub tool_call_rounds: Vec<ToolCallRound>,
    pub timings: Option<Timings>,
}

impl Turn {
    pub fn tool_call_count(&self) -> usize {
        self.tool_call_rounds
            .iter()
            .map(|round| round.tool_calls.len())
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentReference {
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRound {
    pub id: String,
    pub response: String,
    pub tool_calls: Vec<ToolCall>,
    #[serde(rename = "toolInputRetry", deserialize_with = "number_as_u32")]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    #[serde(default, deserialize_with = "lenient_millis")]
    pub total_elapsed: Option<u64>,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub first_progress: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTurn {
    request_id: String,
    #[serde(default, deserialize_with = "lenient")]
    response_id: Option<String>,
    #[serde(deserialize_with = "number_as_i64")]
    timestamp: i64,
    #[serde(default, deserialize_with = "lenient")]
    model_id: Option<String>,
    #[serde(default)]
    agent: Option<AgentDescriptor>,
    message: RawMessage,
    #[serde(default, deserialize_with = "lenient")]
    content_references: Option<Vec<Value>>,
    #[serde(default, deserialize_with = "lenient")]
    result: Option<RawResult>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawResult {
    #[serde(default, deserialize_with = "lenient")]
    timings: Option<Timings>,
    #[serde(default, deserialize_with = "lenient")]
    metadata: Option<RawResultMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResultMetadata {
    #[serde(default)]
    tool_call_rounds: Vec<ToolCallRound>,
}

impl From<RawTurn> for Turn {
    fn from(raw: RawTurn) -> Self {
        let result = raw.result.unwrap_or_default();
        Self {
            request_id: raw.request_id,
            response_id: raw.response_id,
            timestamp: raw.timestamp,
            model_id: raw.model_id,
            agent: raw.agent,
            message: raw.message.text,
            content_references: raw
                .content_references
                .unwrap_or_default()
                .iter()
                .filter_map(reference_target)
                .map(|target| ContentReference { target })
                .collect(),
            tool_call_rounds: result
                .metadata
                .map(|metadata| metadata.tool_call_rounds)
                .unwrap_or_default(),
            timings: result.timings,
        }
    }
}

// Fields that validation does not look at must never fail the decode: a
// value of an unexpected shape reads as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_f64()
        .filter(|millis| millis.is_finite() && *millis >= 0.0)
        .map(|millis| millis as u64))
}

// Validation only promises "a number"; extension builds have written these
// as floats.
fn number_as_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|number| number as i64))
        .ok_or_else(|| serde::de::Error::custom("expected a number"))
}

fn number_as_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let value = Value::deserialize(deserializer)?;
    value
        .as_f64()
        .filter(|number| number.is_finite())
        .map(|number| number.clamp(0.0, f64::from(u32::MAX)) as u32)
        .ok_or_else(|| serde::de::Error::custom("expected a number"))
}

/// A reference is either a bare URI or a location wrapping one.
fn reference_target(value: &Value) -> Option<String> {
    const CANDIDATES: [&[&str]; 6] = [
        &["reference", "fsPath"],
        &["reference", "external"],
        &["reference", "uri", "fsPath"],
        &["reference", "uri", "external"],
        &["reference", "path"],
        &["reference", "uri", "path"],
    ];
    CANDIDATES.iter().find_map(|path| str_at(value, path))
}

/// One parsed session file together with what its location tells us.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionScanResult {
    pub session: Session,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
    pub workspace_hash: Option<String>,
    pub variant: EditorVariant,
    pub under_home: bool,
}

/// Session file names are lowercase hex ids with dashes, e.g. a UUID.
pub fn is_session_file_name(name: &str) -> bool {
    let Some(stem) = name.strip_suffix(".json") else {
        return false;
    };
    !stem.is_empty()
        && stem
            .chars()
            .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch) || ch == '-')
}

/// Moves the legacy turn array to `turns`. Returns true when the document changed.
pub fn normalize_legacy_fields(document: &mut Value) -> bool {
    let Some(object) = document.as_object_mut() else {
        return false;
    };
    let Some(legacy) = object.remove(LEGACY_TURNS_KEY) else {
        return false;
    };
    if !object.contains_key(TURNS_KEY) {
        object.insert(TURNS_KEY.to_string(), legacy);
    }
    true
}

pub fn is_valid_session(document: &Value) -> bool {
    validate_session(document).is_ok()
}

/// Structural check run before typed deserialization. Any violation anywhere
/// rejects the whole document.
pub fn validate_session(document: &Value) -> Result<(), String> {
    if !document.is_object() {
        return Err("document is not an object".to_string());
    }
    require(document, "sessionId", Value::is_string, "a string")?;
    require(document, "creationDate", Value::is_number, "a number")?;
    require(document, "lastMessageDate", Value::is_number, "a number")?;
    require(document, "version", Value::is_number, "a number")?;

    let Some(turns) = document.get(TURNS_KEY).and_then(Value::as_array) else {
        return Err("turns is not an array".to_string());
    };
    for (index, turn) in turns.iter().enumerate() {
        validate_turn(turn).map_err(|reason| format!("turns[{index}].{reason}"))?;
    }
    Ok(())
}

fn validate_turn(turn: &Value) -> Result<(), String> {
    require(turn, "requestId", Value::is_string, "a string")?;
    require(turn, "timestamp", Value::is_number, "a number")?;
    let Some(message) = turn.get("message") else {
        return Err("message is missing".to_string());
    };
    require(message, "text", Value::is_string, "a string")
        .map_err(|reason| format!("message.{reason}"))?;

    if let Some(agent) = turn.get("agent")
        && !agent.is_null()
    {
        require(agent, "id", Value::is_string, "a string")
            .map_err(|reason| format!("agent.{reason}"))?;
    }

    let Some(rounds) = value_at(turn, &["result", "metadata", "toolCallRounds"]) else {
        return Ok(());
    };
    let Some(rounds) = rounds.as_array() else {
        return Err("toolCallRounds is not an array".to_string());
    };
    for (index, round) in rounds.iter().enumerate() {
        validate_round(round).map_err(|reason| format!("toolCallRounds[{index}].{reason}"))?;
    }
    Ok(())
}

fn validate_round(round: &Value) -> Result<(), String> {
    require(round, "id", Value::is_string, "a string")?;
    require(round, "response", Value::is_string, "a string")?;
    require(round, "toolInputRetry", Value::is_number, "a number")?;
    let Some(calls) = round.get("toolCalls").and_then(Value::as_array) else {
        return Err("toolCalls is not an array".to_string());
    };
    for (index, call) in calls.iter().enumerate() {
        for key in ["id", "name"] {
            if str_at(call, &[key]).is_none_or(|value| value.is_empty()) {
                return Err(format!("toolCalls[{index}].{key} is not a non-empty string"));
            }
        }
        require(call, "arguments", Value::is_string, "a string")
            .map_err(|reason| format!("toolCalls[{index}].{reason}"))?;
    }
    Ok(())
}

fn require(
    value: &Value,
    key: &str,
    check: fn(&Value) -> bool,
    expected: &str,
) -> Result<(), String> {
    match value.get(key) {
        Some(field) if check(field) => Ok(()),
        Some(_) => Err(format!("{key} is not {expected}")),
        None => Err(format!("{key} is missing")),
    }
}

/// Decodes, migrates, validates and types one session document.
pub fn parse_session_bytes(path: &Path, bytes: &[u8]) -> Result<Session, ScanError> {
    let mut document: Value = serde_json::from_slice(bytes).map_err(|source| ScanError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    normalize_legacy_fields(&mut document);
    validate_session(&document).map_err(|reason| ScanError::InvalidSession {
        path: path.to_path_buf(),
        reason,
    })?;
    serde_json::from_value(document).map_err(|source| ScanError::InvalidSession {
        path: path.to_path_buf(),
        reason: source.to_string(),
    })
}

fn value_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    Some(cursor)
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    value_at(value, path)?.as_str().map(|s| s.to_string())
}
