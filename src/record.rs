//! Transcript record model and JSONL I/O.
//!
//! A session file is newline-delimited JSON: one record per line, unknown
//! fields preserved verbatim. Records are kept as dynamic `serde_json::Value`
//! trees and inspected through tolerant accessors so that shape changes in
//! the host agent's format do not break the strategy catalog.
//!
//! Records that the pipeline never touched are written back from their
//! original line text, byte for byte. Only rewritten or synthetic records go
//! through re-serialization.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

/// Derived classification of a record. Stable: a function of the record's
/// structural fields only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    User,
    Assistant,
    System,
    ToolUse,
    ToolResult,
    Summary,
    QueueOperation,
    FileHistorySnapshot,
    ProgressTick,
    TaskNotification,
    Unknown,
}

impl RecordKind {
    /// Records of these kinds are never removed from a transcript, though
    /// their metadata may still be stripped.
    pub fn is_protected(self) -> bool {
        matches!(self, RecordKind::Summary | RecordKind::QueueOperation)
    }

    pub fn label(self) -> &'static str {
        match self {
            RecordKind::User => "user",
            RecordKind::Assistant => "assistant",
            RecordKind::System => "system",
            RecordKind::ToolUse => "tool_use",
            RecordKind::ToolResult => "tool_result",
            RecordKind::Summary => "summary",
            RecordKind::QueueOperation => "queue_operation",
            RecordKind::FileHistorySnapshot => "file_history_snapshot",
            RecordKind::ProgressTick => "progress_tick",
            RecordKind::TaskNotification => "task_notification",
            RecordKind::Unknown => "unknown",
        }
    }
}

/// One line of a session file.
///
/// `line_index` is the index the record had in the original file and is the
/// key every [`crate::strategy::Action`] targets. Synthetic records created
/// by a range collapse inherit the first index of the range they replace.
#[derive(Debug, Clone)]
pub struct Record {
    pub line_index: usize,
    value: Value,
    raw: Option<String>,
    bytes: usize,
    parse_error: bool,
}

impl Record {
    /// Parse one line of a session file. A malformed line is retained
    /// verbatim as an `Unknown` record so a rewrite never loses data it
    /// could not parse.
    pub fn from_line(line_index: usize, line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => Self {
                line_index,
                value,
                raw: Some(line.to_string()),
                bytes: line.len(),
                parse_error: false,
            },
            _ => Self {
                line_index,
                value: Value::Object(Map::new()),
                raw: Some(line.to_string()),
                bytes: line.len(),
                parse_error: true,
            },
        }
    }

    /// Build a rewritten or synthetic record from a JSON value.
    pub fn from_value(line_index: usize, value: Value) -> Self {
        let bytes = serialized_len(&value);
        Self {
            line_index,
            value,
            raw: None,
            bytes,
            parse_error: false,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Serialized byte size of this record (the original line length for
    /// untouched records).
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_parse_error(&self) -> bool {
        self.parse_error
    }

    pub fn kind(&self) -> RecordKind {
        if self.parse_error {
            return RecordKind::Unknown;
        }
        classify(&self.value)
    }

    pub fn uuid(&self) -> Option<&str> {
        self.value.get("uuid").and_then(Value::as_str)
    }

    pub fn parent_uuid(&self) -> Option<&str> {
        self.value.get("parentUuid").and_then(Value::as_str)
    }

    pub fn is_sidechain(&self) -> bool {
        self.value
            .get("isSidechain")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Content blocks of the inner message. A plain string content is
    /// presented as a single text block so strategies see one shape.
    pub fn content_blocks(&self) -> Vec<Value> {
        content_blocks_of(&self.value)
    }

    /// The inner message content when it is a plain string.
    pub fn string_content(&self) -> Option<&str> {
        self.value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
    }

    /// Serialized line for the writer: verbatim for untouched records.
    pub fn to_line(&self) -> String {
        match &self.raw {
            Some(raw) => raw.clone(),
            None => serde_json::to_string(&self.value).unwrap_or_else(|_| "{}".to_string()),
        }
    }
}

fn classify(value: &Value) -> RecordKind {
    let ty = value.get("type").and_then(Value::as_str).unwrap_or("");
    match ty {
        "progress" => RecordKind::ProgressTick,
        "file-history-snapshot" => RecordKind::FileHistorySnapshot,
        "queue-operation" => RecordKind::QueueOperation,
        "summary" => RecordKind::Summary,
        "system" => RecordKind::System,
        "user" => {
            if let Some(content) = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
            {
                if content.contains("<task-notification>") {
                    return RecordKind::TaskNotification;
                }
            }
            let has_tool_result = content_blocks_of(value)
                .iter()
                .any(|b| block_type(b) == "tool_result");
            if has_tool_result {
                RecordKind::ToolResult
            } else {
                RecordKind::User
            }
        }
        "assistant" => {
            let has_tool_use = content_blocks_of(value)
                .iter()
                .any(|b| block_type(b) == "tool_use");
            if has_tool_use {
                RecordKind::ToolUse
            } else {
                RecordKind::Assistant
            }
        }
        _ => RecordKind::Unknown,
    }
}

fn content_blocks_of(value: &Value) -> Vec<Value> {
    let content = match value.get("message").and_then(|m| m.get("content")) {
        Some(c) => c,
        None => return Vec::new(),
    };
    match content {
        Value::String(s) => vec![serde_json::json!({ "type": "text", "text": s })],
        Value::Array(blocks) => blocks.clone(),
        _ => Vec::new(),
    }
}

/// Type tag of a content block.
pub fn block_type(block: &Value) -> &str {
    block.get("type").and_then(Value::as_str).unwrap_or("")
}

/// Readable text payload of a content block, whatever its shape.
pub fn block_text(block: &Value) -> String {
    for key in ["text", "thinking"] {
        if let Some(s) = block.get(key).and_then(Value::as_str) {
            if !s.is_empty() {
                return s.to_string();
            }
        }
    }
    match block.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(subs)) => subs
            .iter()
            .filter_map(|sub| sub.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Serialized byte size of a content block.
pub fn block_bytes(block: &Value) -> usize {
    serialized_len(block)
}

/// Serialized byte size of any JSON value (compact form).
pub fn serialized_len(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

/// Return a copy of the record's value with its content blocks replaced.
pub fn with_content_blocks(value: &Value, blocks: Vec<Value>) -> Value {
    let mut new_value = value.clone();
    if let Some(message) = new_value.get_mut("message").and_then(Value::as_object_mut) {
        message.insert("content".to_string(), Value::Array(blocks));
    }
    new_value
}

/// Canonical compact serialization with recursively sorted object keys.
/// Used wherever two payloads must compare equal regardless of key order.
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<_, _> = map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(value)).unwrap_or_default()
}

/// Stream a session file into records. Blank lines are skipped; malformed
/// lines become `Unknown` records and are counted in the returned warning
/// tally.
pub fn read_records(path: &Path) -> Result<(Vec<Record>, usize)> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut parse_warnings = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = Record::from_line(index, &line);
        if record.is_parse_error() {
            parse_warnings += 1;
        }
        records.push(record);
    }
    Ok((records, parse_warnings))
}

/// Total serialized bytes of a record sequence.
pub fn total_bytes(records: &[Record]) -> usize {
    records.iter().map(Record::bytes).sum()
}

/// Write records to an open file, one per line.
pub fn write_records(file: &mut File, records: &[Record]) -> Result<()> {
    for record in records {
        file.write_all(record.to_line().as_bytes())?;
        file.write_all(b"\n")?;
    }
    Ok(())
}
