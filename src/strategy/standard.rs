//! Standard-tier strategies: recommended pruning with cross-record
//! correlation.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::record::{block_type, serialized_len, with_content_blocks, Record, RecordKind};

use super::{head_tail_trim, Action, StrategyConfig, StrategyResult, ThinkingMode, TRIM_ANNOTATION_KEY};

const THINKING_KEEP_CHARS: usize = 200;

/// Remove, truncate, or de-sign thinking blocks in assistant records.
pub(super) fn thinking_blocks(records: &[Record], config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("thinking-blocks");
    let mode = config.thinking_mode;

    for record in records {
        if !matches!(record.kind(), RecordKind::Assistant | RecordKind::ToolUse) {
            continue;
        }
        let blocks = record.content_blocks();
        if blocks.is_empty() {
            continue;
        }

        let mut new_blocks = Vec::with_capacity(blocks.len());
        let mut changed = false;
        for block in &blocks {
            if block_type(block) == "thinking" {
                match mode {
                    ThinkingMode::Remove => {
                        changed = true;
                        continue;
                    }
                    ThinkingMode::Truncate => {
                        let mut new_block = strip_signature(block, &mut changed);
                        let thinking = block.get("thinking").and_then(Value::as_str).unwrap_or("");
                        if thinking.chars().count() > THINKING_KEEP_CHARS {
                            let kept: String = thinking.chars().take(THINKING_KEEP_CHARS).collect();
                            if let Some(map) = new_block.as_object_mut() {
                                map.insert(
                                    "thinking".to_string(),
                                    Value::from(format!("{kept}...[truncated]")),
                                );
                            }
                            changed = true;
                        }
                        new_blocks.push(new_block);
                    }
                    ThinkingMode::SignatureOnly => {
                        new_blocks.push(strip_signature(block, &mut changed));
                    }
                }
            } else {
                new_blocks.push(strip_signature(block, &mut changed));
            }
        }

        if !changed {
            continue;
        }
        let value = with_content_blocks(record.value(), new_blocks);
        let new_bytes = serialized_len(&value);
        if new_bytes >= record.bytes() {
            continue;
        }
        result.estimated_bytes_saved += record.bytes() - new_bytes;
        result.modified += 1;
        result.actions.push(Action::Replace {
            index: record.line_index,
            value,
            reason: format!("thinking-blocks ({})", mode.label()),
        });
    }

    result.summary = format!(
        "Processed thinking in {} records (mode={})",
        result.modified,
        mode.label()
    );
    result
}

fn strip_signature(block: &Value, changed: &mut bool) -> Value {
    let mut new_block = block.clone();
    if let Some(map) = new_block.as_object_mut() {
        if map.remove("signature").is_some() {
            *changed = true;
        }
    }
    new_block
}

/// Trim oversized tool results to a head/tail window, annotating each
/// trimmed block with its original byte count. Blocks already carrying the
/// annotation are never touched again.
pub(super) fn tool_output_trim(records: &[Record], config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("tool-output-trim");

    for record in records {
        let kind = record.kind();
        if kind == RecordKind::Unknown || kind.is_protected() {
            continue;
        }
        let blocks = record.content_blocks();
        if blocks.is_empty() {
            continue;
        }

        let mut new_blocks = Vec::with_capacity(blocks.len());
        let mut changed = false;
        for block in &blocks {
            if block_type(block) != "tool_result" || block.get(TRIM_ANNOTATION_KEY).is_some() {
                new_blocks.push(block.clone());
                continue;
            }
            match block.get("content") {
                Some(Value::String(content)) => {
                    let content_lines = content.split('\n').count();
                    if content.len() > config.tool_output_max_bytes
                        || content_lines > config.tool_output_max_lines
                    {
                        let trimmed = head_tail_trim(
                            content,
                            config.tool_output_head_lines,
                            config.tool_output_tail_lines,
                            config.tool_output_max_bytes,
                        );
                        new_blocks.push(annotate(block, "content", Value::from(trimmed), content.len()));
                        changed = true;
                        continue;
                    }
                }
                Some(Value::Array(subs)) => {
                    let total = serialized_len(block.get("content").expect("checked above"));
                    if total > config.tool_output_max_bytes {
                        let trimmed_subs: Vec<Value> = subs
                            .iter()
                            .map(|sub| {
                                let text = sub.get("text").and_then(Value::as_str).unwrap_or("");
                                if text.len() > config.tool_output_max_bytes {
                                    let mut new_sub = sub.clone();
                                    if let Some(map) = new_sub.as_object_mut() {
                                        map.insert(
                                            "text".to_string(),
                                            Value::from(head_tail_trim(
                                                text,
                                                config.tool_output_head_lines,
                                                config.tool_output_tail_lines,
                                                config.tool_output_max_bytes,
                                            )),
                                        );
                                    }
                                    new_sub
                                } else {
                                    sub.clone()
                                }
                            })
                            .collect();
                        new_blocks.push(annotate(block, "content", Value::Array(trimmed_subs), total));
                        changed = true;
                        continue;
                    }
                }
                _ => {}
            }
            new_blocks.push(block.clone());
        }

        if !changed {
            continue;
        }
        let value = with_content_blocks(record.value(), new_blocks);
        let new_bytes = serialized_len(&value);
        if new_bytes >= record.bytes() {
            continue;
        }
        result.estimated_bytes_saved += record.bytes() - new_bytes;
        result.modified += 1;
        result.actions.push(Action::Replace {
            index: record.line_index,
            value,
            reason: "tool-output-trim".to_string(),
        });
    }

    result.summary = format!("Trimmed oversized tool output in {} records", result.modified);
    result
}

fn annotate(block: &Value, key: &str, payload: Value, original_bytes: usize) -> Value {
    let mut new_block = block.clone();
    if let Some(map) = new_block.as_object_mut() {
        map.insert(key.to_string(), payload);
        map.insert(TRIM_ANNOTATION_KEY.to_string(), Value::from(original_bytes));
    }
    new_block
}

const READ_TOOLS: [&str; 2] = ["Read", "read"];
const EDIT_TOOLS: [&str; 5] = ["Edit", "edit", "Write", "write", "MultiEdit"];

#[derive(PartialEq)]
enum FileEvent {
    Read,
    Edit,
}

/// Drop read results whose target path is edited before any later read of
/// the same path. Path identity is the exact tool-call string, trimmed.
pub(super) fn stale_reads(records: &[Record], _config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("stale-reads");

    // path -> ordered (position, event, read tool_use_id)
    let mut events: HashMap<String, Vec<(usize, FileEvent, Option<String>)>> = HashMap::new();
    for (pos, record) in records.iter().enumerate() {
        for block in record.content_blocks() {
            if block_type(&block) != "tool_use" {
                continue;
            }
            let name = block.get("name").and_then(Value::as_str).unwrap_or("");
            let path = block
                .get("input")
                .and_then(|i| i.get("file_path"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("");
            if path.is_empty() {
                continue;
            }
            if READ_TOOLS.contains(&name) {
                let id = block.get("id").and_then(Value::as_str).map(str::to_string);
                events.entry(path.to_string()).or_default().push((pos, FileEvent::Read, id));
            } else if EDIT_TOOLS.contains(&name) {
                events.entry(path.to_string()).or_default().push((pos, FileEvent::Edit, None));
            }
        }
    }

    let mut stale_ids: HashSet<String> = HashSet::new();
    for path_events in events.values() {
        for (i, (_, event, id)) in path_events.iter().enumerate() {
            if *event != FileEvent::Read {
                continue;
            }
            // Stale when the very next event on this path is an edit.
            if let Some((_, next_event, _)) = path_events.get(i + 1) {
                if *next_event == FileEvent::Edit {
                    if let Some(id) = id {
                        stale_ids.insert(id.clone());
                    }
                }
            }
        }
    }
    if stale_ids.is_empty() {
        result.summary = "No stale reads found".to_string();
        return result;
    }

    // A result record is droppable only when every block it hosts is a
    // tool_result for a stale read.
    for record in records {
        if record.kind() != RecordKind::ToolResult {
            continue;
        }
        let blocks = record.content_blocks();
        let all_stale = !blocks.is_empty()
            && blocks.iter().all(|b| {
                block_type(b) == "tool_result"
                    && b.get("tool_use_id")
                        .and_then(Value::as_str)
                        .is_some_and(|id| stale_ids.contains(id))
            });
        if all_stale {
            result.estimated_bytes_saved += record.bytes();
            result.removed += 1;
            result.actions.push(Action::Drop {
                index: record.line_index,
                reason: "stale read (file later edited)".to_string(),
            });
        }
    }

    result.summary = format!("Dropped {} stale read results", result.removed);
    result
}

static REMINDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<system-reminder>.*?</system-reminder>").unwrap());
static BLANK_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Keep the first occurrence of each system-reminder body, drop the rest
/// from their hosting blocks. A record whose content empties out is dropped.
pub(super) fn system_reminder_dedup(records: &[Record], _config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("system-reminder-dedup");
    let mut seen: HashSet<[u8; 32]> = HashSet::new();
    let mut unique = 0usize;

    for record in records {
        let kind = record.kind();
        if kind == RecordKind::Unknown || kind.is_protected() {
            continue;
        }
        let blocks = record.content_blocks();
        if blocks.is_empty() {
            continue;
        }

        let mut new_blocks = Vec::with_capacity(blocks.len());
        let mut changed = false;
        for block in &blocks {
            let (text, text_key) = match block_type(block) {
                "text" => (block.get("text").and_then(Value::as_str), "text"),
                "tool_result" => (block.get("content").and_then(Value::as_str), "content"),
                _ => (None, ""),
            };
            let Some(text) = text else {
                new_blocks.push(block.clone());
                continue;
            };

            let mut new_text = text.to_string();
            let mut block_changed = false;
            for m in REMINDER_RE.find_iter(text) {
                let hash: [u8; 32] = Sha256::digest(m.as_str().as_bytes()).into();
                if seen.contains(&hash) {
                    new_text = new_text.replacen(m.as_str(), "", 1);
                    block_changed = true;
                } else {
                    seen.insert(hash);
                    unique += 1;
                }
            }
            if !block_changed {
                new_blocks.push(block.clone());
                continue;
            }
            changed = true;
            let new_text = BLANK_RUN_RE.replace_all(&new_text, "\n\n").trim().to_string();
            if new_text.is_empty() {
                // The block held nothing but repeated reminders.
                continue;
            }
            let mut new_block = block.clone();
            if let Some(map) = new_block.as_object_mut() {
                map.insert(text_key.to_string(), Value::from(new_text));
            }
            new_blocks.push(new_block);
        }

        if !changed {
            continue;
        }
        if new_blocks.is_empty() {
            result.estimated_bytes_saved += record.bytes();
            result.removed += 1;
            result.actions.push(Action::Drop {
                index: record.line_index,
                reason: "record emptied by reminder dedup".to_string(),
            });
            continue;
        }
        let value = with_content_blocks(record.value(), new_blocks);
        let new_bytes = serialized_len(&value);
        if new_bytes >= record.bytes() {
            continue;
        }
        result.estimated_bytes_saved += record.bytes() - new_bytes;
        result.modified += 1;
        result.actions.push(Action::Replace {
            index: record.line_index,
            value,
            reason: "system-reminder-dedup".to_string(),
        });
    }

    result.summary = format!(
        "Deduped reminders in {} records ({unique} unique)",
        result.removed + result.modified
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(index: usize, json: Value) -> Record {
        Record::from_line(index, &json.to_string())
    }

    fn assistant_with_thinking(index: usize, thinking: &str) -> Record {
        rec(
            index,
            serde_json::json!({
                "type": "assistant",
                "uuid": format!("u{index}"),
                "message": {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": thinking, "signature": "sig-data"},
                    {"type": "text", "text": "answer"},
                ]},
            }),
        )
    }

    #[test]
    fn thinking_remove_drops_block_and_signature() {
        let records = vec![assistant_with_thinking(0, "long deliberation")];
        let result = thinking_blocks(&records, &StrategyConfig::default());
        assert_eq!(result.modified, 1);
        match &result.actions[0] {
            Action::Replace { value, .. } => {
                let blocks = value["message"]["content"].as_array().unwrap();
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0]["type"], "text");
            }
            other => panic!("expected Replace, got {other:?}"),
        }
    }

    #[test]
    fn thinking_truncate_keeps_prefix() {
        let long = "x".repeat(500);
        let records = vec![assistant_with_thinking(0, &long)];
        let config = StrategyConfig {
            thinking_mode: ThinkingMode::Truncate,
            ..StrategyConfig::default()
        };
        let result = thinking_blocks(&records, &config);
        match &result.actions[0] {
            Action::Replace { value, .. } => {
                let thinking = value["message"]["content"][0]["thinking"].as_str().unwrap();
                assert!(thinking.starts_with(&"x".repeat(THINKING_KEEP_CHARS)));
                assert!(thinking.ends_with("...[truncated]"));
                assert!(value["message"]["content"][0].get("signature").is_none());
            }
            other => panic!("expected Replace, got {other:?}"),
        }
    }

    #[test]
    fn thinking_signature_only_preserves_text() {
        let records = vec![assistant_with_thinking(0, "keep me")];
        let config = StrategyConfig {
            thinking_mode: ThinkingMode::SignatureOnly,
            ..StrategyConfig::default()
        };
        let result = thinking_blocks(&records, &config);
        match &result.actions[0] {
            Action::Replace { value, .. } => {
                assert_eq!(value["message"]["content"][0]["thinking"], "keep me");
                assert!(value["message"]["content"][0].get("signature").is_none());
            }
            other => panic!("expected Replace, got {other:?}"),
        }
    }

    fn tool_result_record(index: usize, content: String) -> Record {
        rec(
            index,
            serde_json::json!({
                "type": "user",
                "uuid": format!("u{index}"),
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": content}
                ]},
            }),
        )
    }

    #[test]
    fn tool_output_exactly_at_limit_is_untouched() {
        let config = StrategyConfig::default();
        let content = "y".repeat(config.tool_output_max_bytes);
        let records = vec![tool_result_record(0, content)];
        let result = tool_output_trim(&records, &config);
        assert!(result.actions.is_empty());
    }

    #[test]
    fn tool_output_one_byte_over_is_trimmed_and_annotated() {
        let config = StrategyConfig::default();
        let content = "y".repeat(config.tool_output_max_bytes + 1);
        let records = vec![tool_result_record(0, content.clone())];
        let result = tool_output_trim(&records, &config);
        assert_eq!(result.modified, 1);
        match &result.actions[0] {
            Action::Replace { value, .. } => {
                let block = &value["message"]["content"][0];
                assert_eq!(block[TRIM_ANNOTATION_KEY], content.len());
                assert!(block["content"].as_str().unwrap().len() < content.len());
            }
            other => panic!("expected Replace, got {other:?}"),
        }
    }

    #[test]
    fn tool_output_line_window_keeps_head_and_tail() {
        let config = StrategyConfig::default();
        let content: String = (0..150).map(|i| format!("line {i}\n")).collect();
        let records = vec![tool_result_record(0, content)];
        let result = tool_output_trim(&records, &config);
        match &result.actions[0] {
            Action::Replace { value, .. } => {
                let trimmed = value["message"]["content"][0]["content"].as_str().unwrap();
                assert!(trimmed.starts_with("line 0\n"));
                assert!(trimmed.contains("line 49"));
                assert!(trimmed.contains("trimmed by slimline"));
                assert!(trimmed.contains("line 149"));
                assert!(!trimmed.contains("line 70\n"));
            }
            other => panic!("expected Replace, got {other:?}"),
        }
    }

    #[test]
    fn annotated_blocks_are_not_retrimmed() {
        let config = StrategyConfig::default();
        let content = "y".repeat(config.tool_output_max_bytes + 1);
        let records = vec![tool_result_record(0, content)];
        let first = tool_output_trim(&records, &config);
        let replaced = match &first.actions[0] {
            Action::Replace { value, .. } => Record::from_value(0, value.clone()),
            other => panic!("expected Replace, got {other:?}"),
        };
        let again = tool_output_trim(&[replaced], &config);
        assert!(again.actions.is_empty());
    }

    fn read_call(index: usize, id: &str, path: &str) -> Record {
        rec(
            index,
            serde_json::json!({
                "type": "assistant",
                "uuid": format!("u{index}"),
                "message": {"role": "assistant", "content": [
                    {"type": "tool_use", "name": "Read", "id": id, "input": {"file_path": path}}
                ]},
            }),
        )
    }

    fn edit_call(index: usize, path: &str) -> Record {
        rec(
            index,
            serde_json::json!({
                "type": "assistant",
                "uuid": format!("u{index}"),
                "message": {"role": "assistant", "content": [
                    {"type": "tool_use", "name": "Edit", "id": format!("e{index}"),
                     "input": {"file_path": path, "old_string": "a", "new_string": "b"}}
                ]},
            }),
        )
    }

    fn result_for(index: usize, id: &str) -> Record {
        rec(
            index,
            serde_json::json!({
                "type": "user",
                "uuid": format!("u{index}"),
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": id, "content": "file body here"}
                ]},
            }),
        )
    }

    #[test]
    fn stale_read_is_dropped_later_read_kept() {
        let records = vec![
            read_call(10, "r1", "/x/y.py"),
            result_for(11, "r1"),
            edit_call(12, "/x/y.py"),
            read_call(20, "r2", "/x/y.py"),
            result_for(21, "r2"),
        ];
        let result = stale_reads(&records, &StrategyConfig::default());
        assert_eq!(result.removed, 1);
        assert_eq!(result.actions[0].span().0, 11);
    }

    #[test]
    fn read_followed_by_read_is_not_stale() {
        let records = vec![
            read_call(0, "r1", "/a"),
            result_for(1, "r1"),
            read_call(2, "r2", "/a"),
            result_for(3, "r2"),
            edit_call(4, "/a"),
        ];
        let result = stale_reads(&records, &StrategyConfig::default());
        // Only the second read is stale: its next event on /a is the edit.
        assert_eq!(result.removed, 1);
        assert_eq!(result.actions[0].span().0, 3);
    }

    #[test]
    fn path_identity_is_the_trimmed_exact_string() {
        let records = vec![
            read_call(0, "r1", "  /a "),
            result_for(1, "r1"),
            edit_call(2, "/a"),
        ];
        let result = stale_reads(&records, &StrategyConfig::default());
        assert_eq!(result.removed, 1);
    }

    fn user_text(index: usize, text: &str) -> Record {
        rec(
            index,
            serde_json::json!({
                "type": "user",
                "uuid": format!("u{index}"),
                "message": {"role": "user", "content": [{"type": "text", "text": text}]},
            }),
        )
    }

    #[test]
    fn duplicate_reminders_are_removed_keeping_first() {
        let reminder = "<system-reminder>memory contents</system-reminder>";
        let records = vec![
            user_text(0, &format!("hello {reminder}")),
            user_text(1, &format!("again {reminder}")),
        ];
        let result = system_reminder_dedup(&records, &StrategyConfig::default());
        assert_eq!(result.modified, 1);
        match &result.actions[0] {
            Action::Replace { index, value, .. } => {
                assert_eq!(*index, 1);
                let text = value["message"]["content"][0]["text"].as_str().unwrap();
                assert_eq!(text, "again");
            }
            other => panic!("expected Replace, got {other:?}"),
        }
    }

    #[test]
    fn record_emptied_by_dedup_is_dropped() {
        let reminder = "<system-reminder>the same note</system-reminder>";
        let records = vec![user_text(0, reminder), user_text(1, reminder)];
        let result = system_reminder_dedup(&records, &StrategyConfig::default());
        assert_eq!(result.removed, 1);
        assert_eq!(result.actions[0].span().0, 1);
    }
}
