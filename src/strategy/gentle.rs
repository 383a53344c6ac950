//! Gentle-tier strategies: safe, minimal pruning.

use serde_json::Value;

use crate::record::{canonical_json, serialized_len, Record, RecordKind};

use super::{Action, StrategyConfig, StrategyResult, COLLAPSED_COUNT_KEY};

/// Collapse runs of two or more consecutive progress ticks into a single
/// synthetic record carrying the run length and the last observed tick
/// text. The synthetic keeps the first tick's identifiers. Records that are
/// themselves the product of an earlier collapse are left alone so reruns
/// are no-ops.
pub(super) fn progress_collapse(records: &[Record], _config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("progress-collapse");

    let mut i = 0;
    let mut runs = 0;
    while i < records.len() {
        if !is_fresh_tick(&records[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < records.len() && is_fresh_tick(&records[i]) {
            i += 1;
        }
        let run = &records[start..i];
        if run.len() < 2 {
            continue;
        }

        let last_text = tick_text(run.last().expect("non-empty run"));
        let synthetic = collapsed_tick(&run[0], run.len(), &last_text);
        let run_bytes: usize = run.iter().map(Record::bytes).sum();
        result.estimated_bytes_saved += run_bytes.saturating_sub(serialized_len(&synthetic));
        result.removed += run.len() - 1;
        result.modified += 1;
        runs += 1;
        result.actions.push(Action::ReplaceRange {
            first: run[0].line_index,
            last: run[run.len() - 1].line_index,
            value: synthetic,
            reason: format!("progress run of {}", run.len()),
        });
    }

    result.summary = format!("Collapsed {runs} progress runs ({} ticks)", result.removed + runs);
    result
}

fn is_fresh_tick(record: &Record) -> bool {
    record.kind() == RecordKind::ProgressTick && record.value().get(COLLAPSED_COUNT_KEY).is_none()
}

fn tick_text(record: &Record) -> String {
    record
        .content_blocks()
        .iter()
        .map(crate::record::block_text)
        .find(|t| !t.is_empty())
        .unwrap_or_default()
}

fn collapsed_tick(first: &Record, count: usize, last_text: &str) -> Value {
    let mut value = first.value().clone();
    if let Some(map) = value.as_object_mut() {
        map.insert(COLLAPSED_COUNT_KEY.to_string(), Value::from(count));
    }
    let block = serde_json::json!({
        "type": "text",
        "text": format!("[{count} progress ticks collapsed; last: {last_text}]"),
    });
    match value.get_mut("message").and_then(Value::as_object_mut) {
        Some(message) => {
            message.insert("content".to_string(), Value::Array(vec![block]));
        }
        None => {
            if let Some(map) = value.as_object_mut() {
                map.insert(
                    "message".to_string(),
                    serde_json::json!({ "content": [block] }),
                );
            }
        }
    }
    value
}

/// Drop file-history snapshots whose canonicalized payload duplicates
/// another snapshot's. The last occurrence of each distinct payload
/// survives.
pub(super) fn file_history_dedup(records: &[Record], _config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("file-history-dedup");

    // payload hash -> positions, in file order
    let mut by_payload: Vec<(String, Vec<usize>)> = Vec::new();
    for (pos, record) in records.iter().enumerate() {
        if record.kind() != RecordKind::FileHistorySnapshot {
            continue;
        }
        let key = snapshot_payload_key(record.value());
        match by_payload.iter_mut().find(|(k, _)| *k == key) {
            Some((_, positions)) => positions.push(pos),
            None => by_payload.push((key, vec![pos])),
        }
    }

    for (_, positions) in &by_payload {
        for &pos in &positions[..positions.len() - 1] {
            let record = &records[pos];
            result.estimated_bytes_saved += record.bytes();
            result.removed += 1;
            result.actions.push(Action::Drop {
                index: record.line_index,
                reason: "duplicate file-history snapshot".to_string(),
            });
        }
    }

    result.summary = format!(
        "Removed {} duplicate snapshots ({} distinct payloads)",
        result.removed,
        by_payload.len()
    );
    result
}

/// Identity and bookkeeping fields do not make two snapshots distinct.
fn snapshot_payload_key(value: &Value) -> String {
    let mut payload = value.clone();
    if let Some(map) = payload.as_object_mut() {
        for field in ["uuid", "parentUuid", "timestamp", "messageId", "isSnapshotUpdate"] {
            map.remove(field);
        }
    }
    canonical_json(&payload)
}

const STRIP_INNER: [&str; 3] = ["usage", "stop_reason", "stop_sequence"];
const STRIP_OUTER: [&str; 5] = ["costUSD", "durationMs", "duration", "apiDuration", "requestId"];

/// Strip token-usage, stop-reason, and cost telemetry. Identifiers and
/// structural kind markers are never touched; protected kinds are still
/// eligible since only their metadata goes.
pub(super) fn metadata_strip(records: &[Record], _config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("metadata-strip");

    for record in records {
        if record.kind() == RecordKind::Unknown {
            continue;
        }
        let mut value = record.value().clone();
        let mut changed = false;

        if let Some(inner) = value.get_mut("message").and_then(Value::as_object_mut) {
            for field in STRIP_INNER {
                changed |= inner.remove(field).is_some();
            }
        }
        if let Some(outer) = value.as_object_mut() {
            for field in STRIP_OUTER {
                changed |= outer.remove(field).is_some();
            }
        }

        if !changed {
            continue;
        }
        let new_bytes = serialized_len(&value);
        if new_bytes >= record.bytes() {
            continue;
        }
        result.estimated_bytes_saved += record.bytes() - new_bytes;
        result.modified += 1;
        result.actions.push(Action::Replace {
            index: record.line_index,
            value,
            reason: "metadata-strip".to_string(),
        });
    }

    result.summary = format!("Stripped metadata from {} records", result.modified);
    result
}
