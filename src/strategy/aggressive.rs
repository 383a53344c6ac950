//! Aggressive-tier strategies: maximum savings, more invasive rewrites.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::record::{
    block_bytes, block_text, block_type, canonical_json, serialized_len, with_content_blocks,
    Record, RecordKind,
};

use super::{head_tail_trim, Action, StrategyConfig, StrategyResult, COLLAPSED_COUNT_KEY, TRIM_ANNOTATION_KEY};

const HTTP_TOOLS: [&str; 4] = ["WebFetch", "WebSearch", "webfetch", "websearch"];
const POLL_TOOLS: [&str; 2] = ["TaskOutput", "taskoutput"];
const MIN_HTTP_RUN: usize = 3;
const MIN_POLL_RUN: usize = 3;

fn sha(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars()
        .take(max_chars)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect()
}

/// Synthetic collapse record: the first record's envelope with its content
/// replaced by one text block and a run-length marker.
fn collapse_record(first: &Record, count: usize, text: String) -> Value {
    let mut value = first.value().clone();
    if let Some(map) = value.as_object_mut() {
        map.insert(COLLAPSED_COUNT_KEY.to_string(), Value::from(count));
    }
    with_content_blocks(
        &value,
        vec![serde_json::json!({ "type": "text", "text": text })],
    )
}

fn tool_use_names(record: &Record) -> Vec<String> {
    record
        .content_blocks()
        .iter()
        .filter(|b| block_type(b) == "tool_use")
        .filter_map(|b| b.get("name").and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// Collapse runs of three or more consecutive web fetch/search records
/// (calls, their results, interleaved progress ticks) into one summary.
pub(super) fn http_spam(records: &[Record], _config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("http-spam");

    let mut http_ids: HashSet<String> = HashSet::new();
    for record in records {
        for block in record.content_blocks() {
            if block_type(&block) == "tool_use"
                && block
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|n| HTTP_TOOLS.contains(&n))
            {
                if let Some(id) = block.get("id").and_then(Value::as_str) {
                    http_ids.insert(id.to_string());
                }
            }
        }
    }

    let is_http = |record: &Record| -> bool {
        record.content_blocks().iter().any(|b| match block_type(b) {
            "tool_use" => b
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| HTTP_TOOLS.contains(&n)),
            "tool_result" => b
                .get("tool_use_id")
                .and_then(Value::as_str)
                .is_some_and(|id| http_ids.contains(id)),
            _ => false,
        })
    };

    let mut i = 0;
    while i < records.len() {
        if !is_http(&records[i]) {
            i += 1;
            continue;
        }
        let start = i;
        let mut last_http = i;
        while i < records.len() {
            let record = &records[i];
            if record.kind().is_protected() || record.kind() == RecordKind::Unknown {
                break;
            }
            if is_http(record) {
                last_http = i;
                i += 1;
            } else if record.kind() == RecordKind::ProgressTick {
                i += 1;
            } else {
                break;
            }
        }
        let run = &records[start..=last_http];
        i = last_http + 1;
        if run.len() < MIN_HTTP_RUN {
            continue;
        }

        let last_tool = run
            .iter()
            .rev()
            .flat_map(tool_use_names)
            .find(|n| HTTP_TOOLS.contains(&n.as_str()))
            .unwrap_or_else(|| "web request".to_string());
        let synthetic = collapse_record(
            &run[0],
            run.len(),
            format!("[{} web request records collapsed; last: {last_tool}]", run.len()),
        );
        let run_bytes: usize = run.iter().map(Record::bytes).sum();
        result.estimated_bytes_saved += run_bytes.saturating_sub(serialized_len(&synthetic));
        result.removed += run.len() - 1;
        result.modified += 1;
        result.actions.push(Action::ReplaceRange {
            first: run[0].line_index,
            last: run[run.len() - 1].line_index,
            value: synthetic,
            reason: format!("http run of {}", run.len()),
        });
    }

    result.summary = format!("Collapsed {} web request runs", result.actions.len());
    result
}

/// Collapse an error followed by identical retries that fail the same way
/// into one record carrying the attempt count and the final outcome.
pub(super) fn error_retry_collapse(records: &[Record], _config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("error-retry-collapse");

    #[derive(Clone)]
    enum Event {
        Call { pos: usize, hash: [u8; 32], name: String },
        Error { pos: usize, call_hash: Option<[u8; 32]>, sig: [u8; 32], text: String },
    }

    let mut call_hash_by_id: HashMap<String, ([u8; 32], String)> = HashMap::new();
    let mut events: Vec<Event> = Vec::new();
    for (pos, record) in records.iter().enumerate() {
        for block in record.content_blocks() {
            match block_type(&block) {
                "tool_use" => {
                    let name = block.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let hash = sha(format!("{name}:{}", canonical_json(&input)).as_bytes());
                    if let Some(id) = block.get("id").and_then(Value::as_str) {
                        call_hash_by_id.insert(id.to_string(), (hash, name.clone()));
                    }
                    events.push(Event::Call { pos, hash, name });
                }
                "tool_result" if block.get("is_error").and_then(Value::as_bool) == Some(true) => {
                    let text = block_text(&block);
                    let call_hash = block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .and_then(|id| call_hash_by_id.get(id))
                        .map(|(h, _)| *h);
                    let sig = sha(text.trim().as_bytes());
                    events.push(Event::Error { pos, call_hash, sig, text });
                }
                _ => {}
            }
        }
    }

    let mut consumed_until = 0usize;
    let mut e = 0;
    while e < events.len() {
        let (first_pos, chain_hash, chain_sig, final_text) = match &events[e] {
            Event::Error { pos, call_hash: Some(h), sig, text } if *pos >= consumed_until => {
                (*pos, *h, *sig, text.clone())
            }
            _ => {
                e += 1;
                continue;
            }
        };

        // Walk call/error pairs that repeat the same call and the same
        // failure signature.
        let mut chain_positions: Vec<usize> = vec![first_pos];
        let mut attempts = 1usize;
        let mut last_text = final_text;
        let mut k = e + 1;
        while k + 1 < events.len() {
            let retry = match (&events[k], &events[k + 1]) {
                (
                    Event::Call { pos: call_pos, hash, .. },
                    Event::Error { pos: err_pos, sig, text, .. },
                ) if *hash == chain_hash && *sig == chain_sig => Some((*call_pos, *err_pos, text.clone())),
                _ => None,
            };
            match retry {
                Some((call_pos, err_pos, text)) => {
                    chain_positions.push(call_pos);
                    chain_positions.push(err_pos);
                    attempts += 1;
                    last_text = text;
                    k += 2;
                }
                None => break,
            }
        }

        if attempts < 2 {
            e += 1;
            continue;
        }

        // The run must be contiguous: every record between the first and
        // last error belongs to the retry chain.
        let last_pos = *chain_positions.last().expect("chain is non-empty");
        let chain_set: HashSet<usize> = chain_positions.iter().copied().collect();
        let contiguous = (first_pos..=last_pos).all(|p| chain_set.contains(&p));
        let span_ok = records[first_pos..=last_pos]
            .iter()
            .all(|r| !r.kind().is_protected() && r.kind() != RecordKind::Unknown);
        if !contiguous || !span_ok {
            e = k;
            continue;
        }

        let run = &records[first_pos..=last_pos];
        let tool_name = events[e + 1..]
            .iter()
            .find_map(|ev| match ev {
                Event::Call { hash, name, .. } if *hash == chain_hash => Some(name.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "tool".to_string());
        let synthetic = collapse_record(
            &run[0],
            run.len(),
            format!(
                "[{attempts} attempts of {tool_name} failed with the same error; final: {}]",
                preview(&last_text, 120)
            ),
        );
        let run_bytes: usize = run.iter().map(Record::bytes).sum();
        result.estimated_bytes_saved += run_bytes.saturating_sub(serialized_len(&synthetic));
        result.removed += run.len() - 1;
        result.modified += 1;
        result.actions.push(Action::ReplaceRange {
            first: run[0].line_index,
            last: run[run.len() - 1].line_index,
            value: synthetic,
            reason: format!("{attempts} identical failed attempts"),
        });
        consumed_until = last_pos + 1;
        e = k;
    }

    result.summary = format!("Collapsed {} retry chains", result.actions.len());
    result
}

/// Collapse consecutive non-blocking background status polls (and their
/// results) when no user turn intervenes. Queue-operation records are a
/// protected kind and never collapse.
pub(super) fn background_poll_collapse(records: &[Record], _config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("background-poll-collapse");

    let mut poll_ids: HashSet<String> = HashSet::new();
    for record in records {
        for block in record.content_blocks() {
            if is_poll_call(&block) {
                if let Some(id) = block.get("id").and_then(Value::as_str) {
                    poll_ids.insert(id.to_string());
                }
            }
        }
    }

    let is_poll = |record: &Record| -> bool {
        record.content_blocks().iter().any(|b| {
            is_poll_call(b)
                || (block_type(b) == "tool_result"
                    && b.get("tool_use_id")
                        .and_then(Value::as_str)
                        .is_some_and(|id| poll_ids.contains(id)))
        })
    };

    let mut i = 0;
    while i < records.len() {
        if !is_poll(&records[i]) {
            i += 1;
            continue;
        }
        let start = i;
        let mut last_poll = i;
        while i < records.len() {
            let record = &records[i];
            if record.kind().is_protected()
                || record.kind() == RecordKind::Unknown
                || record.kind() == RecordKind::User
            {
                break;
            }
            if is_poll(record) {
                last_poll = i;
                i += 1;
            } else if record.kind() == RecordKind::ProgressTick {
                i += 1;
            } else {
                break;
            }
        }
        let run = &records[start..=last_poll];
        i = last_poll + 1;
        if run.len() < MIN_POLL_RUN {
            continue;
        }

        let last_result = run
            .iter()
            .rev()
            .flat_map(|r| r.content_blocks())
            .find(|b| block_type(b) == "tool_result")
            .map(|b| preview(&block_text(&b), 100))
            .unwrap_or_default();
        let synthetic = collapse_record(
            &run[0],
            run.len(),
            format!("[{} background status polls collapsed; last: {last_result}]", run.len()),
        );
        let run_bytes: usize = run.iter().map(Record::bytes).sum();
        result.estimated_bytes_saved += run_bytes.saturating_sub(serialized_len(&synthetic));
        result.removed += run.len() - 1;
        result.modified += 1;
        result.actions.push(Action::ReplaceRange {
            first: run[0].line_index,
            last: run[run.len() - 1].line_index,
            value: synthetic,
            reason: format!("poll run of {}", run.len()),
        });
    }

    result.summary = format!("Collapsed {} poll runs", result.actions.len());
    result
}

fn is_poll_call(block: &Value) -> bool {
    block_type(block) == "tool_use"
        && block
            .get("name")
            .and_then(Value::as_str)
            .is_some_and(|n| POLL_TOOLS.contains(&n))
        && block
            .get("input")
            .and_then(|i| i.get("block"))
            .and_then(Value::as_bool)
            == Some(false)
}

/// Replace repeated large blocks with a stub naming the record that holds
/// the first copy.
pub(super) fn document_dedup(records: &[Record], config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("document-dedup");

    // payload hash -> line index of the first record carrying it
    let mut first_seen: HashMap<[u8; 32], usize> = HashMap::new();
    // record position -> block positions that duplicate an earlier payload
    let mut dup_blocks: HashMap<usize, Vec<(usize, usize, String)>> = HashMap::new();

    for (pos, record) in records.iter().enumerate() {
        let kind = record.kind();
        if kind == RecordKind::Unknown || kind.is_protected() {
            continue;
        }
        for (bi, block) in record.content_blocks().iter().enumerate() {
            let Some(hash) = dedup_payload_hash(block, config.document_dedup_min_bytes) else {
                continue;
            };
            match first_seen.get(&hash) {
                None => {
                    first_seen.insert(hash, record.line_index);
                }
                Some(&first_index) => {
                    let text = block_text(block);
                    dup_blocks
                        .entry(pos)
                        .or_default()
                        .push((bi, first_index, preview(&text, 80)));
                }
            }
        }
    }

    let mut positions: Vec<usize> = dup_blocks.keys().copied().collect();
    positions.sort_unstable();
    for pos in positions {
        let record = &records[pos];
        let mut blocks = record.content_blocks();
        for (bi, first_index, text_preview) in &dup_blocks[&pos] {
            let stub_text = format!(
                "[duplicate content removed by slimline - identical to record {first_index}: {text_preview}...]"
            );
            blocks[*bi] = match block_type(&blocks[*bi]) {
                "tool_result" => {
                    let mut b = blocks[*bi].clone();
                    if let Some(map) = b.as_object_mut() {
                        map.insert("content".to_string(), Value::from(stub_text));
                    }
                    b
                }
                _ => serde_json::json!({ "type": "text", "text": stub_text }),
            };
        }
        let value = with_content_blocks(record.value(), blocks);
        let new_bytes = serialized_len(&value);
        if new_bytes >= record.bytes() {
            continue;
        }
        result.estimated_bytes_saved += record.bytes() - new_bytes;
        result.modified += 1;
        result.actions.push(Action::Replace {
            index: record.line_index,
            value,
            reason: "document-dedup".to_string(),
        });
    }

    result.summary = format!(
        "Deduped large blocks in {} records ({} distinct payloads tracked)",
        result.modified,
        first_seen.len()
    );
    result
}

fn dedup_payload_hash(block: &Value, min_bytes: usize) -> Option<[u8; 32]> {
    match block_type(block) {
        "document" => {
            let payload = canonical_json(block);
            (payload.len() >= min_bytes).then(|| sha(payload.as_bytes()))
        }
        "text" | "tool_result" => {
            let text = block_text(block);
            (text.len() >= min_bytes).then(|| sha(text.as_bytes()))
        }
        _ => None,
    }
}

/// Safety net: trim any remaining content block over the mega cap. Runs
/// after every other block rule and skips blocks an earlier strategy
/// already annotated.
pub(super) fn mega_block_trim(records: &[Record], config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("mega-block-trim");

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
            if block.get(TRIM_ANNOTATION_KEY).is_some()
                || block_bytes(block) <= config.mega_block_max_bytes
            {
                new_blocks.push(block.clone());
                continue;
            }
            let text = block_text(block);
            let text_key = match block_type(block) {
                "thinking" => "thinking",
                "text" => "text",
                "tool_result" if block.get("content").is_some_and(Value::is_string) => "content",
                _ => {
                    new_blocks.push(block.clone());
                    continue;
                }
            };
            if text.len() <= config.mega_block_max_bytes {
                new_blocks.push(block.clone());
                continue;
            }
            let trimmed = head_tail_trim(
                &text,
                config.mega_block_head_lines,
                config.mega_block_tail_lines,
                config.mega_block_max_bytes,
            );
            let mut new_block = block.clone();
            if let Some(map) = new_block.as_object_mut() {
                map.insert(text_key.to_string(), Value::from(trimmed));
                map.insert(TRIM_ANNOTATION_KEY.to_string(), Value::from(text.len()));
            }
            new_blocks.push(new_block);
            changed = true;
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
            reason: "mega-block-trim".to_string(),
        });
    }

    result.summary = format!("Trimmed mega blocks in {} records", result.modified);
    result
}

const ENVELOPE_FIELDS: [&str; 5] = ["cwd", "version", "gitBranch", "slug", "userType"];

/// Top-level key that carries the hoisted envelope constants on the header
/// record.
pub const ENVELOPE_HEADER_KEY: &str = "envelope";

/// Remove envelope fields whose value is constant across every record that
/// carries them, recording the constants once on the topmost carrier (the
/// header record). Values move under a nested key, so a second run sees no
/// top-level constants and does nothing.
pub(super) fn envelope_strip(records: &[Record], _config: &StrategyConfig) -> StrategyResult {
    let mut result = StrategyResult::new("envelope-strip");

    let mut values: HashMap<&str, (HashSet<String>, usize)> = HashMap::new();
    for record in records {
        if record.kind() == RecordKind::Unknown {
            continue;
        }
        for field in ENVELOPE_FIELDS {
            if let Some(v) = record.value().get(field) {
                let entry = values.entry(field).or_default();
                entry.0.insert(canonical_json(v));
                entry.1 += 1;
            }
        }
    }
    let constant_fields: Vec<&str> = ENVELOPE_FIELDS
        .iter()
        .copied()
        .filter(|f| values.get(f).is_some_and(|(vals, count)| vals.len() == 1 && *count >= 2))
        .collect();
    if constant_fields.is_empty() {
        result.summary = "No constant envelope fields found".to_string();
        return result;
    }

    let mut header_written = false;
    for record in records {
        if record.kind() == RecordKind::Unknown {
            continue;
        }
        let carried: Vec<&str> = constant_fields
            .iter()
            .copied()
            .filter(|f| record.value().get(*f).is_some())
            .collect();
        if carried.is_empty() {
            continue;
        }

        let mut value = record.value().clone();
        if !header_written {
            // The topmost carrier becomes the header: its constants move
            // under a nested envelope object instead of vanishing.
            let mut envelope = serde_json::Map::new();
            for field in &constant_fields {
                if let Some(v) = value.get(*field) {
                    envelope.insert(field.to_string(), v.clone());
                }
            }
            if let Some(map) = value.as_object_mut() {
                for field in &carried {
                    map.remove(*field);
                }
                map.insert(ENVELOPE_HEADER_KEY.to_string(), Value::Object(envelope));
            }
            header_written = true;
            result.modified += 1;
            result.actions.push(Action::Replace {
                index: record.line_index,
                value,
                reason: format!("envelope header ({})", constant_fields.join(", ")),
            });
            continue;
        }

        if let Some(map) = value.as_object_mut() {
            for field in &carried {
                map.remove(*field);
            }
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
            reason: "envelope-strip".to_string(),
        });
    }

    result.summary = format!(
        "Stripped {} from {} records",
        constant_fields.join(", "),
        result.modified
    );
    result
}
