//! Token estimation for session files.
//!
//! Two methods: exact counters read from the last main-chain assistant
//! record's `usage` object, and a byte heuristic (`⌈bytes / 4⌉` over the
//! textual content of every context-bearing block) when no counters exist.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde_json::Value;

use crate::record::{block_text, block_type, Record, RecordKind};

/// The context window the percentage gauge is measured against.
pub const CONTEXT_WINDOW_TOKENS: u64 = 200_000;

/// Bytes of textual content per estimated token.
const BYTES_PER_TOKEN: u64 = 4;

/// How much of the file tail the quick estimate reads.
const QUICK_TAIL_BYTES: u64 = 50 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMethod {
    Exact,
    Heuristic,
}

impl TokenMethod {
    pub fn label(self) -> &'static str {
        match self {
            TokenMethod::Exact => "exact",
            TokenMethod::Heuristic => "heuristic",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenEstimate {
    pub total: u64,
    pub context_pct: f64,
    pub method: TokenMethod,
}

impl TokenEstimate {
    fn new(total: u64, method: TokenMethod) -> Self {
        Self {
            total,
            context_pct: total as f64 / CONTEXT_WINDOW_TOKENS as f64 * 100.0,
            method,
        }
    }
}

/// Estimate the session's context usage, preferring exact counters.
pub fn estimate(records: &[Record]) -> TokenEstimate {
    match extract_usage_total(records) {
        Some(total) => TokenEstimate::new(total, TokenMethod::Exact),
        None => TokenEstimate::new(estimate_heuristic(records), TokenMethod::Heuristic),
    }
}

/// Exact context size from the last main-chain assistant record carrying a
/// usage object: the sum of all input-side counters.
pub fn extract_usage_total(records: &[Record]) -> Option<u64> {
    records
        .iter()
        .rev()
        .filter(|r| {
            matches!(r.kind(), RecordKind::Assistant | RecordKind::ToolUse) && !r.is_sidechain()
        })
        .find_map(|r| usage_total_of(r.value()))
}

fn usage_total_of(value: &Value) -> Option<u64> {
    let usage = value.get("message")?.get("usage")?;
    if !usage.is_object() {
        return None;
    }
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    Some(field("input_tokens") + field("cache_creation_input_tokens") + field("cache_read_input_tokens"))
}

/// `⌈bytes / 4⌉` over the textual content of every kept block.
pub fn estimate_heuristic(records: &[Record]) -> u64 {
    let mut total_bytes: u64 = 0;
    for record in records {
        if !counts_toward_context(record) {
            continue;
        }
        for block in record.content_blocks() {
            // Thinking is ephemeral and excluded from context accounting.
            if block_type(&block) == "thinking" {
                continue;
            }
            total_bytes += block_text(&block).len() as u64;
        }
    }
    total_bytes.div_ceil(BYTES_PER_TOKEN)
}

/// Progress ticks, snapshots, and sidechain records do not ride in the
/// main context window; nor do assistant turns that are pure thinking.
fn counts_toward_context(record: &Record) -> bool {
    match record.kind() {
        RecordKind::ProgressTick | RecordKind::FileHistorySnapshot | RecordKind::Unknown => false,
        _ if record.is_sidechain() => false,
        RecordKind::Assistant => {
            let blocks = record.content_blocks();
            blocks.is_empty()
                || blocks
                    .iter()
                    .any(|b| matches!(block_type(b), "text" | "tool_use" | "tool_result"))
        }
        _ => true,
    }
}

/// Fast token estimate from the tail of a session file, without loading
/// the whole thing. Returns `None` when no usage data is found.
pub fn quick_estimate(path: &Path) -> Option<u64> {
    let mut file = File::open(path).ok()?;
    let size = file.metadata().ok()?.len();
    let read_from = size.saturating_sub(QUICK_TAIL_BYTES);
    file.seek(SeekFrom::Start(read_from)).ok()?;
    let mut raw = String::new();
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).ok()?;
    raw.push_str(&String::from_utf8_lossy(&bytes));

    let mut lines: Vec<&str> = raw.lines().collect();
    if read_from > 0 && !lines.is_empty() {
        // The first line is almost certainly partial after a seek.
        lines.remove(0);
    }
    for line in lines.iter().rev() {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        if value.get("isSidechain").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        if let Some(total) = usage_total_of(&value) {
            return Some(total);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn rec(index: usize, json: Value) -> Record {
        Record::from_line(index, &json.to_string())
    }

    fn assistant_with_usage(index: usize, input: u64, cache_read: u64) -> Record {
        rec(
            index,
            json!({
                "type": "assistant",
                "uuid": format!("u{index}"),
                "message": {
                    "role": "assistant",
                    "usage": {
                        "input_tokens": input,
                        "output_tokens": 10,
                        "cache_creation_input_tokens": 0,
                        "cache_read_input_tokens": cache_read,
                    },
                    "content": [{"type": "text", "text": "ok"}],
                },
            }),
        )
    }

    #[test]
    fn exact_usage_wins_and_sums_input_side() {
        let records = vec![
            assistant_with_usage(0, 100, 1000),
            assistant_with_usage(1, 200, 5000),
        ];
        let est = estimate(&records);
        assert_eq!(est.method, TokenMethod::Exact);
        assert_eq!(est.total, 5200);
    }

    #[test]
    fn sidechain_usage_is_skipped() {
        let mut sidechain = json!({
            "type": "assistant",
            "isSidechain": true,
            "message": {
                "role": "assistant",
                "usage": {"input_tokens": 999_999},
                "content": [{"type": "text", "text": "sub"}],
            },
        });
        sidechain["uuid"] = json!("side");
        let records = vec![assistant_with_usage(0, 500, 0), rec(1, sidechain)];
        assert_eq!(extract_usage_total(&records), Some(500));
    }

    #[test]
    fn heuristic_is_ceil_bytes_over_four() {
        let records = vec![rec(
            0,
            json!({
                "type": "user",
                "uuid": "u0",
                "message": {"role": "user", "content": "abcde"},
            }),
        )];
        let est = estimate(&records);
        assert_eq!(est.method, TokenMethod::Heuristic);
        // 5 bytes -> ceil(5/4) = 2
        assert_eq!(est.total, 2);
    }

    #[test]
    fn heuristic_skips_ticks_snapshots_and_thinking() {
        let records = vec![
            rec(0, json!({"type": "progress", "message": {"content": "tick tick tick"}})),
            rec(1, json!({"type": "file-history-snapshot", "snapshot": {"x": "y"}})),
            rec(
                2,
                json!({
                    "type": "assistant",
                    "uuid": "u2",
                    "message": {"role": "assistant", "content": [
                        {"type": "thinking", "thinking": "a very long internal monologue"},
                    ]},
                }),
            ),
        ];
        assert_eq!(estimate_heuristic(&records), 0);
    }

    #[test]
    fn context_percentage_tracks_window() {
        let est = TokenEstimate::new(100_000, TokenMethod::Exact);
        assert!((est.context_pct - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn quick_estimate_reads_the_tail() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for i in 0..50 {
            writeln!(file, "{}", json!({"type": "user", "uuid": format!("u{i}"), "message": {"role": "user", "content": "filler"}})).unwrap();
        }
        writeln!(
            file,
            "{}",
            json!({
                "type": "assistant",
                "uuid": "ux",
                "message": {"role": "assistant", "usage": {
                    "input_tokens": 1234, "cache_read_input_tokens": 4321
                }, "content": []},
            })
        )
        .unwrap();
        file.flush().unwrap();
        assert_eq!(quick_estimate(file.path()), Some(5555));
    }

    #[test]
    fn quick_estimate_without_usage_is_none() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", json!({"type": "user", "message": {"content": "x"}})).unwrap();
        file.flush().unwrap();
        assert_eq!(quick_estimate(file.path()), None);
    }
}
