//! Session diagnosis: where the weight is and what each prescription would
//! shave off.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::apply::run_prescription;
use crate::record::{block_bytes, block_text, block_type, total_bytes, Record, RecordKind};
use crate::strategy::{Prescription, StrategyConfig};
use crate::tokens::{self, TokenEstimate};

static REMINDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<system-reminder>.*?</system-reminder>").unwrap());

/// Byte cap above which a tool result counts as oversized in the report.
const OVERSIZED_RESULT_BYTES: usize = 8 * 1024;
const HEAVIEST_COUNT: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct KindStats {
    pub count: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone)]
pub struct HeavyRecord {
    pub line_index: usize,
    pub kind: RecordKind,
    pub bytes: usize,
}

/// The bloat breakdown of one session.
#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub total_bytes: usize,
    pub total_records: usize,
    pub tokens: TokenEstimate,
    pub by_kind: BTreeMap<&'static str, KindStats>,
    pub heaviest: Vec<HeavyRecord>,
    pub progress_ticks: usize,
    pub file_history_snapshots: usize,
    pub system_reminders: usize,
    pub thinking_blocks: usize,
    pub thinking_bytes: usize,
    pub signature_bytes: usize,
    pub oversized_tool_results: usize,
    pub tool_result_bytes: usize,
}

pub fn diagnose(records: &[Record]) -> Diagnosis {
    let mut by_kind: BTreeMap<&'static str, KindStats> = BTreeMap::new();
    let mut heaviest: Vec<HeavyRecord> = Vec::with_capacity(records.len());

    let mut progress_ticks = 0;
    let mut file_history_snapshots = 0;
    let mut system_reminders = 0;
    let mut thinking_blocks = 0;
    let mut thinking_bytes = 0;
    let mut signature_bytes = 0;
    let mut oversized_tool_results = 0;
    let mut tool_result_bytes = 0;

    for record in records {
        let kind = record.kind();
        let stats = by_kind.entry(kind.label()).or_default();
        stats.count += 1;
        stats.bytes += record.bytes();
        heaviest.push(HeavyRecord {
            line_index: record.line_index,
            kind,
            bytes: record.bytes(),
        });

        match kind {
            RecordKind::ProgressTick => progress_ticks += 1,
            RecordKind::FileHistorySnapshot => file_history_snapshots += 1,
            _ => {}
        }

        for block in record.content_blocks() {
            match block_type(&block) {
                "thinking" => {
                    thinking_blocks += 1;
                    thinking_bytes += block
                        .get("thinking")
                        .and_then(serde_json::Value::as_str)
                        .map_or(0, str::len);
                    signature_bytes += block
                        .get("signature")
                        .and_then(serde_json::Value::as_str)
                        .map_or(0, str::len);
                }
                "tool_result" => {
                    let bytes = block_bytes(&block);
                    tool_result_bytes += bytes;
                    if bytes > OVERSIZED_RESULT_BYTES {
                        oversized_tool_results += 1;
                    }
                }
                _ => {}
            }
            let text = block_text(&block);
            if !text.is_empty() {
                system_reminders += REMINDER_RE.find_iter(&text).count();
            }
        }
    }

    heaviest.sort_by(|a, b| b.bytes.cmp(&a.bytes));
    heaviest.truncate(HEAVIEST_COUNT);

    Diagnosis {
        total_bytes: total_bytes(records),
        total_records: records.len(),
        tokens: tokens::estimate(records),
        by_kind,
        heaviest,
        progress_ticks,
        file_history_snapshots,
        system_reminders,
        thinking_blocks,
        thinking_bytes,
        signature_bytes,
        oversized_tool_results,
        tool_result_bytes,
    }
}

/// Projected savings of each prescription, measured by actually running it
/// against a copy of the sequence.
pub fn projected_savings(records: &[Record], config: &StrategyConfig) -> Vec<(Prescription, i64)> {
    Prescription::ALL
        .iter()
        .map(|&rx| {
            let (_, outcome) = run_prescription(records.to_vec(), rx, config);
            (rx, outcome.bytes_saved())
        })
        .collect()
}
