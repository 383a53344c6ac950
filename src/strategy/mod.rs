//! Strategy catalog, declarative edit actions, and prescription definitions.
//!
//! Every strategy is a pure function `(records, config) -> StrategyResult`.
//! Strategies never mutate the input sequence; all edits are expressed as
//! [`Action`]s that the applier in [`crate::apply`] folds into a new
//! sequence. The catalog is an explicit static table — populated once at
//! compile time, never mutated at runtime.

mod aggressive;
mod gentle;
mod standard;

use serde_json::Value;

use crate::record::Record;

/// Risk tier of a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Gentle,
    Standard,
    Aggressive,
}

impl Tier {
    pub fn label(self) -> &'static str {
        match self {
            Tier::Gentle => "gentle",
            Tier::Standard => "standard",
            Tier::Aggressive => "aggressive",
        }
    }
}

/// A declarative edit produced by a strategy. Indices are original line
/// indices, which stay stable across the whole pipeline.
#[derive(Debug, Clone)]
pub enum Action {
    /// Remove the record entirely.
    Drop { index: usize, reason: String },
    /// Substitute a rewritten record. Must keep `uuid`/`parentUuid`.
    Replace {
        index: usize,
        value: Value,
        reason: String,
    },
    /// Collapse a contiguous run into one synthetic record carrying the
    /// first original's identifiers.
    ReplaceRange {
        first: usize,
        last: usize,
        value: Value,
        reason: String,
    },
}

impl Action {
    /// Span of line indices this action covers, inclusive.
    pub fn span(&self) -> (usize, usize) {
        match self {
            Action::Drop { index, .. } | Action::Replace { index, .. } => (*index, *index),
            Action::ReplaceRange { first, last, .. } => (*first, *last),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Action::Drop { reason, .. }
            | Action::Replace { reason, .. }
            | Action::ReplaceRange { reason, .. } => reason,
        }
    }
}

/// Result of running a single strategy over a record sequence.
#[derive(Debug, Clone)]
pub struct StrategyResult {
    pub name: &'static str,
    pub actions: Vec<Action>,
    pub removed: usize,
    pub modified: usize,
    /// The strategy's own estimate. The applier measures the real delta.
    pub estimated_bytes_saved: usize,
    pub summary: String,
}

impl StrategyResult {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            actions: Vec::new(),
            removed: 0,
            modified: 0,
            estimated_bytes_saved: 0,
            summary: String::new(),
        }
    }
}

/// How thinking blocks are handled by the `thinking-blocks` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingMode {
    #[default]
    Remove,
    Truncate,
    SignatureOnly,
}

impl ThinkingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "remove" => Some(ThinkingMode::Remove),
            "truncate" => Some(ThinkingMode::Truncate),
            "signature-only" => Some(ThinkingMode::SignatureOnly),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ThinkingMode::Remove => "remove",
            ThinkingMode::Truncate => "truncate",
            ThinkingMode::SignatureOnly => "signature-only",
        }
    }
}

/// Tunable knobs shared by the catalog. Defaults match the documented
/// trigger thresholds.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub thinking_mode: ThinkingMode,
    pub tool_output_max_bytes: usize,
    pub tool_output_max_lines: usize,
    pub tool_output_head_lines: usize,
    pub tool_output_tail_lines: usize,
    pub document_dedup_min_bytes: usize,
    pub mega_block_max_bytes: usize,
    pub mega_block_head_lines: usize,
    pub mega_block_tail_lines: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            thinking_mode: ThinkingMode::Remove,
            tool_output_max_bytes: 8 * 1024,
            tool_output_max_lines: 100,
            tool_output_head_lines: 50,
            tool_output_tail_lines: 20,
            document_dedup_min_bytes: 1024,
            mega_block_max_bytes: 32 * 1024,
            mega_block_head_lines: 80,
            mega_block_tail_lines: 30,
        }
    }
}

pub type StrategyFn = fn(&[Record], &StrategyConfig) -> StrategyResult;

/// Catalog entry: static metadata plus the strategy function.
pub struct StrategyInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub tier: Tier,
    /// Advisory label only — reports always show measured savings.
    pub expected_savings: &'static str,
    pub run: StrategyFn,
}

/// The full catalog, in prescription order. Whole-record removals come
/// before block rewrites so the block rules see the final record set;
/// `envelope-strip` runs last because it observes all surviving records.
pub static STRATEGIES: &[StrategyInfo] = &[
    StrategyInfo {
        name: "progress-collapse",
        description: "Collapse consecutive progress tick records into one",
        tier: Tier::Gentle,
        expected_savings: "40-48%",
        run: gentle::progress_collapse,
    },
    StrategyInfo {
        name: "file-history-dedup",
        description: "Drop file-history snapshots with duplicate payloads, keeping the last",
        tier: Tier::Gentle,
        expected_savings: "3-6%",
        run: gentle::file_history_dedup,
    },
    StrategyInfo {
        name: "metadata-strip",
        description: "Strip token usage, stop reason, and cost telemetry fields",
        tier: Tier::Gentle,
        expected_savings: "1-3%",
        run: gentle::metadata_strip,
    },
    StrategyInfo {
        name: "thinking-blocks",
        description: "Remove, truncate, or de-sign thinking blocks",
        tier: Tier::Standard,
        expected_savings: "2-5%",
        run: standard::thinking_blocks,
    },
    StrategyInfo {
        name: "tool-output-trim",
        description: "Trim tool results over 8KB or 100 lines to a head/tail window",
        tier: Tier::Standard,
        expected_savings: "1-8%",
        run: standard::tool_output_trim,
    },
    StrategyInfo {
        name: "stale-reads",
        description: "Drop file reads superseded by a later edit of the same path",
        tier: Tier::Standard,
        expected_savings: "0.5-2%",
        run: standard::stale_reads,
    },
    StrategyInfo {
        name: "system-reminder-dedup",
        description: "Keep the first occurrence of each system-reminder, drop repeats",
        tier: Tier::Standard,
        expected_savings: "0.1-3%",
        run: standard::system_reminder_dedup,
    },
    StrategyInfo {
        name: "http-spam",
        description: "Collapse runs of web fetch/search traffic",
        tier: Tier::Aggressive,
        expected_savings: "0-2%",
        run: aggressive::http_spam,
    },
    StrategyInfo {
        name: "error-retry-collapse",
        description: "Collapse identical failing retries into one summary record",
        tier: Tier::Aggressive,
        expected_savings: "0-5%",
        run: aggressive::error_retry_collapse,
    },
    StrategyInfo {
        name: "background-poll-collapse",
        description: "Collapse consecutive background status polls",
        tier: Tier::Aggressive,
        expected_savings: "0-1%",
        run: aggressive::background_poll_collapse,
    },
    StrategyInfo {
        name: "document-dedup",
        description: "Replace repeated large document blocks with a stub",
        tier: Tier::Aggressive,
        expected_savings: "0-44%",
        run: aggressive::document_dedup,
    },
    StrategyInfo {
        name: "mega-block-trim",
        description: "Safety net: trim any remaining content block over 32KB",
        tier: Tier::Aggressive,
        expected_savings: "safety net",
        run: aggressive::mega_block_trim,
    },
    StrategyInfo {
        name: "envelope-strip",
        description: "Hoist constant envelope fields into a single header record",
        tier: Tier::Aggressive,
        expected_savings: "2-4%",
        run: aggressive::envelope_strip,
    },
];

pub fn find_strategy(name: &str) -> Option<&'static StrategyInfo> {
    STRATEGIES.iter().find(|s| s.name == name)
}

/// A named, ordered list of strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prescription {
    Gentle,
    Standard,
    Aggressive,
}

impl Prescription {
    pub const ALL: [Prescription; 3] = [
        Prescription::Gentle,
        Prescription::Standard,
        Prescription::Aggressive,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gentle" => Some(Prescription::Gentle),
            "standard" => Some(Prescription::Standard),
            "aggressive" => Some(Prescription::Aggressive),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Prescription::Gentle => "gentle",
            Prescription::Standard => "standard",
            Prescription::Aggressive => "aggressive",
        }
    }

    /// Strategies in execution order. Each tier is a superset of the one
    /// below it, so the catalog order is the prescription order.
    pub fn strategies(self) -> &'static [StrategyInfo] {
        match self {
            Prescription::Gentle => &STRATEGIES[..3],
            Prescription::Standard => &STRATEGIES[..7],
            Prescription::Aggressive => STRATEGIES,
        }
    }
}

/// Marker appended by every trimming strategy so that later block rules
/// (and reruns) can tell an already-trimmed payload from a fresh one.
pub const TRIM_ANNOTATION_KEY: &str = "trimmedBytes";

/// Key that marks a synthetic collapse record and carries the run length.
pub const COLLAPSED_COUNT_KEY: &str = "collapsedCount";

/// Truncate at a UTF-8 boundary at or below `max`.
pub(crate) fn floor_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Find the lowest UTF-8 boundary at or above `min`.
pub(crate) fn ceil_boundary(s: &str, min: usize) -> usize {
    if min >= s.len() {
        return s.len();
    }
    let mut idx = min;
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Head/tail window over a text payload. Falls back to a byte window when
/// the text has too few lines for a line window to shrink anything.
pub(crate) fn head_tail_trim(
    text: &str,
    head_lines: usize,
    tail_lines: usize,
    max_bytes: usize,
) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() > head_lines + tail_lines {
        let trimmed_count = lines.len() - head_lines - tail_lines;
        let mut out: Vec<&str> = Vec::with_capacity(head_lines + tail_lines + 1);
        out.extend(&lines[..head_lines]);
        let marker = format!("... [{trimmed_count} lines trimmed by slimline] ...");
        let mut joined = out.join("\n");
        joined.push('\n');
        joined.push_str(&marker);
        joined.push('\n');
        joined.push_str(&lines[lines.len() - tail_lines..].join("\n"));
        joined
    } else {
        let head = floor_boundary(text, max_bytes / 2);
        let tail = ceil_boundary(text, text.len().saturating_sub(max_bytes / 4));
        format!(
            "{}\n... [{} bytes trimmed by slimline] ...\n{}",
            &text[..head],
            text.len().saturating_sub(head + (text.len() - tail)),
            &text[tail..]
        )
    }
}
