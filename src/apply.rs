//! Deterministic applier: folds strategy actions into a new record
//! sequence and attributes savings per strategy.
//!
//! The applier is where invariants are enforced rather than trusted:
//! identifier preservation, protected kinds, and non-overlapping spans. A
//! violating action is a strategy bug — it is dropped with a warning and
//! the pipeline continues.

use std::collections::HashSet;

use serde_json::Value;

use crate::record::{total_bytes, Record, RecordKind};
use crate::strategy::{Action, Prescription, StrategyConfig, StrategyInfo, StrategyResult};

/// What actually happened when one strategy's actions were folded in.
#[derive(Debug, Clone)]
pub struct StrategyReport {
    pub name: &'static str,
    pub actions_applied: usize,
    pub removed: usize,
    pub modified: usize,
    /// Measured delta for this strategy alone: serialized bytes before
    /// minus after. Negative when a rewrite grew the sequence.
    pub bytes_saved: i64,
    pub summary: String,
    pub warnings: Vec<String>,
}

/// Aggregate result of a full prescription run.
#[derive(Debug, Clone)]
pub struct PrescriptionOutcome {
    pub prescription: &'static str,
    pub strategies: Vec<StrategyReport>,
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub records_before: usize,
    pub records_after: usize,
    /// Surviving records whose parent was dropped.
    pub orphans: usize,
}

impl PrescriptionOutcome {
    pub fn bytes_saved(&self) -> i64 {
        self.bytes_before as i64 - self.bytes_after as i64
    }

    pub fn removed(&self) -> usize {
        self.strategies.iter().map(|s| s.removed).sum()
    }

    pub fn modified(&self) -> usize {
        self.strategies.iter().map(|s| s.modified).sum()
    }

    pub fn total_actions(&self) -> usize {
        self.strategies.iter().map(|s| s.actions_applied).sum()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.strategies
            .iter()
            .flat_map(|s| s.warnings.iter().map(String::as_str))
    }
}

fn identifiers_match(original: &Record, replacement: &Value) -> bool {
    replacement.get("uuid") == original.value().get("uuid")
        && replacement.get("parentUuid") == original.value().get("parentUuid")
}

/// Validate one strategy's actions against the current sequence. Returns
/// the accepted actions plus warnings for everything discarded.
fn vet_actions(records: &[Record], result: &StrategyResult) -> (Vec<Action>, Vec<String>) {
    let mut accepted: Vec<Action> = Vec::with_capacity(result.actions.len());
    let mut accepted_spans: Vec<(usize, usize)> = Vec::new();
    let mut warnings = Vec::new();

    let find = |index: usize| records.binary_search_by_key(&index, |r| r.line_index).ok();

    for action in &result.actions {
        let (first, last) = action.span();
        if first > last {
            warnings.push(format!("{}: inverted span {first}..{last} dropped", result.name));
            continue;
        }
        if accepted_spans.iter().any(|&(a, b)| first <= b && last >= a) {
            warnings.push(format!(
                "{}: overlapping action at {first}..{last} dropped",
                result.name
            ));
            continue;
        }

        let ok = match action {
            Action::Drop { index, .. } => match find(*index) {
                Some(pos) => {
                    let kind = records[pos].kind();
                    if kind.is_protected() {
                        warnings.push(format!(
                            "{}: refused to drop protected {} record at {index}",
                            result.name,
                            kind.label()
                        ));
                        false
                    } else if kind == RecordKind::Unknown {
                        warnings.push(format!(
                            "{}: refused to drop unparsed record at {index}",
                            result.name
                        ));
                        false
                    } else {
                        true
                    }
                }
                None => false,
            },
            Action::Replace { index, value, .. } => match find(*index) {
                Some(pos) => {
                    if records[pos].kind() == RecordKind::Unknown {
                        warnings.push(format!(
                            "{}: refused to rewrite unparsed record at {index}",
                            result.name
                        ));
                        false
                    } else if !identifiers_match(&records[pos], value) {
                        warnings.push(format!(
                            "{}: replacement at {index} altered identifiers, dropped",
                            result.name
                        ));
                        false
                    } else {
                        true
                    }
                }
                None => false,
            },
            Action::ReplaceRange { first, last, value, .. } => {
                let Some(first_pos) = find(*first) else {
                    warnings.push(format!(
                        "{}: range start {first} not found, dropped",
                        result.name
                    ));
                    continue;
                };
                let covered: Vec<&Record> = records[first_pos..]
                    .iter()
                    .take_while(|r| r.line_index <= *last)
                    .collect();
                if covered
                    .iter()
                    .any(|r| r.kind().is_protected() || r.kind() == RecordKind::Unknown)
                {
                    warnings.push(format!(
                        "{}: range {first}..{last} covers a protected record, dropped",
                        result.name
                    ));
                    false
                } else if !identifiers_match(&records[first_pos], value) {
                    warnings.push(format!(
                        "{}: range replacement at {first} altered identifiers, dropped",
                        result.name
                    ));
                    false
                } else {
                    true
                }
            }
        };

        if ok {
            accepted_spans.push((first, last));
            accepted.push(action.clone());
        }
    }

    (accepted, warnings)
}

/// Fold accepted actions into a new sequence. Actions are applied in
/// descending span order so earlier splices never shift later targets.
fn fold_actions(mut records: Vec<Record>, mut actions: Vec<Action>) -> Vec<Record> {
    actions.sort_by_key(|a| std::cmp::Reverse(a.span().0));

    for action in actions {
        match action {
            Action::Drop { index, .. } => {
                if let Ok(pos) = records.binary_search_by_key(&index, |r| r.line_index) {
                    records.remove(pos);
                }
            }
            Action::Replace { index, value, .. } => {
                if let Ok(pos) = records.binary_search_by_key(&index, |r| r.line_index) {
                    records[pos] = Record::from_value(index, value);
                }
            }
            Action::ReplaceRange { first, last, value, .. } => {
                if let Ok(start) = records.binary_search_by_key(&first, |r| r.line_index) {
                    let mut end = start;
                    while end < records.len() && records[end].line_index <= last {
                        end += 1;
                    }
                    records.splice(start..end, [Record::from_value(first, value)]);
                }
            }
        }
    }
    records
}

/// Run one strategy over the sequence and fold its surviving actions in.
pub fn apply_strategy(
    records: Vec<Record>,
    info: &StrategyInfo,
    config: &StrategyConfig,
) -> (Vec<Record>, StrategyReport) {
    let result = (info.run)(&records, config);
    apply_result(records, &result)
}

/// Fold an already-computed strategy result into the sequence.
pub fn apply_result(records: Vec<Record>, result: &StrategyResult) -> (Vec<Record>, StrategyReport) {
    let bytes_before = total_bytes(&records);

    let (accepted, warnings) = vet_actions(&records, result);
    let accepted_count = accepted.len();
    let dropped_count = result.actions.len() - accepted_count;
    let records = fold_actions(records, accepted);
    let bytes_after = total_bytes(&records);

    // Recount against what was actually applied, not what the strategy
    // hoped for.
    let (removed, modified) = if dropped_count == 0 {
        (result.removed, result.modified)
    } else {
        (result.removed.saturating_sub(dropped_count), result.modified)
    };

    let report = StrategyReport {
        name: result.name,
        actions_applied: accepted_count,
        removed,
        modified,
        bytes_saved: bytes_before as i64 - bytes_after as i64,
        summary: result.summary.clone(),
        warnings,
    };
    (records, report)
}

/// Run an ordered strategy list, each strategy seeing the output of the
/// previous, so per-strategy savings sum cleanly to the total.
pub fn run_strategies(
    records: Vec<Record>,
    prescription: Prescription,
    strategies: &[StrategyInfo],
    config: &StrategyConfig,
) -> (Vec<Record>, PrescriptionOutcome) {
    let bytes_before = total_bytes(&records);
    let records_before = records.len();
    let input_uuids: HashSet<String> = records
        .iter()
        .filter_map(|r| r.uuid().map(str::to_string))
        .collect();

    let mut current = records;
    let mut reports = Vec::with_capacity(strategies.len());
    for info in strategies {
        let (next, report) = apply_strategy(current, info, config);
        current = next;
        reports.push(report);
    }

    let surviving_uuids: HashSet<&str> = current.iter().filter_map(Record::uuid).collect();
    let orphans = current
        .iter()
        .filter_map(Record::parent_uuid)
        .filter(|p| !surviving_uuids.contains(p) && input_uuids.contains(*p))
        .count();

    let outcome = PrescriptionOutcome {
        prescription: prescription.name(),
        strategies: reports,
        bytes_before,
        bytes_after: total_bytes(&current),
        records_before,
        records_after: current.len(),
        orphans,
    };
    (current, outcome)
}

/// Run a full prescription.
pub fn run_prescription(
    records: Vec<Record>,
    prescription: Prescription,
    config: &StrategyConfig,
) -> (Vec<Record>, PrescriptionOutcome) {
    run_strategies(records, prescription, prescription.strategies(), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::find_strategy;
    use serde_json::json;

    fn rec(index: usize, json: Value) -> Record {
        Record::from_line(index, &json.to_string())
    }

    fn user(index: usize, text: &str) -> Record {
        rec(
            index,
            json!({
                "type": "user",
                "uuid": format!("u{index}"),
                "parentUuid": if index == 0 { Value::Null } else { Value::from(format!("u{}", index - 1)) },
                "message": {"role": "user", "content": text},
            }),
        )
    }

    fn tick(index: usize) -> Record {
        rec(
            index,
            json!({
                "type": "progress",
                "uuid": format!("u{index}"),
                "parentUuid": format!("u{}", index.saturating_sub(1)),
                "message": {"content": [{"type": "text", "text": format!("tick {index}")}]},
            }),
        )
    }

    #[test]
    fn fold_drop_replace_and_range() {
        let records = vec![user(0, "a"), user(1, "b"), user(2, "c"), user(3, "d")];
        let mut replacement = records[1].value().clone();
        replacement["message"]["content"] = json!("B");
        let actions = vec![
            Action::Drop { index: 0, reason: "x".into() },
            Action::Replace { index: 1, value: replacement, reason: "x".into() },
        ];
        let folded = fold_actions(records, actions);
        assert_eq!(folded.len(), 3);
        assert_eq!(folded[0].line_index, 1);
        assert_eq!(folded[0].value()["message"]["content"], "B");
    }

    #[test]
    fn replace_range_collapses_span_under_first_index() {
        let records = vec![user(0, "a"), tick(1), tick(2), tick(3), user(4, "b")];
        let synthetic = {
            let mut v = records[1].value().clone();
            v["collapsedCount"] = json!(3);
            v
        };
        let actions = vec![Action::ReplaceRange {
            first: 1,
            last: 3,
            value: synthetic,
            reason: "x".into(),
        }];
        let folded = fold_actions(records, actions);
        assert_eq!(folded.len(), 3);
        assert_eq!(folded[1].line_index, 1);
        assert_eq!(folded[1].value()["collapsedCount"], 3);
        assert_eq!(folded[2].line_index, 4);
    }

    #[test]
    fn overlapping_actions_keep_the_earlier_listed_one() {
        let records = vec![user(0, "a"), tick(1), tick(2), user(3, "b")];
        let result = StrategyResult {
            name: "test",
            actions: vec![
                Action::Drop { index: 1, reason: "first".into() },
                Action::ReplaceRange {
                    first: 1,
                    last: 2,
                    value: records[1].value().clone(),
                    reason: "second overlaps".into(),
                },
            ],
            removed: 2,
            modified: 0,
            estimated_bytes_saved: 0,
            summary: String::new(),
        };
        let (accepted, warnings) = vet_actions(&records, &result);
        assert_eq!(accepted.len(), 1);
        assert!(matches!(accepted[0], Action::Drop { index: 1, .. }));
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("overlapping"));
    }

    #[test]
    fn protected_records_cannot_be_dropped() {
        let records = vec![rec(0, json!({"type": "summary", "summary": "s", "uuid": "u0"}))];
        let result = StrategyResult {
            name: "test",
            actions: vec![Action::Drop { index: 0, reason: "x".into() }],
            removed: 1,
            modified: 0,
            estimated_bytes_saved: 0,
            summary: String::new(),
        };
        let (accepted, warnings) = vet_actions(&records, &result);
        assert!(accepted.is_empty());
        assert!(warnings[0].contains("protected"));
    }

    #[test]
    fn replacement_may_not_alter_identifiers() {
        let records = vec![user(0, "a")];
        let mut forged = records[0].value().clone();
        forged["uuid"] = json!("someone-else");
        let result = StrategyResult {
            name: "test",
            actions: vec![Action::Replace { index: 0, value: forged, reason: "x".into() }],
            removed: 0,
            modified: 1,
            estimated_bytes_saved: 0,
            summary: String::new(),
        };
        let (accepted, warnings) = vet_actions(&records, &result);
        assert!(accepted.is_empty());
        assert!(warnings[0].contains("identifiers"));
    }

    #[test]
    fn unparsed_records_are_never_edited() {
        let records = vec![Record::from_line(0, "{broken json")];
        let result = StrategyResult {
            name: "test",
            actions: vec![Action::Drop { index: 0, reason: "x".into() }],
            removed: 1,
            modified: 0,
            estimated_bytes_saved: 0,
            summary: String::new(),
        };
        let (accepted, warnings) = vet_actions(&records, &result);
        assert!(accepted.is_empty());
        assert!(warnings[0].contains("unparsed"));
    }

    #[test]
    fn per_strategy_savings_sum_to_total() {
        let mut records: Vec<Record> = Vec::new();
        records.push(user(0, "start"));
        for i in 1..=20 {
            records.push(tick(i));
        }
        records.push(rec(
            21,
            json!({
                "type": "assistant",
                "uuid": "u21",
                "parentUuid": "u20",
                "costUSD": 1.5,
                "message": {
                    "role": "assistant",
                    "usage": {"input_tokens": 9},
                    "content": [{"type": "text", "text": "done"}],
                },
            }),
        ));

        let (_, outcome) =
            run_prescription(records, Prescription::Gentle, &StrategyConfig::default());
        let per_strategy: i64 = outcome.strategies.iter().map(|s| s.bytes_saved).sum();
        assert_eq!(per_strategy, outcome.bytes_saved());
        assert!(outcome.bytes_saved() > 0);
    }

    #[test]
    fn identifiers_survive_a_full_prescription() {
        let records = vec![user(0, "a"), tick(1), tick(2), user(3, "b")];
        let originals: Vec<(Option<String>, Option<String>)> = records
            .iter()
            .map(|r| {
                (
                    r.uuid().map(str::to_string),
                    r.parent_uuid().map(str::to_string),
                )
            })
            .collect();
        let (out, _) =
            run_prescription(records, Prescription::Aggressive, &StrategyConfig::default());
        for record in &out {
            let pair = (
                record.uuid().map(str::to_string),
                record.parent_uuid().map(str::to_string),
            );
            assert!(
                originals.contains(&pair),
                "record {} carries identifiers not present in the input",
                record.line_index
            );
        }
    }

    #[test]
    fn prescription_runs_are_idempotent() {
        let mut records: Vec<Record> = vec![user(0, "hello")];
        for i in 1..=10 {
            records.push(tick(i));
        }
        records.push(user(11, "bye"));

        let config = StrategyConfig::default();
        for rx in Prescription::ALL {
            let (once, first) = run_prescription(records.clone(), rx, &config);
            let (twice, second) = run_prescription(once.clone(), rx, &config);
            assert_eq!(second.total_actions(), 0, "{} rerun produced actions", rx.name());
            assert_eq!(second.bytes_saved(), 0);
            assert_eq!(once.len(), twice.len());
            assert!(first.bytes_saved() >= 0);
        }
    }

    #[test]
    fn orphan_diagnostic_counts_dropped_parents() {
        // tick 1's child survives while tick 1 is collapsed away.
        let records = vec![
            user(0, "a"),
            tick(1),
            tick(2),
            rec(
                3,
                json!({
                    "type": "user",
                    "uuid": "u3",
                    "parentUuid": "u2",
                    "message": {"role": "user", "content": "child of the last tick"},
                }),
            ),
        ];
        let (_, outcome) =
            run_prescription(records, Prescription::Gentle, &StrategyConfig::default());
        // The collapse keeps u1 (first of the run); u2 is gone, so u3 is
        // orphaned and diagnosed.
        assert_eq!(outcome.orphans, 1);
    }

    #[test]
    fn summary_and_queue_records_always_survive() {
        let records = vec![
            rec(0, json!({"type": "summary", "summary": "the story so far", "uuid": "s0"})),
            user(1, "x"),
            rec(2, json!({"type": "queue-operation", "operation": "enqueue", "uuid": "q0"})),
            tick(3),
            tick(4),
        ];
        let (out, _) =
            run_prescription(records, Prescription::Aggressive, &StrategyConfig::default());
        let kinds: Vec<RecordKind> = out.iter().map(Record::kind).collect();
        assert!(kinds.contains(&RecordKind::Summary));
        assert!(kinds.contains(&RecordKind::QueueOperation));
    }

    #[test]
    fn single_strategy_can_run_standalone() {
        let records = vec![user(0, "a"), tick(1), tick(2)];
        let info = find_strategy("progress-collapse").unwrap();
        let (out, report) = apply_strategy(records, info, &StrategyConfig::default());
        assert_eq!(out.len(), 2);
        assert_eq!(report.actions_applied, 1);
        assert!(report.bytes_saved > 0);
    }
}
