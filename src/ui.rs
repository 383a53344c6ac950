//! Terminal reports for diagnosis and treatment results.

use console::style;

use crate::apply::PrescriptionOutcome;
use crate::diagnosis::Diagnosis;
use crate::tokens::TokenEstimate;

pub fn fmt_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.2}MB", bytes as f64 / 1024.0 / 1024.0)
    }
}

pub fn fmt_signed_bytes(bytes: i64) -> String {
    if bytes < 0 {
        format!("-{}", fmt_bytes(bytes.unsigned_abs()))
    } else {
        fmt_bytes(bytes as u64)
    }
}

pub fn fmt_tokens(tokens: u64) -> String {
    if tokens < 1_000 {
        tokens.to_string()
    } else if tokens < 1_000_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        format!("{:.2}M", tokens as f64 / 1_000_000.0)
    }
}

pub fn fmt_pct(part: i64, total: u64) -> String {
    if total == 0 {
        return "0%".to_string();
    }
    format!("{:.1}%", part as f64 / total as f64 * 100.0)
}

/// Fixed-width usage gauge, e.g. `[========------------] 40%`.
pub fn context_bar(pct: f64, width: usize) -> String {
    let filled = ((pct / 100.0 * width as f64).round() as usize).min(width);
    format!("[{}{}] {pct:.0}%", "=".repeat(filled), "-".repeat(width - filled))
}

pub fn print_token_line(estimate: &TokenEstimate) {
    println!(
        "  Tokens:  {} ({})",
        fmt_tokens(estimate.total),
        estimate.method.label()
    );
    println!("  Context: {}", context_bar(estimate.context_pct, 20));
}

pub fn print_diagnosis(diag: &Diagnosis, session_name: &str) {
    println!();
    println!("  Patient: {}", style(session_name).bold());
    println!(
        "  Weight:  {} ({} records)",
        fmt_bytes(diag.total_bytes as u64),
        diag.total_records
    );
    print_token_line(&diag.tokens);
    println!();

    println!("  Vital signs:");
    println!("    Progress ticks:     {:>8}", diag.progress_ticks);
    println!("    File history snaps: {:>8}", diag.file_history_snapshots);
    println!("    System reminders:   {:>8}", diag.system_reminders);
    println!(
        "    Thinking blocks:    {:>8}  ({}, signatures {})",
        diag.thinking_blocks,
        fmt_bytes(diag.thinking_bytes as u64),
        fmt_bytes(diag.signature_bytes as u64)
    );
    println!(
        "    Oversized results:  {:>8}  (tool results total {})",
        diag.oversized_tool_results,
        fmt_bytes(diag.tool_result_bytes as u64)
    );
    println!();

    println!("  Breakdown by kind:");
    let mut kinds: Vec<_> = diag.by_kind.iter().collect();
    kinds.sort_by(|a, b| b.1.bytes.cmp(&a.1.bytes));
    for (label, stats) in kinds {
        println!(
            "    {label:<24} {:>6} records  {:>10}  ({})",
            stats.count,
            fmt_bytes(stats.bytes as u64),
            fmt_pct(stats.bytes as i64, diag.total_bytes as u64)
        );
    }
    println!();

    println!("  Heaviest records:");
    for heavy in &diag.heaviest {
        println!(
            "    line {:<7} {:<22} {:>10}",
            heavy.line_index,
            heavy.kind.label(),
            fmt_bytes(heavy.bytes as u64)
        );
    }
    println!();
}

pub fn print_outcome(outcome: &PrescriptionOutcome, before_tokens: &TokenEstimate, after_tokens: &TokenEstimate) {
    let saved = outcome.bytes_saved();
    println!();
    println!("  Prescription: {}", style(outcome.prescription).bold());
    println!(
        "  Before: {} ({} records)",
        fmt_bytes(outcome.bytes_before as u64),
        outcome.records_before
    );
    println!(
        "  After:  {} ({} records)",
        fmt_bytes(outcome.bytes_after as u64),
        outcome.records_after
    );
    println!(
        "  Saved:  {} ({}) — {} removed, {} modified",
        style(fmt_signed_bytes(saved)).green(),
        fmt_pct(saved, outcome.bytes_before as u64),
        outcome.removed(),
        outcome.modified()
    );
    let token_delta = before_tokens.total as i64 - after_tokens.total as i64;
    println!(
        "  Tokens: {} -> {} ({} freed, {})",
        fmt_tokens(before_tokens.total),
        fmt_tokens(after_tokens.total),
        fmt_tokens(token_delta.max(0) as u64),
        before_tokens.method.label()
    );
    println!();

    println!("  Strategy results:");
    for report in &outcome.strategies {
        println!(
            "    {:<26} {:>10} saved  ({})  {}",
            report.name,
            fmt_signed_bytes(report.bytes_saved),
            fmt_pct(report.bytes_saved, outcome.bytes_before as u64),
            report.summary
        );
    }
    for warning in outcome.warnings() {
        println!("    {} {}", style("warning:").yellow(), warning);
    }
    if outcome.orphans > 0 {
        println!(
            "    {} {} surviving records reference dropped parents",
            style("note:").dim(),
            outcome.orphans
        );
    }
    println!();
}

pub fn print_dry_run_hint() {
    println!(
        "  {} no changes made. Use --execute to apply.",
        style("DRY RUN —").bold()
    );
    println!();
}
