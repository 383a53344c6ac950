//! Session listing, current-session lookup, and diagnosis commands.

use anyhow::Result;

use slimline::diagnosis::{diagnose, projected_savings};
use slimline::errors::SessionError;
use slimline::session::{find_current_session, find_sessions, load_session, resolve_session};
use slimline::strategy::StrategyConfig;
use slimline::tokens::quick_estimate;
use slimline::ui::{context_bar, fmt_bytes, fmt_pct, fmt_tokens, print_diagnosis};
use slimline::tokens::CONTEXT_WINDOW_TOKENS;

pub fn cmd_list(project: Option<&str>) -> Result<()> {
    let mut sessions = find_sessions(project);
    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }
    sessions.sort_by(|a, b| b.size.cmp(&a.size));

    println!();
    println!(
        "  {:<38} {:>10} {:>8} {:>8} {:<17} Project",
        "Session ID", "Size", "Tokens", "Records", "Modified"
    );
    for entry in &sessions {
        let tokens = quick_estimate(&entry.path)
            .map(fmt_tokens)
            .unwrap_or_else(|| "-".to_string());
        let project_tail: String = entry
            .project
            .chars()
            .rev()
            .take(40)
            .collect::<String>()
            .chars()
            .rev()
            .collect();
        println!(
            "  {:<38} {:>10} {:>8} {:>8} {:<17} {}",
            entry.session_id,
            fmt_bytes(entry.size),
            tokens,
            entry.lines,
            entry.modified.format("%Y-%m-%d %H:%M"),
            project_tail
        );
    }
    println!();
    let total: u64 = sessions.iter().map(|s| s.size).sum();
    println!("  Total: {} sessions, {}", sessions.len(), fmt_bytes(total));
    println!();
    Ok(())
}

pub fn cmd_current(run_diagnosis: bool) -> Result<()> {
    let entry = find_current_session(None).ok_or(SessionError::NoCurrentSession)?;

    println!();
    println!("  Current session:");
    println!("    ID:       {}", entry.session_id);
    println!("    Size:     {} ({} records)", fmt_bytes(entry.size), entry.lines);
    if let Some(tokens) = quick_estimate(&entry.path) {
        let pct = tokens as f64 / CONTEXT_WINDOW_TOKENS as f64 * 100.0;
        println!("    Tokens:   {} {}", fmt_tokens(tokens), context_bar(pct, 20));
    }
    println!("    Project:  {}", entry.project);
    println!("    Path:     {}", entry.path.display());
    println!("    Modified: {}", entry.modified.format("%Y-%m-%d %H:%M:%S"));
    println!();

    if run_diagnosis {
        diagnose_and_print(&entry.path, &entry.session_id)?;
    }
    Ok(())
}

pub fn cmd_diagnose(session: &str) -> Result<()> {
    let path = resolve_session(session, None)?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    diagnose_and_print(&path, &name)
}

fn diagnose_and_print(path: &std::path::Path, name: &str) -> Result<()> {
    let (records, parse_warnings) = load_session(path)?;
    if parse_warnings > 0 {
        eprintln!("  warning: {parse_warnings} unparseable lines preserved verbatim");
    }
    let diag = diagnose(&records);
    print_diagnosis(&diag, name);

    println!("  Estimated savings by prescription:");
    for (rx, saved) in projected_savings(&records, &StrategyConfig::default()) {
        println!(
            "    {:<12} ~{:>10} ({})",
            rx.name(),
            fmt_bytes(saved.max(0) as u64),
            fmt_pct(saved, diag.total_bytes as u64)
        );
    }
    println!();
    Ok(())
}
