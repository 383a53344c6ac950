//! Treatment commands: full prescriptions, single strategies, and the
//! formulary listing.

use anyhow::Result;

use slimline::apply::{apply_result, run_prescription};
use slimline::errors::PipelineError;
use slimline::session::{load_session, resolve_session, save_session};
use slimline::strategy::{
    find_strategy, Prescription, StrategyConfig, ThinkingMode, STRATEGIES,
};
use slimline::tokens;
use slimline::ui::{fmt_bytes, fmt_signed_bytes, print_dry_run_hint, print_outcome};

pub fn parse_prescription(rx: Option<&str>) -> Result<Prescription> {
    match rx {
        None => Ok(Prescription::Standard),
        Some(name) => Prescription::parse(name)
            .ok_or_else(|| PipelineError::UnknownPrescription(name.to_string()).into()),
    }
}

pub fn build_config(thinking_mode: Option<&str>) -> Result<StrategyConfig> {
    let mut config = StrategyConfig::default();
    if let Some(mode) = thinking_mode {
        config.thinking_mode = ThinkingMode::parse(mode)
            .ok_or_else(|| PipelineError::UnknownThinkingMode(mode.to_string()))?;
    }
    Ok(config)
}

pub fn cmd_treat(
    session: &str,
    rx: Option<&str>,
    execute: bool,
    thinking_mode: Option<&str>,
) -> Result<()> {
    let prescription = parse_prescription(rx)?;
    let config = build_config(thinking_mode)?;
    let path = resolve_session(session, None)?;

    let (records, parse_warnings) = load_session(&path)?;
    if parse_warnings > 0 {
        eprintln!("  warning: {parse_warnings} unparseable lines preserved verbatim");
    }

    let before_tokens = tokens::estimate(&records);
    let (pruned, outcome) = run_prescription(records, prescription, &config);
    let after_tokens = tokens::estimate(&pruned);
    print_outcome(&outcome, &before_tokens, &after_tokens);

    if execute {
        let backup = save_session(&path, &pruned, true)?;
        println!("  Treatment applied to {}", path.display());
        if let Some(backup) = backup {
            println!("  Backup: {}", backup.display());
        }
        println!("  Final size: {}", fmt_bytes(outcome.bytes_after as u64));
        println!();
    } else {
        print_dry_run_hint();
    }
    Ok(())
}

pub fn cmd_strategy(
    name: &str,
    session: &str,
    verbose: bool,
    execute: bool,
    thinking_mode: Option<&str>,
) -> Result<()> {
    let info =
        find_strategy(name).ok_or_else(|| PipelineError::UnknownStrategy(name.to_string()))?;
    let config = build_config(thinking_mode)?;
    let path = resolve_session(session, None)?;
    let (records, _) = load_session(&path)?;

    let result = (info.run)(&records, &config);
    println!();
    println!("  Strategy: {} ({})", result.name, info.tier.label());
    println!(
        "  Actions:  {} ({} removed, {} modified)",
        result.actions.len(),
        result.removed,
        result.modified
    );
    println!("  Estimate: {} saved", fmt_bytes(result.estimated_bytes_saved as u64));
    println!("  Summary:  {}", result.summary);
    println!();

    if verbose {
        for action in result.actions.iter().take(20) {
            let (first, last) = action.span();
            let span = if first == last {
                format!("line {first}")
            } else {
                format!("lines {first}-{last}")
            };
            println!("    {span:<16} {}", action.reason());
        }
        if result.actions.len() > 20 {
            println!("    ... and {} more actions", result.actions.len() - 20);
        }
        println!();
    }

    if execute {
        let (pruned, report) = apply_result(records, &result);
        let backup = save_session(&path, &pruned, true)?;
        println!("  Applied: {} saved (measured)", fmt_signed_bytes(report.bytes_saved));
        for warning in &report.warnings {
            println!("  warning: {warning}");
        }
        if let Some(backup) = backup {
            println!("  Backup: {}", backup.display());
        }
        println!();
    } else {
        print_dry_run_hint();
    }
    Ok(())
}

pub fn cmd_formulary() -> Result<()> {
    println!();
    println!("  FORMULARY");
    println!();
    println!("  {:<4} {:<26} {:<12} {:>12}  Description", "#", "Name", "Tier", "Expected");
    for (i, info) in STRATEGIES.iter().enumerate() {
        println!(
            "  {:<4} {:<26} {:<12} {:>12}  {}",
            i + 1,
            info.name,
            info.tier.label(),
            info.expected_savings,
            info.description
        );
    }
    println!();

    println!("  Prescriptions:");
    for rx in Prescription::ALL {
        let names: Vec<&str> = rx.strategies().iter().map(|s| s.name).collect();
        println!(
            "    {:<12} [{} strategies] {}",
            rx.name(),
            names.len(),
            names.join(", ")
        );
    }
    println!();
    println!("  Expected-savings labels are advisory; every report shows measured savings.");
    println!();
    println!("  Usage:");
    println!("    slimline treat <session> -rx gentle       # safe, minimal pruning");
    println!("    slimline treat <session> -rx standard     # recommended (default)");
    println!("    slimline treat <session> -rx aggressive   # maximum savings");
    println!("    slimline treat <session> --execute        # apply (default is dry-run)");
    println!();
    Ok(())
}
