//! Health checks for the slimline installation and its surroundings.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use glob::glob;

use slimline::process::pid_alive;
use slimline::session::{find_sessions, projects_dir};
use slimline::ui::fmt_bytes;

/// Backups older than this are fair game for `--fix`.
const BACKUP_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Sessions above this size get flagged.
const OVERSIZED_SESSION_BYTES: u64 = 50 * 1024 * 1024;

enum Status {
    Ok,
    Warning,
    Issue,
    Fixed,
}

struct CheckResult {
    name: &'static str,
    status: Status,
    message: String,
    fix_hint: Option<String>,
}

pub fn cmd_doctor(fix: bool) -> Result<()> {
    let results = vec![
        check_projects_dir(),
        check_stale_locks(fix),
        check_backups(fix),
        check_oversized_sessions(),
    ];

    println!();
    println!("  SLIMLINE DOCTOR");
    println!();

    let mut issues = 0;
    let mut warnings = 0;
    let mut fixed = 0;
    for result in &results {
        let icon = match result.status {
            Status::Ok => "ok",
            Status::Warning => "warn",
            Status::Issue => "FAIL",
            Status::Fixed => "fixed",
        };
        println!("    [{icon:>5}] {}", result.name);
        println!("            {}", result.message);
        if let Some(hint) = &result.fix_hint {
            println!("            Fix: {hint}");
        }
        match result.status {
            Status::Issue => issues += 1,
            Status::Warning => warnings += 1,
            Status::Fixed => fixed += 1,
            Status::Ok => {}
        }
    }
    println!();

    if fixed > 0 {
        println!("  Summary: {fixed} item(s) fixed");
    } else if issues + warnings > 0 {
        println!("  Summary: {issues} issue(s), {warnings} warning(s)");
        if !fix {
            println!("  Run 'slimline doctor --fix' to auto-fix where possible.");
        }
    } else {
        println!("  All clear.");
    }
    println!();
    Ok(())
}

fn check_projects_dir() -> CheckResult {
    let dir = projects_dir();
    if dir.is_dir() {
        CheckResult {
            name: "projects directory",
            status: Status::Ok,
            message: format!("{} exists", dir.display()),
            fix_hint: None,
        }
    } else {
        CheckResult {
            name: "projects directory",
            status: Status::Issue,
            message: format!("{} not found — has the host agent run here?", dir.display()),
            fix_hint: Some("start a host-agent session to create it".to_string()),
        }
    }
}

fn stale_lock_files() -> Vec<PathBuf> {
    let pattern = std::env::temp_dir().join("slimline_guard_*.pid");
    let Ok(paths) = glob(&pattern.to_string_lossy()) else {
        return Vec::new();
    };
    paths
        .flatten()
        .filter(|path| {
            fs::read_to_string(path)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok())
                .map(|pid| !pid_alive(pid))
                .unwrap_or(true)
        })
        .collect()
}

fn check_stale_locks(fix: bool) -> CheckResult {
    let stale = stale_lock_files();
    if stale.is_empty() {
        return CheckResult {
            name: "guard locks",
            status: Status::Ok,
            message: "no stale guard lock files".to_string(),
            fix_hint: None,
        };
    }
    if fix {
        for path in &stale {
            let _ = fs::remove_file(path);
        }
        return CheckResult {
            name: "guard locks",
            status: Status::Fixed,
            message: format!("removed {} stale lock file(s)", stale.len()),
            fix_hint: None,
        };
    }
    CheckResult {
        name: "guard locks",
        status: Status::Warning,
        message: format!("{} lock file(s) from dead guards", stale.len()),
        fix_hint: Some("slimline doctor --fix".to_string()),
    }
}

fn check_backups(fix: bool) -> CheckResult {
    let pattern = projects_dir().join("*").join("*.jsonl.bak");
    let backups: Vec<PathBuf> = glob(&pattern.to_string_lossy())
        .map(|paths| paths.flatten().collect())
        .unwrap_or_default();
    if backups.is_empty() {
        return CheckResult {
            name: "backups",
            status: Status::Ok,
            message: "no treatment backups on disk".to_string(),
            fix_hint: None,
        };
    }

    let now = SystemTime::now();
    let old: Vec<&PathBuf> = backups
        .iter()
        .filter(|path| {
            path.metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| now.duration_since(t).ok())
                .is_some_and(|age| age > BACKUP_MAX_AGE)
        })
        .collect();

    if fix && !old.is_empty() {
        for path in &old {
            let _ = fs::remove_file(path);
        }
        return CheckResult {
            name: "backups",
            status: Status::Fixed,
            message: format!("removed {} backup(s) older than 7 days", old.len()),
            fix_hint: None,
        };
    }

    let total: u64 = backups.iter().filter_map(|p| p.metadata().ok()).map(|m| m.len()).sum();
    CheckResult {
        name: "backups",
        status: if old.is_empty() { Status::Ok } else { Status::Warning },
        message: format!(
            "{} backup(s) on disk ({}), {} older than 7 days",
            backups.len(),
            fmt_bytes(total),
            old.len()
        ),
        fix_hint: (!old.is_empty()).then(|| "slimline doctor --fix".to_string()),
    }
}

fn check_oversized_sessions() -> CheckResult {
    let oversized: Vec<String> = find_sessions(None)
        .into_iter()
        .filter(|s| s.size > OVERSIZED_SESSION_BYTES)
        .map(|s| format!("{} ({})", s.session_id, fmt_bytes(s.size)))
        .collect();
    if oversized.is_empty() {
        CheckResult {
            name: "session sizes",
            status: Status::Ok,
            message: "no sessions above the default hard threshold".to_string(),
            fix_hint: None,
        }
    } else {
        CheckResult {
            name: "session sizes",
            status: Status::Warning,
            message: format!("oversized: {}", oversized.join(", ")),
            fix_hint: Some("slimline treat <session> --execute".to_string()),
        }
    }
}
