//! Guard, checkpoint, and reload commands.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use slimline::apply::run_prescription;
use slimline::breaker::CircuitBreaker;
use slimline::errors::{GuardError, SessionError};
use slimline::guard::{Guard, GuardConfig, lock_path_for};
use slimline::process::{pid_alive, spawn_resume_watcher};
use slimline::recap::save_recap;
use slimline::session::{
    find_current_session, find_host_pid, load_session, save_session, slug_to_path, teams_dir,
    SessionEntry,
};
use slimline::team::{extract_with_config, write_checkpoint};
use slimline::tokens;
use slimline::ui::{fmt_bytes, print_outcome};

use super::treat::{build_config, parse_prescription};

#[derive(Debug, Clone)]
pub struct GuardArgs {
    pub threshold_mb: f64,
    pub soft_threshold_mb: Option<f64>,
    pub threshold_tokens: Option<u64>,
    pub interval_secs: u64,
    pub rx: Option<String>,
    pub no_reload: bool,
    pub no_reactive: bool,
    pub daemon: bool,
}

fn current_session() -> Result<SessionEntry> {
    find_current_session(None).ok_or_else(|| SessionError::NoCurrentSession.into())
}

/// Resume in the real project directory when the slug decodes to one.
fn resume_dir_for(entry: &SessionEntry) -> String {
    let decoded = slug_to_path(&entry.project);
    if std::path::Path::new(&decoded).is_dir() {
        decoded
    } else {
        std::env::current_dir()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| ".".to_string())
    }
}

pub fn cmd_guard(args: &GuardArgs) -> Result<()> {
    let rx = parse_prescription(args.rx.as_deref())?;
    let entry = current_session()?;

    let mut config = GuardConfig::from_mb(
        args.threshold_mb,
        args.soft_threshold_mb,
        args.threshold_tokens,
        args.interval_secs,
        rx,
    );
    config.reload = !args.no_reload;
    config.reactive = !args.no_reactive;

    // A tripped breaker means a recent prune storm; refuse to start
    // another guard on this session until the window clears.
    let breaker = CircuitBreaker::new(
        &entry.session_id,
        config.breaker_max_events,
        config.breaker_window,
    );
    if breaker.tripped() {
        return Err(GuardError::BreakerTripped {
            events: breaker.count(),
            window_secs: breaker.window_secs(),
        }
        .into());
    }

    if args.daemon {
        return spawn_daemon(&entry);
    }

    println!();
    println!("  SLIMLINE GUARD");
    println!("  Session:      {}", entry.session_id);
    println!("  Size:         {}", fmt_bytes(entry.size));
    println!(
        "  Thresholds:   soft {} / hard {}{}",
        fmt_bytes(config.soft_bytes),
        fmt_bytes(config.hard_bytes),
        config
            .hard_tokens
            .map(|t| format!(" / {t} tokens"))
            .unwrap_or_default()
    );
    println!("  Rx:           {} (soft tier always gentle)", rx.name());
    println!("  Interval:     {}s", config.interval.as_secs());
    println!("  Reload:       {}", if config.reload { "yes" } else { "no" });
    println!("  Reactive:     {}", if config.reactive { "yes" } else { "no" });
    println!("  Team-protect: enabled");
    println!();
    println!("  Guarding... (Ctrl+C to stop)");
    println!();

    let resume_dir = resume_dir_for(&entry);
    let mut guard = Guard::new(entry.path, resume_dir, config)?;
    guard.run()
}

/// Re-spawn ourselves detached, logging to the temp dir. The child takes
/// the PID lock; we only refuse early when it is clearly held.
fn spawn_daemon(entry: &SessionEntry) -> Result<()> {
    let lock_path = lock_path_for(&entry.session_id);
    if let Ok(raw) = std::fs::read_to_string(&lock_path) {
        if let Ok(pid) = raw.trim().parse::<u32>() {
            if pid_alive(pid) {
                return Err(GuardError::LockHeld { pid }.into());
            }
        }
    }

    let exe = std::env::current_exe().context("Failed to locate the slimline binary")?;
    let args: Vec<String> = std::env::args().skip(1).filter(|a| a != "--daemon").collect();
    let log_path: PathBuf = std::env::temp_dir().join(format!(
        "slimline_guard_{}.log",
        &entry.session_id.chars().take(8).collect::<String>()
    ));
    let log = std::fs::File::create(&log_path)
        .with_context(|| format!("Failed to create {}", log_path.display()))?;

    let child = Command::new(exe)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()
        .context("Failed to spawn the guard daemon")?;

    println!("  Guard daemon started (PID {})", child.id());
    println!("  Log: {}", log_path.display());
    Ok(())
}

pub fn cmd_checkpoint(show: bool) -> Result<()> {
    let entry = current_session()?;
    let (records, _) = load_session(&entry.path)?;
    let state = extract_with_config(&records, &teams_dir());

    if state.is_empty() {
        println!("  No team state detected.");
        return Ok(());
    }

    let project_dir = entry.path.parent().unwrap_or(std::path::Path::new("."));
    let path = write_checkpoint(&state, project_dir)?;
    println!(
        "  Checkpoint: {} subagents, {} tasks -> {}",
        state.subagents.len(),
        state.tasks.len(),
        path.display()
    );
    if show {
        println!();
        println!("{}", state.to_recovery_text());
        println!();
    }
    Ok(())
}

pub fn cmd_reload(rx: Option<&str>, thinking_mode: Option<&str>) -> Result<()> {
    let prescription = parse_prescription(rx)?;
    let config = build_config(thinking_mode)?;
    let entry = current_session()?;

    let (records, _) = load_session(&entry.path)?;
    let before_tokens = tokens::estimate(&records);
    let (pruned, outcome) = run_prescription(records, prescription, &config);
    let after_tokens = tokens::estimate(&pruned);
    print_outcome(&outcome, &before_tokens, &after_tokens);

    let backup = save_session(&entry.path, &pruned, true)?;
    println!("  Treatment applied to {}", entry.path.display());
    if let Some(backup) = backup {
        println!("  Backup: {}", backup.display());
    }

    let recap_path = std::env::temp_dir().join(format!(
        "slimline_recap_{}.txt",
        &entry.session_id.chars().take(8).collect::<String>()
    ));
    save_recap(&pruned, &recap_path)?;
    println!("  Recap saved to {}", recap_path.display());

    let Some(host_pid) = find_host_pid() else {
        println!("  WARNING: could not detect the host agent process.");
        println!("  Treatment was applied, but no auto-resume watcher was started.");
        println!("  Restart manually: claude --resume {}", entry.session_id);
        return Ok(());
    };

    let resume_dir = resume_dir_for(&entry);
    let spawned = spawn_resume_watcher(
        host_pid,
        &resume_dir,
        Some(&recap_path),
        Some(&entry.session_id),
    )?;
    if spawned {
        println!("  Watcher spawned (watching host PID {host_pid}).");
        println!("  Exit the host agent now — a new terminal will resume this session.");
    } else {
        println!("  Auto-resume is not supported on this platform.");
        println!("  Restart manually: claude --resume {}", entry.session_id);
    }
    println!();
    Ok(())
}
