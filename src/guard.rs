//! Guard loop: continuous team checkpointing plus two-tier emergency
//! pruning.
//!
//! Every tick the poll thread checkpoints team state — that is the primary
//! protection, always on disk regardless of thresholds. The prune is the
//! emergency fallback: a soft crossing gets a gentle team-protected prune,
//! a hard crossing gets the configured prescription and (optionally) a
//! kill-and-resume of the host agent. A reactive watcher thread catches
//! burst appends between ticks; the circuit breaker stops the loop from
//! fighting a writer it cannot win against.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::apply::PrescriptionOutcome;
use crate::breaker::{CircuitBreaker, DEFAULT_MAX_EVENTS, DEFAULT_WINDOW};
use crate::errors::GuardError;
use crate::process::{pid_alive, spawn_resume_watcher};
use crate::record::Record;
use crate::session::{find_host_pid, load_session, save_session, teams_dir};
use crate::strategy::{Prescription, StrategyConfig};
use crate::team::{
    extract_with_config, inject_recovery_pair, write_checkpoint, TeamState, CHECKPOINT_FILE,
};
use crate::tokens;
use crate::ui::fmt_bytes;
use crate::watcher::spawn_reactive_watcher;

pub const DEFAULT_HARD_MB: f64 = 50.0;
/// Soft threshold defaults to this fraction of the hard threshold.
pub const SOFT_FRACTION: f64 = 0.6;
pub const DEFAULT_INTERVAL_SECS: u64 = 30;

/// The soft tier always runs the mildest prescription.
const SOFT_PRESCRIPTION: Prescription = Prescription::Gentle;

const SHUTDOWN_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub hard_bytes: u64,
    pub soft_bytes: u64,
    pub hard_tokens: Option<u64>,
    pub interval: Duration,
    pub hard_rx: Prescription,
    pub reload: bool,
    pub reactive: bool,
    pub breaker_max_events: usize,
    pub breaker_window: Duration,
    pub strategy_config: StrategyConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self::from_mb(DEFAULT_HARD_MB, None, None, DEFAULT_INTERVAL_SECS, Prescription::Standard)
    }
}

impl GuardConfig {
    pub fn from_mb(
        hard_mb: f64,
        soft_mb: Option<f64>,
        hard_tokens: Option<u64>,
        interval_secs: u64,
        hard_rx: Prescription,
    ) -> Self {
        let hard_bytes = (hard_mb * 1024.0 * 1024.0) as u64;
        let soft_bytes = soft_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as u64)
            .unwrap_or((hard_bytes as f64 * SOFT_FRACTION) as u64);
        Self {
            hard_bytes,
            soft_bytes,
            hard_tokens,
            interval: Duration::from_secs(interval_secs),
            hard_rx,
            reload: true,
            reactive: true,
            breaker_max_events: DEFAULT_MAX_EVENTS,
            breaker_window: DEFAULT_WINDOW,
            strategy_config: StrategyConfig::default(),
        }
    }
}

/// Which tier a tick's measurements land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    Idle,
    Soft,
    Hard,
}

/// Size and (optional) token measurements against the two tiers. The token
/// threshold fires on whichever triggers first.
pub fn threshold_for(size: u64, tokens: Option<u64>, config: &GuardConfig) -> Threshold {
    let token_hard = match (tokens, config.hard_tokens) {
        (Some(t), Some(limit)) => t >= limit,
        _ => false,
    };
    if size >= config.hard_bytes || token_hard {
        Threshold::Hard
    } else if size >= config.soft_bytes {
        Threshold::Soft
    } else {
        Threshold::Idle
    }
}

// ── Team-protected pruning ───────────────────────────────────────────────

/// Run a prescription with team records fenced off: partition by the
/// coordination index set, prune the rest, re-merge in original order, and
/// put a fresh recovery pair on top.
pub fn prune_with_team_protect(
    records: Vec<Record>,
    rx: Prescription,
    config: &StrategyConfig,
    teams_root: &Path,
) -> (Vec<Record>, PrescriptionOutcome, TeamState) {
    let state = extract_with_config(&records, teams_root);
    if state.is_empty() {
        let (pruned, outcome) = crate::apply::run_prescription(records, rx, config);
        return (pruned, outcome, state);
    }

    let index_set: std::collections::HashSet<usize> =
        state.coordination_indices.iter().copied().collect();
    let mut team_records = Vec::new();
    let mut other_records = Vec::new();
    for record in records {
        if index_set.contains(&record.line_index) {
            team_records.push(record);
        } else {
            other_records.push(record);
        }
    }

    let (pruned, outcome) = crate::apply::run_prescription(other_records, rx, config);
    let mut merged: Vec<Record> = pruned.into_iter().chain(team_records).collect();
    merged.sort_by_key(|r| r.line_index);
    let merged = inject_recovery_pair(merged, &state);
    (merged, outcome, state)
}

// ── Prune cycle ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CycleOutcome {
    pub before_bytes: u64,
    pub after_bytes: u64,
    pub outcome: PrescriptionOutcome,
    pub backup: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub team: TeamState,
    pub reload_spawned: bool,
}

/// One guard prune: load, team-protected prescription, checkpoint, backup,
/// atomic rewrite. Reload is the caller's decision, made on the result.
pub fn guard_prune_cycle(
    session_path: &Path,
    rx: Prescription,
    config: &StrategyConfig,
    teams_root: &Path,
) -> Result<CycleOutcome> {
    let before_bytes = session_path.metadata().map(|m| m.len()).unwrap_or(0);
    let (records, _) = load_session(session_path)?;
    let (pruned, outcome, team) = prune_with_team_protect(records, rx, config, teams_root);

    let checkpoint = if team.is_empty() {
        None
    } else {
        let project_dir = session_path.parent().unwrap_or(Path::new("."));
        Some(write_checkpoint(&team, project_dir)?)
    };

    let backup = save_session(session_path, &pruned, true)?;
    let after_bytes = session_path.metadata().map(|m| m.len()).unwrap_or(0);

    Ok(CycleOutcome {
        before_bytes,
        after_bytes,
        outcome,
        backup,
        checkpoint,
        team,
        reload_spawned: false,
    })
}

/// Kill-and-resume: spawn the detached watcher against the host process.
fn trigger_reload(resume_dir: &str, session_id: &str) -> bool {
    match find_host_pid() {
        Some(pid) => {
            spawn_resume_watcher(pid, resume_dir, None, Some(session_id)).unwrap_or(false)
        }
        None => false,
    }
}

/// Leave a note in the checkpoint file (e.g. "reload skipped").
pub fn append_checkpoint_note(project_dir: &Path, note: &str) {
    let path = project_dir.join(CHECKPOINT_FILE);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "\n> {note}");
    }
}

// ── PID lock ─────────────────────────────────────────────────────────────

/// Held for the guard's lifetime; a second guard on the same session
/// refuses to start while the recorded PID is alive.
pub struct PidLock {
    path: PathBuf,
}

pub fn lock_path_for(session_id: &str) -> PathBuf {
    let digest = Sha256::digest(session_id.as_bytes());
    let slug: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    std::env::temp_dir().join(format!("slimline_guard_{slug}.pid"))
}

impl PidLock {
    pub fn acquire(session_id: &str) -> Result<Self> {
        let path = lock_path_for(session_id);
        if let Ok(raw) = fs::read_to_string(&path) {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                if pid_alive(pid) {
                    return Err(GuardError::LockHeld { pid }.into());
                }
            }
        }
        fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("Failed to write lock file {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ── The guard itself ─────────────────────────────────────────────────────

#[derive(Debug)]
pub enum TickEvent {
    Idle,
    SoftFired(CycleOutcome),
    HardFired(CycleOutcome),
    BreakerRefused,
    SessionGone,
}

pub struct Guard {
    session_path: PathBuf,
    project_dir: PathBuf,
    resume_dir: String,
    session_id: String,
    config: GuardConfig,
    breaker: CircuitBreaker,
    teams_root: PathBuf,
    shutdown: Arc<AtomicBool>,
    session_lock: Arc<Mutex<()>>,
    checkpoint_requested: Arc<AtomicBool>,
    refusal_logged: bool,
    _lock: PidLock,
}

impl Guard {
    pub fn new(session_path: PathBuf, resume_dir: String, config: GuardConfig) -> Result<Self> {
        let session_id = session_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let lock = PidLock::acquire(&session_id)?;
        let project_dir = session_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let breaker = CircuitBreaker::new(
            &session_id,
            config.breaker_max_events,
            config.breaker_window,
        );
        Ok(Self {
            session_path,
            project_dir,
            resume_dir,
            session_id,
            config,
            breaker,
            teams_root: teams_dir(),
            shutdown: Arc::new(AtomicBool::new(false)),
            session_lock: Arc::new(Mutex::new(())),
            checkpoint_requested: Arc::new(AtomicBool::new(false)),
            refusal_logged: false,
            _lock: lock,
        })
    }

    #[cfg(test)]
    fn with_teams_root(mut self, teams_root: PathBuf) -> Self {
        self.teams_root = teams_root;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// One poll-thread cycle: checkpoint, then threshold logic.
    pub fn tick(&mut self) -> Result<TickEvent> {
        if !self.session_path.exists() {
            return Ok(TickEvent::SessionGone);
        }
        let size = self.session_path.metadata().map(|m| m.len()).unwrap_or(0);
        let token_estimate = if self.config.hard_tokens.is_some() {
            tokens::quick_estimate(&self.session_path)
        } else {
            None
        };

        self.write_tick_checkpoint()?;

        if self.breaker.tripped() {
            if !self.refusal_logged {
                self.refusal_logged = true;
                return Ok(TickEvent::BreakerRefused);
            }
            return Ok(TickEvent::Idle);
        }
        self.refusal_logged = false;

        match threshold_for(size, token_estimate, &self.config) {
            Threshold::Idle => Ok(TickEvent::Idle),
            Threshold::Soft => {
                let _guard = self.session_lock.lock().expect("session lock poisoned");
                let cycle = guard_prune_cycle(
                    &self.session_path,
                    SOFT_PRESCRIPTION,
                    &self.config.strategy_config,
                    &self.teams_root,
                )?;
                Ok(TickEvent::SoftFired(cycle))
            }
            Threshold::Hard => {
                let _guard = self.session_lock.lock().expect("session lock poisoned");
                let mut cycle = guard_prune_cycle(
                    &self.session_path,
                    self.config.hard_rx,
                    &self.config.strategy_config,
                    &self.teams_root,
                )?;
                self.breaker.record(
                    self.config.hard_rx,
                    cycle.before_bytes as f64 / 1024.0 / 1024.0,
                    cycle.after_bytes as f64 / 1024.0 / 1024.0,
                );
                if self.config.reload {
                    if cycle.after_bytes >= self.config.hard_bytes {
                        append_checkpoint_note(
                            &self.project_dir,
                            &format!(
                                "Post-prune size {} still above the hard threshold; reload skipped.",
                                fmt_bytes(cycle.after_bytes)
                            ),
                        );
                    } else {
                        cycle.reload_spawned = trigger_reload(&self.resume_dir, &self.session_id);
                    }
                }
                Ok(TickEvent::HardFired(cycle))
            }
        }
    }

    /// Extract team state and overwrite the checkpoint. Runs every tick so
    /// the state is always on disk before anything goes wrong.
    fn write_tick_checkpoint(&self) -> Result<Option<TeamState>> {
        let forced = self.checkpoint_requested.swap(false, Ordering::SeqCst);
        let (records, _) = load_session(&self.session_path)?;
        let state = extract_with_config(&records, &self.teams_root);
        if state.is_empty() && !forced {
            return Ok(None);
        }
        write_checkpoint(&state, &self.project_dir)?;
        Ok(Some(state))
    }

    fn spawn_reactive(&self) -> thread::JoinHandle<()> {
        let session_path = self.session_path.clone();
        let project_dir = self.project_dir.clone();
        let resume_dir = self.resume_dir.clone();
        let session_id = self.session_id.clone();
        let config = self.config.clone();
        let teams_root = self.teams_root.clone();
        let lock = Arc::clone(&self.session_lock);
        let checkpoint_requested = Arc::clone(&self.checkpoint_requested);

        spawn_reactive_watcher(
            self.session_path.clone(),
            self.config.soft_bytes,
            self.config.hard_bytes,
            self.shutdown_flag(),
            move |size| {
                let _guard = lock.lock().expect("session lock poisoned");
                reactive_recover(
                    &session_path,
                    &project_dir,
                    &resume_dir,
                    &session_id,
                    &config,
                    &teams_root,
                    &checkpoint_requested,
                    size,
                );
            },
        )
    }

    /// Run until a signal flips the shutdown flag. Prints one status line
    /// per event.
    pub fn run(&mut self) -> Result<()> {
        let shutdown = self.shutdown_flag();
        // A second guard in the same process (tests) may have installed the
        // handler already; the lock file still serializes real guards.
        let _ = ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst));

        let reactive = self.config.reactive.then(|| self.spawn_reactive());

        while !self.shutdown.load(Ordering::Relaxed) {
            let mut slept = Duration::ZERO;
            while slept < self.config.interval && !self.shutdown.load(Ordering::Relaxed) {
                thread::sleep(SHUTDOWN_SLICE);
                slept += SHUTDOWN_SLICE;
            }
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            match self.tick() {
                Ok(TickEvent::Idle) => {}
                Ok(TickEvent::SoftFired(cycle)) => {
                    println!(
                        "  [{}] soft threshold: pruned {} -> {} (gentle, no reload)",
                        now_hms(),
                        fmt_bytes(cycle.before_bytes),
                        fmt_bytes(cycle.after_bytes)
                    );
                }
                Ok(TickEvent::HardFired(cycle)) => {
                    println!(
                        "  [{}] HARD threshold: pruned {} -> {} ({}){}",
                        now_hms(),
                        fmt_bytes(cycle.before_bytes),
                        fmt_bytes(cycle.after_bytes),
                        self.config.hard_rx.name(),
                        if cycle.reload_spawned { ", reload triggered" } else { "" }
                    );
                }
                Ok(TickEvent::BreakerRefused) => {
                    let err = GuardError::BreakerTripped {
                        events: self.breaker.count(),
                        window_secs: self.breaker.window_secs(),
                    };
                    eprintln!("  [{}] breaker tripped: {err}", now_hms());
                }
                Ok(TickEvent::SessionGone) => {
                    eprintln!("  [{}] session file disappeared; stopping guard", now_hms());
                    break;
                }
                Err(err) => {
                    // The guard absorbs strategy and I/O errors; only
                    // signals end the loop.
                    eprintln!("  [{}] tick failed: {err:#}", now_hms());
                }
            }
        }

        // Final checkpoint on the way out.
        if self.session_path.exists() {
            let _ = self.write_tick_checkpoint();
        }
        if let Some(handle) = reactive {
            self.shutdown.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }
        Ok(())
    }
}

/// Reactive recovery, run on the watcher thread under the session lock:
/// breaker check, escalating prescription, prune, checkpoint, reload.
#[allow(clippy::too_many_arguments)]
fn reactive_recover(
    session_path: &Path,
    project_dir: &Path,
    resume_dir: &str,
    session_id: &str,
    config: &GuardConfig,
    teams_root: &Path,
    checkpoint_requested: &AtomicBool,
    size: u64,
) {
    let breaker = CircuitBreaker::new(session_id, config.breaker_max_events, config.breaker_window);
    if !breaker.can_fire() {
        eprintln!(
            "  [{}] reactive: breaker tripped ({} recoveries); observing only",
            now_hms(),
            breaker.count()
        );
        checkpoint_requested.store(true, Ordering::SeqCst);
        return;
    }

    let rx = breaker.next_prescription();
    eprintln!(
        "  [{}] reactive: size jumped to {}; recovery #{} with {}",
        now_hms(),
        fmt_bytes(size),
        breaker.count() + 1,
        rx.name()
    );

    match guard_prune_cycle(session_path, rx, &config.strategy_config, teams_root) {
        Ok(cycle) => {
            breaker.record(
                rx,
                cycle.before_bytes as f64 / 1024.0 / 1024.0,
                cycle.after_bytes as f64 / 1024.0 / 1024.0,
            );
            // The reactive thread writes its own checkpoint after a prune.
            if !cycle.team.is_empty() {
                let _ = write_checkpoint(&cycle.team, project_dir);
            }
            if cycle.after_bytes >= config.hard_bytes {
                append_checkpoint_note(
                    project_dir,
                    &format!(
                        "Reactive prune left {} on disk, still above the hard threshold; reload skipped.",
                        fmt_bytes(cycle.after_bytes)
                    ),
                );
            } else if config.reload {
                trigger_reload(resume_dir, session_id);
            }
        }
        Err(err) => eprintln!("  [{}] reactive prune failed: {err:#}", now_hms()),
    }
}

fn now_hms() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
