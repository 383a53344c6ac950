//! Session discovery and transcript file I/O.
//!
//! Sessions live under `~/.claude/projects/<slug>/<uuid>.jsonl`, where the
//! slug is the working directory path with separators replaced by dashes.
//! A session argument may be a full UUID, a unique prefix, a file path, or
//! the literal `current` (auto-detected).

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use glob::glob;
use regex::Regex;

use crate::errors::SessionError;
use crate::record::{read_records, Record};

/// Environment variable a shell hook can set to pin the current session id.
pub const SESSION_ENV_VAR: &str = "SLIMLINE_SESSION_ID";

pub fn claude_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".claude")
}

pub fn projects_dir() -> PathBuf {
    claude_dir().join("projects")
}

pub fn teams_dir() -> PathBuf {
    claude_dir().join("teams")
}

/// One discovered session file with its cheap-to-read metadata.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub path: PathBuf,
    pub project: String,
    pub session_id: String,
    pub size: u64,
    pub modified: DateTime<Local>,
    pub lines: usize,
}

/// Scan the projects tree for session files, optionally filtered by a
/// project-name substring. Backups are skipped.
pub fn find_sessions(project_filter: Option<&str>) -> Vec<SessionEntry> {
    find_sessions_in(&projects_dir(), project_filter)
}

pub fn find_sessions_in(projects_root: &Path, project_filter: Option<&str>) -> Vec<SessionEntry> {
    let pattern = projects_root.join("*").join("*.jsonl");
    let mut sessions = Vec::new();
    let Ok(paths) = glob(&pattern.to_string_lossy()) else {
        return sessions;
    };
    for path in paths.flatten() {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if name.contains(".bak") {
            continue;
        }
        let project = path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(filter) = project_filter {
            if !project.to_lowercase().contains(&filter.to_lowercase()) {
                continue;
            }
        }
        let Ok(meta) = path.metadata() else { continue };
        let modified = meta
            .modified()
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());
        let lines = count_lines(&path).unwrap_or(0);
        sessions.push(SessionEntry {
            session_id: path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default(),
            project,
            size: meta.len(),
            modified,
            lines,
            path,
        });
    }
    sessions
}

fn count_lines(path: &Path) -> Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    Ok(reader.lines().count())
}

/// Working directory path to the projects-dir slug the host agent uses.
pub fn cwd_to_slug(cwd: &str) -> String {
    cwd.replace(['/', '\\'], "-")
}

/// Best-effort inverse of [`cwd_to_slug`].
pub fn slug_to_path(slug: &str) -> String {
    slug.replace('-', "/")
}

static TASKS_UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.claude/tasks/([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})")
        .unwrap()
});

/// Walk up the process tree looking for the host agent's process.
pub fn find_host_pid() -> Option<u32> {
    let mut pid = std::process::id();
    for _ in 0..10 {
        let output = Command::new("ps")
            .args(["-o", "ppid=,comm=", "-p", &pid.to_string()])
            .output()
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.trim().splitn(2, char::is_whitespace);
        let ppid: u32 = parts.next()?.trim().parse().ok()?;
        let comm = parts.next().unwrap_or("").to_lowercase();
        if comm.contains("claude") || comm.contains("node") {
            return Some(pid);
        }
        if ppid <= 1 {
            break;
        }
        pid = ppid;
    }
    None
}

/// Read the session UUID out of the host agent's open file descriptors.
/// The host keeps a `.claude/tasks/<session-id>/` directory open.
fn session_id_from_process() -> Option<String> {
    let pid = find_host_pid()?;
    let output = Command::new("lsof").args(["-p", &pid.to_string()]).output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    TASKS_UUID_RE
        .captures_iter(&text)
        .map(|c| c[1].to_string())
        .next()
}

/// Detection ladder for the active session: pinned env var, host process
/// descriptors, working-directory slug, most recently modified.
pub fn find_current_session(cwd: Option<&str>) -> Option<SessionEntry> {
    let sessions = find_sessions(None);
    if sessions.is_empty() {
        return None;
    }

    if let Ok(id) = std::env::var(SESSION_ENV_VAR) {
        if let Some(entry) = sessions.iter().find(|s| s.session_id == id) {
            return Some(entry.clone());
        }
    }

    if let Some(id) = session_id_from_process() {
        if let Some(entry) = sessions.iter().find(|s| s.session_id == id) {
            return Some(entry.clone());
        }
    }

    let cwd = cwd
        .map(str::to_string)
        .or_else(|| std::env::current_dir().ok().map(|p| p.to_string_lossy().to_string()));
    if let Some(cwd) = cwd {
        let slug = cwd_to_slug(&cwd);
        let mut matching: Vec<&SessionEntry> =
            sessions.iter().filter(|s| s.project.contains(&slug)).collect();
        matching.sort_by_key(|s| s.modified);
        if let Some(entry) = matching.last() {
            return Some((*entry).clone());
        }
    }

    sessions.iter().max_by_key(|s| s.modified).cloned()
}

/// Resolve a session argument to a transcript path.
pub fn resolve_session(arg: &str, project_filter: Option<&str>) -> Result<PathBuf> {
    if arg == "current" {
        return find_current_session(None)
            .map(|s| s.path)
            .ok_or_else(|| SessionError::NoCurrentSession.into());
    }

    let as_path = Path::new(arg);
    if as_path.exists() && as_path.extension().is_some_and(|e| e == "jsonl") {
        return Ok(as_path.to_path_buf());
    }

    let sessions = find_sessions(project_filter);
    if let Some(exact) = sessions.iter().find(|s| s.session_id == arg) {
        return Ok(exact.path.clone());
    }
    let prefixed: Vec<&SessionEntry> = sessions
        .iter()
        .filter(|s| s.session_id.starts_with(arg))
        .collect();
    match prefixed.len() {
        0 => Err(SessionError::NotFound(arg.to_string()).into()),
        1 => Ok(prefixed[0].path.clone()),
        _ => Err(SessionError::AmbiguousPrefix(arg.to_string()).into()),
    }
}

/// Load a transcript into records. Returns the records plus the count of
/// unparseable lines carried through verbatim.
pub fn load_session(path: &Path) -> Result<(Vec<Record>, usize)> {
    read_records(path)
}

/// Copy the original aside with a timestamp before any destructive write.
pub fn backup_path_for(path: &Path, timestamp: &DateTime<Local>) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
    path.with_file_name(format!("{stem}.{}.jsonl.bak", timestamp.format("%Y%m%d_%H%M%S")))
}

/// Write records back: timestamped backup first (when requested), then a
/// sibling temp file, fsync, and an atomic rename over the original. A
/// failed rename leaves the original untouched and the temp file on disk.
pub fn save_session(path: &Path, records: &[Record], create_backup: bool) -> Result<Option<PathBuf>> {
    let backup = if create_backup && path.exists() {
        let backup = backup_path_for(path, &Local::now());
        fs::copy(path, &backup)
            .with_context(|| format!("Failed to back up {} to {}", path.display(), backup.display()))?;
        Some(backup)
    } else {
        None
    };

    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create temp file {}", tmp.display()))?;
        crate::record::write_records(&mut file, records)?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "Failed to replace {} (new content left at {})",
            path.display(),
            tmp.display()
        )
    })?;
    Ok(backup)
}

/// Atomic write for small side files (checkpoints, state files).
pub fn write_atomically(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
