//! Host-agent process control for the reload flow.
//!
//! After a treatment the host agent still holds the old transcript in
//! memory. The resume watcher is a detached shell that waits for the host
//! process to exit, then opens a fresh terminal running the resume command
//! (showing the recap first when one was written).

use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn resume_flag(session_id: Option<&str>) -> String {
    match session_id {
        Some(id) => format!("--resume {id}"),
        None => "--resume".to_string(),
    }
}

/// Build the platform command that opens a terminal and resumes the host
/// agent in `project_dir`. Returns `None` on unsupported platforms.
fn terminal_resume_command(
    project_dir: &str,
    recap_path: Option<&Path>,
    session_id: Option<&str>,
) -> Option<String> {
    let recap = recap_path
        .filter(|p| p.exists())
        .map(|p| format!("cat {}; echo; ", shell_quote(&p.to_string_lossy())))
        .unwrap_or_default();
    let inner = format!(
        "cd {} && {recap}claude {}",
        shell_quote(project_dir),
        resume_flag(session_id)
    );

    if cfg!(target_os = "macos") {
        Some(format!(
            "osascript -e 'tell application \"Terminal\" to do script \"{inner}\"'"
        ))
    } else if cfg!(target_os = "linux") {
        Some(format!(
            "if command -v gnome-terminal >/dev/null 2>&1; then \
             gnome-terminal -- bash -c '{inner}; exec bash'; \
             elif command -v xterm >/dev/null 2>&1; then \
             xterm -e '{inner}' & \
             else echo 'No terminal emulator found' >> /tmp/slimline_reload.log; fi"
        ))
    } else {
        None
    }
}

/// Spawn a fully detached watcher that resumes the host agent after PID
/// `host_pid` exits. Returns `false` when the platform is unsupported.
pub fn spawn_resume_watcher(
    host_pid: u32,
    project_dir: &str,
    recap_path: Option<&Path>,
    session_id: Option<&str>,
) -> Result<bool> {
    let Some(resume_cmd) = terminal_resume_command(project_dir, recap_path, session_id) else {
        return Ok(false);
    };

    let script = format!(
        "while kill -0 {host_pid} 2>/dev/null; do sleep 1; done; sleep 1; {resume_cmd}; \
         echo \"$(date): slimline resumed the host agent in {project_dir}\" >> /tmp/slimline_reload.log"
    );
    Command::new("bash")
        .args(["-c", &script])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to spawn the resume watcher")?;
    Ok(true)
}

/// Best-effort liveness probe for a PID.
pub fn pid_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") && Path::new("/proc").exists() {
        return Path::new("/proc").join(pid.to_string()).exists();
    }
    Command::new("ps")
        .args(["-p", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
