//! Circuit breaker for guard-initiated prunes.
//!
//! Tracks prune/recovery events inside a rolling window, escalates the
//! prescription on each consecutive event, and trips after the configured
//! maximum so a prune → resume → overflow loop cannot run away. State is a
//! small JSON file under the temp directory so the breaker survives guard
//! restarts on the same session.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::strategy::Prescription;

pub const DEFAULT_MAX_EVENTS: usize = 3;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// Escalation ladder for reactive recoveries.
const LADDER: [Prescription; 3] = [
    Prescription::Gentle,
    Prescription::Standard,
    Prescription::Aggressive,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerEvent {
    ts: u64,
    rx: String,
    before_mb: f64,
    after_mb: f64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state_path: PathBuf,
    max_events: usize,
    window: Duration,
}

impl CircuitBreaker {
    pub fn new(session_id: &str, max_events: usize, window: Duration) -> Self {
        let digest = Sha256::digest(session_id.as_bytes());
        let slug: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
        Self {
            state_path: std::env::temp_dir().join(format!("slimline_breaker_{slug}.json")),
            max_events,
            window,
        }
    }

    pub fn with_defaults(session_id: &str) -> Self {
        Self::new(session_id, DEFAULT_MAX_EVENTS, DEFAULT_WINDOW)
    }

    pub fn window_secs(&self) -> u64 {
        self.window.as_secs()
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Events still inside the rolling window.
    fn load(&self) -> Vec<BreakerEvent> {
        let Ok(raw) = fs::read_to_string(&self.state_path) else {
            return Vec::new();
        };
        let Ok(events) = serde_json::from_str::<Vec<BreakerEvent>>(&raw) else {
            return Vec::new();
        };
        let cutoff = Self::now().saturating_sub(self.window.as_secs());
        events.into_iter().filter(|e| e.ts > cutoff).collect()
    }

    fn save(&self, events: &[BreakerEvent]) {
        if let Ok(raw) = serde_json::to_string(events) {
            let _ = fs::write(&self.state_path, raw);
        }
    }

    /// Number of events in the current window.
    pub fn count(&self) -> usize {
        self.load().len()
    }

    /// True while another prune is still allowed.
    pub fn can_fire(&self) -> bool {
        self.count() < self.max_events
    }

    pub fn tripped(&self) -> bool {
        !self.can_fire()
    }

    /// Escalating prescription: gentle on the first recovery in the
    /// window, standard on the second, aggressive from the third on.
    pub fn next_prescription(&self) -> Prescription {
        let idx = self.count().min(LADDER.len() - 1);
        LADDER[idx]
    }

    pub fn record(&self, rx: Prescription, before_mb: f64, after_mb: f64) {
        let mut events = self.load();
        events.push(BreakerEvent {
            ts: Self::now(),
            rx: rx.name().to_string(),
            before_mb: (before_mb * 100.0).round() / 100.0,
            after_mb: (after_mb * 100.0).round() / 100.0,
        });
        self.save(&events);
    }

    pub fn reset(&self) {
        let _ = fs::remove_file(&self.state_path);
    }
}
