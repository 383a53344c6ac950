//! Reactive session-file watcher.
//!
//! A separate thread observes the session file through native change
//! notification, falling back to 200 ms stat polling when a watcher cannot
//! be created. It exists to catch a burst append that blows past the hard
//! threshold between two guard ticks — the poll loop alone would notice up
//! to an interval late.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use notify::{RecursiveMode, Watcher};

/// Fallback poll cadence when no native watcher is available.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long a native-event wait blocks before re-checking shutdown.
const EVENT_WAIT: Duration = Duration::from_millis(500);

/// Threshold logic, separated from the I/O loop so it can be tested
/// without a filesystem.
#[derive(Debug)]
pub struct SizeWatch {
    soft_bytes: u64,
    hard_bytes: u64,
    last_size: u64,
}

impl SizeWatch {
    pub fn new(soft_bytes: u64, hard_bytes: u64, initial_size: u64) -> Self {
        Self {
            soft_bytes,
            hard_bytes,
            last_size: initial_size,
        }
    }

    /// Feed one observed size. Returns `true` when the file jumped across
    /// the hard threshold since the last observation. Sizes well below the
    /// soft threshold take the fast path out.
    pub fn observe(&mut self, size: u64) -> bool {
        if size < self.soft_bytes {
            self.last_size = size;
            return false;
        }
        let crossed = size >= self.hard_bytes && self.last_size < self.hard_bytes;
        self.last_size = size;
        crossed
    }

    /// Re-arm after a prune shrank the file.
    pub fn rearm(&mut self, size: u64) {
        self.last_size = size;
    }
}

fn file_size(path: &Path) -> u64 {
    path.metadata().map(|m| m.len()).unwrap_or(0)
}

/// Spawn the watcher thread. `on_hard_jump` runs on the watcher thread;
/// the caller is responsible for taking the shared session lock inside it.
pub fn spawn_reactive_watcher<F>(
    path: PathBuf,
    soft_bytes: u64,
    hard_bytes: u64,
    shutdown: Arc<AtomicBool>,
    on_hard_jump: F,
) -> JoinHandle<()>
where
    F: Fn(u64) + Send + 'static,
{
    thread::spawn(move || {
        let mut watch = SizeWatch::new(soft_bytes, hard_bytes, file_size(&path));

        let (tx, rx) = mpsc::channel::<notify::Result<notify::Event>>();
        let native = notify::recommended_watcher(move |event| {
            let _ = tx.send(event);
        })
        .ok()
        .and_then(|mut watcher| {
            // Watch the parent directory: an atomic rename over the
            // session file would silently drop a watch on the file itself.
            let dir = path.parent().map(Path::to_path_buf)?;
            watcher.watch(&dir, RecursiveMode::NonRecursive).ok()?;
            Some(watcher)
        });

        match native {
            Some(_watcher) => {
                while !shutdown.load(Ordering::Relaxed) {
                    match rx.recv_timeout(EVENT_WAIT) {
                        Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => {
                            check(&path, &mut watch, &on_hard_jump);
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
            None => {
                while !shutdown.load(Ordering::Relaxed) {
                    thread::sleep(POLL_INTERVAL);
                    check(&path, &mut watch, &on_hard_jump);
                }
            }
        }
    })
}

fn check<F: Fn(u64)>(path: &Path, watch: &mut SizeWatch, on_hard_jump: &F) {
    let size = file_size(path);
    if watch.observe(size) {
        on_hard_jump(size);
        // The callback may have pruned the file; start from its new size.
        watch.rearm(file_size(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn small_files_take_the_fast_path() {
        let mut watch = SizeWatch::new(100, 200, 0);
        assert!(!watch.observe(10));
        assert!(!watch.observe(50));
        assert!(!watch.observe(99));
    }

    #[test]
    fn crossing_hard_fires_once_per_jump() {
        let mut watch = SizeWatch::new(100, 200, 0);
        assert!(!watch.observe(150), "soft zone does not fire");
        assert!(watch.observe(250), "crossing hard fires");
        assert!(!watch.observe(260), "still above hard, no re-fire");
        watch.rearm(40);
        assert!(watch.observe(500), "fires again after re-arm below hard");
    }

    #[test]
    fn shrinking_below_soft_rearms_naturally() {
        let mut watch = SizeWatch::new(100, 200, 250);
        assert!(!watch.observe(30), "post-prune size takes the fast path");
        assert!(watch.observe(220));
    }

    #[test]
    fn watcher_thread_reports_a_burst_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.jsonl");
        std::fs::write(&path, "x".repeat(10)).unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = spawn_reactive_watcher(
            path.clone(),
            50,
            100,
            Arc::clone(&shutdown),
            move |_size| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        // Burst-append past the hard threshold.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all("y".repeat(200).as_bytes()).unwrap();
        file.sync_all().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
