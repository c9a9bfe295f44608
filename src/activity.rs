use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Tracks the timestamp of the last session activity (PTY output or input).
///
/// Keeps two clocks: a monotonic `Instant` used by the idle reaper to
/// measure idle age, and a wall-clock unix-millisecond value reported in
/// session listings. Both are updated on every `touch()`.
#[derive(Clone)]
pub struct ActivityTracker {
    tx: Arc<watch::Sender<Instant>>,
    wall_ms: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current instant.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self {
            tx: Arc::new(tx),
            wall_ms: Arc::new(AtomicU64::new(now_unix_ms())),
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.wall_ms.store(now_unix_ms(), Ordering::Release);
        self.tx.send_replace(Instant::now());
    }

    /// Wall-clock timestamp (unix milliseconds) of the last activity.
    pub fn last_activity_unix_ms(&self) -> u64 {
        self.wall_ms.load(Ordering::Acquire)
    }

    /// How long the session has been idle.
    pub fn idle_for(&self) -> Duration {
        self.tx.borrow().elapsed()
    }

    /// Subscribe to activity changes. Receivers are notified on every
    /// `touch()`.
    pub fn subscribe(&self) -> watch::Receiver<Instant> {
        self.tx.subscribe()
    }
}
