//! Byte-level transfer progress with sliding-window speed and ETA.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Progress snapshot handed to callbacks
#[derive(Debug, Clone)]
pub struct TransferUpdate {
    pub total_bytes: u64,
    pub sent_bytes: u64,
    /// 0.0 - 1.0
    pub fraction: f64,
    pub speed_bytes_per_sec: u64,
    pub eta_seconds: Option<u64>,
    pub segments_total: usize,
    pub segments_done: usize,
}

impl TransferUpdate {
    pub fn describe(&self) -> String {
        format!(
            "{} / {} ({}/s)",
            format_bytes(self.sent_bytes),
            format_bytes(self.total_bytes),
            format_bytes(self.speed_bytes_per_sec)
        )
    }
}

/// Callback for transfer progress
pub trait TransferProgress: Send + Sync {
    fn on_transfer(&self, update: TransferUpdate);
}

/// No-op progress sink
pub struct NoTransferProgress;

impl TransferProgress for NoTransferProgress {
    fn on_transfer(&self, _update: TransferUpdate) {}
}

/// Closure-based progress sink
pub struct FnTransferProgress<F>(pub F);

impl<F> TransferProgress for FnTransferProgress<F>
where
    F: Fn(TransferUpdate) + Send + Sync,
{
    fn on_transfer(&self, update: TransferUpdate) {
        (self.0)(update)
    }
}

/// Format bytes as a human-readable size (`"412.0 MB"`).
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Sliding-window byte counter shared across retries of one upload.
///
/// Atomic counters take byte increments from the streaming body; the window
/// keeps the last ten seconds of samples for a stable speed estimate.
pub struct TransferTracker {
    total_bytes: u64,
    sent_bytes: AtomicU64,
    segments_total: usize,
    segments_done: AtomicU64,
    samples: Mutex<Vec<(Instant, u64)>>,
}

const SPEED_WINDOW: Duration = Duration::from_secs(10);

impl TransferTracker {
    pub fn new(total_bytes: u64, segments_total: usize) -> Arc<Self> {
        Arc::new(Self {
            total_bytes,
            sent_bytes: AtomicU64::new(0),
            segments_total,
            segments_done: AtomicU64::new(0),
            samples: Mutex::new(Vec::with_capacity(32)),
        })
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.sent_bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Roll back bytes counted for a failed segment attempt.
    pub fn rewind_bytes(&self, bytes: u64) {
        self.sent_bytes.fetch_sub(bytes.min(self.sent()), Ordering::SeqCst);
    }

    pub fn complete_segment(&self) {
        self.segments_done.fetch_add(1, Ordering::SeqCst);
    }

    pub fn sent(&self) -> u64 {
        self.sent_bytes.load(Ordering::SeqCst)
    }

    pub fn update(&self) -> TransferUpdate {
        let sent = self.sent();
        let speed = {
            let mut samples = self.samples.lock().expect("tracker mutex poisoned");
            let now = Instant::now();
            samples.push((now, sent));
            samples.retain(|(at, _)| now.duration_since(*at) <= SPEED_WINDOW);
            match samples.first() {
                Some((oldest_at, oldest_bytes)) if samples.len() >= 2 => {
                    let elapsed = now.duration_since(*oldest_at).as_secs_f64();
                    if elapsed > 0.0 {
                        (sent.saturating_sub(*oldest_bytes) as f64 / elapsed) as u64
                    } else {
                        0
                    }
                }
                _ => 0,
            }
        };

        let fraction = if self.total_bytes > 0 {
            (sent as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let eta_seconds = if speed > 0 && sent < self.total_bytes {
            Some((self.total_bytes - sent) / speed)
        } else {
            None
        };

        TransferUpdate {
            total_bytes: self.total_bytes,
            sent_bytes: sent,
            fraction,
            speed_bytes_per_sec: speed,
            eta_seconds,
            segments_total: self.segments_total,
            segments_done: self.segments_done.load(Ordering::SeqCst) as usize,
        }
    }
}
