#![forbid(unsafe_code)]

//! Periodic progress reporting for running transfers.
//!
//! A monitor task stats the partial file every two seconds, derives an
//! instantaneous rate from the size delta, smooths it (a quarter of the
//! previous estimate, three quarters of the new sample), and prints one
//! human-readable line per tick. Purely observational; transfer correctness
//! never depends on it.

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub const PROGRESS_TICK: Duration = Duration::from_secs(2);

const SMOOTHING_PREVIOUS_WEIGHT: f64 = 0.25;
const SIZE_SUFFIXES: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub current: u64,
    pub total: u64,
    pub percent: f64,
    /// Smoothed transfer rate in bytes per millisecond.
    pub rate: f64,
    /// Estimated seconds remaining; zero or negative means unknowable.
    pub eta_seconds: i64,
}

/// Accumulates tick-to-tick state for one transfer.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    last_size: u64,
    last_tick: Instant,
    smoothed_rate: f64,
}

impl ProgressTracker {
    pub fn new(total: u64, start: Instant) -> Self {
        Self {
            total,
            last_size: 0,
            last_tick: start,
            smoothed_rate: 0.0,
        }
    }

    pub fn sample(&mut self, size: u64, now: Instant) -> ProgressSnapshot {
        // A zero-byte file still counts as one byte so the ratios below
        // never divide by zero.
        let size = size.max(1);
        let total = self.total.max(1);
        let percent = size as f64 / total as f64 * 100.0;

        let elapsed_ms = now.duration_since(self.last_tick).as_millis() as f64;
        let instantaneous = if elapsed_ms > 0.0 {
            size.saturating_sub(self.last_size) as f64 / elapsed_ms
        } else {
            0.0
        };
        self.smoothed_rate = SMOOTHING_PREVIOUS_WEIGHT * self.smoothed_rate
            + (1.0 - SMOOTHING_PREVIOUS_WEIGHT) * instantaneous;

        let eta_seconds = if self.smoothed_rate > 0.0 {
            (total.saturating_sub(size) as f64 / self.smoothed_rate / 1e3) as i64
        } else {
            0
        };

        self.last_size = size;
        self.last_tick = now;

        ProgressSnapshot {
            current: size,
            total,
            percent,
            rate: self.smoothed_rate,
            eta_seconds,
        }
    }
}

/// Renders one progress line, e.g.
/// `Downloading Some Movie - 12 MB of 700 MB - 1.71% - 4m 10s remaining`.
pub fn render_progress_line(title: &str, snapshot: &ProgressSnapshot) -> String {
    format!(
        "Downloading {title} - {} of {} - {:.2}% - {} remaining",
        format_size(snapshot.current as f64),
        format_size(snapshot.total as f64),
        snapshot.percent,
        format_eta(snapshot.eta_seconds),
    )
}

/// Logarithmic unit selection over B/KB/MB/GB/TB, two decimals at most.
/// Sizes below one byte render with the smallest unit instead of blowing up
/// on `log(0)`.
pub fn format_size(size: f64) -> String {
    if size < 1.0 {
        return format!("0 {}", SIZE_SUFFIXES[0]);
    }
    let exponent = (size.ln() / 1024f64.ln()).floor();
    let index = (exponent as usize).min(SIZE_SUFFIXES.len() - 1);
    let value = size / 1024f64.powi(index as i32);
    format!("{} {}", format_trimmed(value), SIZE_SUFFIXES[index])
}

/// Estimated time remaining; non-positive estimates render as unbounded.
pub fn format_eta(seconds: i64) -> String {
    if seconds <= 0 {
        return "∞".to_string();
    }
    format!("{}m {}s", seconds / 60, seconds % 60)
}

fn format_trimmed(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    let mut text = format!("{rounded:.2}");
    while text.ends_with('0') {
        text.pop();
    }
    if text.ends_with('.') {
        text.pop();
    }
    text
}

/// Prints a progress line every tick until `done` flips or its sender goes
/// away, whichever comes first.
pub async fn run_monitor(
    title: String,
    partial_path: PathBuf,
    total: u64,
    mut done: watch::Receiver<bool>,
) {
    let mut tracker = ProgressTracker::new(total, Instant::now());
    let mut ticks = tokio::time::interval(PROGRESS_TICK);
    ticks.tick().await;
    loop {
        tokio::select! {
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    break;
                }
            }
            now = ticks.tick() => {
                let size = tokio::fs::metadata(&partial_path)
                    .await
                    .map(|meta| meta.len())
                    .unwrap_or(0);
                let snapshot = tracker.sample(size, now);
                println!("{}", render_progress_line(&title, &snapshot));
            }
        }
    }
}
