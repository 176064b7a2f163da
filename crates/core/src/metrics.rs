//! Drift and jitter measurement for a forwarded stream.
//!
//! Every access unit handed to the packetizer is recorded with its PTS and
//! arrival time. Consecutive frames give two deltas: presentation time
//! (PTS difference at 90 kHz) and wall-clock time. Their series characterize
//! the pipeline:
//!
//! - **fps**: `1 / mean(pts_delta)`.
//! - **jitter**: standard deviation of `pts_delta`, in ms.
//! - **drift**: `wall_delta - pts_delta` in ms; positive means frames arrive
//!   slower than they should play.
//! - **gaps**: intervals longer than twice the mean.
//! - **smoothness**: `(1 - stddev/mean) * 100`, clamped to 0..=100.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::codec::H264_CLOCK_RATE;

/// Reports are skipped until this many valid deltas have accumulated.
pub const MIN_SAMPLES: usize = 10;

/// Series length kept after each report.
pub const WINDOW: usize = 300;

/// PTS deltas at or above this (seconds) are timestamp discontinuities.
const MAX_PTS_DELTA: f64 = 5.0;

/// Sliding windows of inter-frame deltas for one stream.
#[derive(Debug, Default)]
pub struct FrameStats {
    frames: u64,
    last: Option<(i64, Instant)>,
    pts_deltas: VecDeque<f64>,
    drift_ms: VecDeque<f64>,
}

/// One periodic summary of [`FrameStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub frames: u64,
    pub fps: f64,
    pub jitter_ms: f64,
    pub drift_ms: f64,
    pub drift_max_ms: f64,
    pub gaps: usize,
    pub smoothness: u8,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame's PTS (90 kHz ticks) observed at `now`.
    ///
    /// The first call only sets the baseline. Deltas outside `(0, 5s)` are
    /// left out of both series but still move the baseline forward.
    pub fn record_at(&mut self, pts: i64, now: Instant) {
        self.frames += 1;

        if let Some((last_pts, last_wall)) = self.last {
            let pts_delta = (pts - last_pts) as f64 / f64::from(H264_CLOCK_RATE);
            let wall_delta = now.saturating_duration_since(last_wall).as_secs_f64();

            if pts_delta > 0.0 && pts_delta < MAX_PTS_DELTA {
                self.pts_deltas.push_back(pts_delta);
                self.drift_ms.push_back((wall_delta - pts_delta) * 1000.0);
            }
        }

        self.last = Some((pts, now));
    }

    /// Total `record_at` calls, including the baseline and discarded deltas.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Number of valid deltas currently held.
    pub fn samples(&self) -> usize {
        self.pts_deltas.len()
    }

    pub fn pts_deltas(&self) -> impl Iterator<Item = f64> + '_ {
        self.pts_deltas.iter().copied()
    }

    pub fn drift_samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.drift_ms.iter().copied()
    }

    /// Summarize the windows, then trim them to the last [`WINDOW`] entries.
    ///
    /// Returns `None` (and leaves the windows untouched) with fewer than
    /// [`MIN_SAMPLES`] deltas.
    pub fn report(&mut self) -> Option<StatsReport> {
        let n = self.pts_deltas.len();
        if n < MIN_SAMPLES {
            return None;
        }

        let mean_delta = mean(&self.pts_deltas);
        let sd = stddev(&self.pts_deltas, mean_delta);
        let gaps = self
            .pts_deltas
            .iter()
            .filter(|&&d| d > mean_delta * 2.0)
            .count();
        let cv = sd / mean_delta;

        let report = StatsReport {
            frames: self.frames,
            fps: 1.0 / mean_delta,
            jitter_ms: sd * 1000.0,
            drift_ms: mean(&self.drift_ms),
            drift_max_ms: self.drift_ms.iter().fold(0.0, |m, d| f64::max(m, d.abs())),
            gaps,
            smoothness: ((1.0 - cv) * 100.0).clamp(0.0, 100.0) as u8,
        };

        if n > WINDOW {
            self.pts_deltas.drain(..n - WINDOW);
            let drift_excess = self.drift_ms.len().saturating_sub(WINDOW);
            self.drift_ms.drain(..drift_excess);
        }

        Some(report)
    }
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation over the whole window (divides by N).
fn stddev(values: &VecDeque<f64>, mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Thread-safe [`FrameStats`] tagged with a stream name.
pub struct FrameMetrics {
    name: String,
    stats: Mutex<FrameStats>,
    reports: AtomicU64,
}

impl FrameMetrics {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stats: Mutex::new(FrameStats::new()),
            reports: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one access unit's PTS at the current time.
    pub fn record_frame(&self, pts: i64) {
        self.stats.lock().record_at(pts, Instant::now());
    }

    pub fn frames(&self) -> u64 {
        self.stats.lock().frames()
    }

    /// Number of reports logged so far.
    pub fn reports(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    /// Compute a report and log it at info level.
    pub fn report(&self) -> Option<StatsReport> {
        let report = self.stats.lock().report()?;
        self.reports.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            stream = %self.name,
            frames = report.frames,
            fps = format_args!("{:.1}", report.fps),
            jitter_ms = format_args!("{:.2}", report.jitter_ms),
            drift_ms = format_args!("{:.1}", report.drift_ms),
            drift_max_ms = format_args!("{:.1}", report.drift_max_ms),
            gaps = report.gaps,
            smooth = report.smoothness,
            "stream stats"
        );
        Some(report)
    }
}

/// Background task that calls [`FrameMetrics::report`] every `interval`.
///
/// The first report fires one interval after spawning. After
/// [`stop`](Self::stop) returns no further report is produced.
pub struct MetricsReporter {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MetricsReporter {
    pub fn spawn(metrics: Arc<FrameMetrics>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        metrics.report();
                    }
                }
            }
            tracing::debug!(stream = %metrics.name(), "metrics reporter stopped");
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Cancel the timer and wait for the task to exit. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "metrics reporter task failed");
        }
    }
}

impl Drop for MetricsReporter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
