//! Recording diagnostics
//!
//! Frame counters, write latency, and a bitrate estimate. Only the recorder
//! task mutates these; everyone else sees a `MetricsSnapshot`.

use crate::media::TrackKind;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const BITRATE_WINDOW: Duration = Duration::from_secs(1);
const LATENCY_SMOOTHING: f64 = 0.1;
const DROP_RATE_WARN_PCT: f64 = 5.0;
const DROP_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Why a frame was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Ingest queue was full and this frame was the oldest
    QueueOverflow,
    /// Video pts not after the last accepted one
    NonMonotonic,
    /// The writer refused the frame
    AppendFailed,
    /// Arrived while no session was accepting frames
    NotAccepting,
}

/// Per-track counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackCounters {
    pub received: u64,
    pub written: u64,
    pub dropped: u64,
}

/// Point-in-time copy of the metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub video: TrackCounters,
    pub audio: TrackCounters,
    pub non_monotonic_drops: u64,
    pub overflow_drops: u64,
    pub append_failures: u64,
    /// Producer events lost because the recorder task fell behind
    pub ingest_overflow: u64,
    pub avg_write_latency_ms: f64,
    pub bitrate_bps: f64,
}

impl MetricsSnapshot {
    pub fn total_written(&self) -> u64 {
        self.video.written + self.audio.written
    }
}

#[derive(Debug)]
pub struct Metrics {
    snapshot: MetricsSnapshot,
    latency_samples: u64,
    window_start: Instant,
    window_bytes: u64,
    drops_in_window: u64,
    writes_in_window: u64,
    last_drop_check: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            snapshot: MetricsSnapshot::default(),
            latency_samples: 0,
            window_start: now,
            window_bytes: 0,
            drops_in_window: 0,
            writes_in_window: 0,
            last_drop_check: now,
        }
    }

    fn track_mut(&mut self, kind: TrackKind) -> &mut TrackCounters {
        match kind {
            TrackKind::Video => &mut self.snapshot.video,
            TrackKind::Audio => &mut self.snapshot.audio,
        }
    }

    pub fn record_received(&mut self, kind: TrackKind) {
        self.track_mut(kind).received += 1;
    }

    pub fn record_written(&mut self, kind: TrackKind, bytes: usize, latency: Duration) {
        self.record_written_at(kind, bytes, latency, Instant::now());
    }

    fn record_written_at(&mut self, kind: TrackKind, bytes: usize, latency: Duration, now: Instant) {
        self.track_mut(kind).written += 1;
        self.writes_in_window += 1;

        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.snapshot.avg_write_latency_ms = if self.latency_samples == 0 {
            latency_ms
        } else {
            self.snapshot.avg_write_latency_ms * (1.0 - LATENCY_SMOOTHING)
                + latency_ms * LATENCY_SMOOTHING
        };
        self.latency_samples += 1;

        self.window_bytes += bytes as u64;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= BITRATE_WINDOW {
            self.snapshot.bitrate_bps = self.window_bytes as f64 * 8.0 / elapsed.as_secs_f64();
            self.window_bytes = 0;
            self.window_start = now;
        }

        self.check_drop_rate(now);
    }

    pub fn record_dropped(&mut self, kind: TrackKind, reason: DropReason) {
        self.track_mut(kind).dropped += 1;
        self.drops_in_window += 1;
        match reason {
            DropReason::NonMonotonic => self.snapshot.non_monotonic_drops += 1,
            DropReason::QueueOverflow => self.snapshot.overflow_drops += 1,
            DropReason::AppendFailed => self.snapshot.append_failures += 1,
            DropReason::NotAccepting => {}
        }
        self.check_drop_rate(Instant::now());
    }

    fn check_drop_rate(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_drop_check) < DROP_CHECK_INTERVAL {
            return;
        }
        let total = self.writes_in_window + self.drops_in_window;
        if total > 0 {
            let drop_rate = 100.0 * self.drops_in_window as f64 / total as f64;
            if drop_rate > DROP_RATE_WARN_PCT {
                tracing::warn!(
                    written = self.writes_in_window,
                    drops = self.drops_in_window,
                    drop_rate_pct = format!("{:.1}%", drop_rate),
                    "Frame drop rate exceeds {}% threshold",
                    DROP_RATE_WARN_PCT
                );
            } else if self.drops_in_window > 0 {
                tracing::debug!(
                    written = self.writes_in_window,
                    drops = self.drops_in_window,
                    "Recorder frame stats"
                );
            }
        }
        self.writes_in_window = 0;
        self.drops_in_window = 0;
        self.last_drop_check = now;
    }

    pub fn written(&self, kind: TrackKind) -> u64 {
        match kind {
            TrackKind::Video => self.snapshot.video.written,
            TrackKind::Audio => self.snapshot.audio.written,
        }
    }

    pub fn snapshot(&self, ingest_overflow: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            ingest_overflow,
            ..self.snapshot.clone()
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
