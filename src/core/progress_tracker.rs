//! Speed and ETA statistics for a running job
//!
//! Speed is an exponential moving average over instantaneous samples, so a
//! single slow chunk does not make the ETA jump around.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const EMA_ALPHA: f64 = 0.2;
const MAX_HISTORY: usize = 50;
/// Samples closer together than this are merged into the next one
const MIN_SAMPLE_GAP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedStatistics {
    pub peak_speed: f64,
    pub average_speed: f64,
    pub smoothed_speed: f64,
    pub measurement_count: u64,
}

#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    at: Instant,
    bytes: u64,
    speed: f64,
}

/// Tracks one job's byte counter over time
#[derive(Debug)]
pub struct SpeedTracker {
    started: Instant,
    /// Bytes already on disk when tracking began (resumed jobs)
    baseline: u64,
    samples: VecDeque<SpeedSample>,
    smoothed: f64,
    stats: SpeedStatistics,
}

impl SpeedTracker {
    pub fn new(baseline: u64) -> Self {
        Self::starting_at(baseline, Instant::now())
    }

    fn starting_at(baseline: u64, now: Instant) -> Self {
        let mut samples = VecDeque::with_capacity(MAX_HISTORY);
        samples.push_back(SpeedSample {
            at: now,
            bytes: baseline,
            speed: 0.0,
        });
        Self {
            started: now,
            baseline,
            samples,
            smoothed: 0.0,
            stats: SpeedStatistics::default(),
        }
    }

    /// Record the job's current byte count and return the smoothed speed
    pub fn update(&mut self, bytes_done: u64) -> f64 {
        self.update_at(bytes_done, Instant::now())
    }

    fn update_at(&mut self, bytes_done: u64, now: Instant) -> f64 {
        let Some(last) = self.samples.back().copied() else {
            return self.smoothed;
        };
        let elapsed = now.saturating_duration_since(last.at);
        if elapsed < MIN_SAMPLE_GAP {
            return self.smoothed;
        }

        // 重新下载时计数会回退，此时只重置基线
        if bytes_done < last.bytes {
            self.samples.clear();
            self.samples.push_back(SpeedSample {
                at: now,
                bytes: bytes_done,
                speed: self.smoothed,
            });
            self.baseline = bytes_done;
            self.started = now;
            return self.smoothed;
        }

        let current = (bytes_done - last.bytes) as f64 / elapsed.as_secs_f64();
        self.samples.push_back(SpeedSample {
            at: now,
            bytes: bytes_done,
            speed: current,
        });
        if self.samples.len() > MAX_HISTORY {
            self.samples.pop_front();
        }

        self.smoothed = if self.stats.measurement_count == 0 {
            current
        } else {
            EMA_ALPHA * current + (1.0 - EMA_ALPHA) * self.smoothed
        };

        let total_elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        self.stats.measurement_count += 1;
        self.stats.peak_speed = self.stats.peak_speed.max(current);
        self.stats.smoothed_speed = self.smoothed;
        if total_elapsed > 0.0 {
            self.stats.average_speed =
                bytes_done.saturating_sub(self.baseline) as f64 / total_elapsed;
        }
        self.smoothed
    }

    pub fn speed(&self) -> f64 {
        self.smoothed
    }

    /// Seconds until `total` at the smoothed speed
    pub fn eta(&self, total: Option<u64>) -> Option<u64> {
        let total = total?;
        let done = self.samples.back()?.bytes;
        if self.smoothed <= 0.0 || done >= total {
            return None;
        }
        Some(((total - done) as f64 / self.smoothed).ceil() as u64)
    }

    pub fn statistics(&self) -> SpeedStatistics {
        self.stats
    }
}
