//! Incremental timing statistics.
//!
//! [`RunningStats`] tracks the intervals between observed events
//! (frame sends, display triggers, sink writes) without keeping any
//! history. Mean and variance use Welford's online update, which stays
//! numerically stable over long runs.

use std::time::{Duration, Instant};

use serde::Serialize;

// ── StatsSnapshot ────────────────────────────────────────────────

/// Point-in-time view of a [`RunningStats`]. All times are in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Number of observations.
    pub count: u64,
    /// Number of intervals folded into the statistics.
    pub intervals: u64,
    pub mean: f64,
    /// Sample variance (0 with fewer than two intervals).
    pub variance: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

// ── RunningStats ─────────────────────────────────────────────────

/// Running mean / variance / min / max over event intervals.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    intervals: u64,
    mean: f64,
    /// Sum of squared differences from the current mean.
    m2: f64,
    min: f64,
    max: f64,
    last: Option<Instant>,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event at `timestamp`.
    ///
    /// Returns the interval since the previous event, or zero for the
    /// first one, which only establishes the baseline.
    pub fn observe(&mut self, timestamp: Instant) -> Duration {
        self.count += 1;
        let interval = match self.last {
            Some(prev) => {
                let interval = timestamp.saturating_duration_since(prev);
                self.fold(interval.as_secs_f64());
                interval
            }
            None => Duration::ZERO,
        };
        self.last = Some(timestamp);
        interval
    }

    /// Record an event now.
    pub fn observe_now(&mut self) -> Duration {
        self.observe(Instant::now())
    }

    /// Fold a directly measured duration, such as a blocking send.
    pub fn observe_interval(&mut self, interval: Duration) {
        self.count += 1;
        self.fold(interval.as_secs_f64());
    }

    fn fold(&mut self, value: f64) {
        self.intervals += 1;
        if self.intervals == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.intervals as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.intervals > 1 {
            self.m2 / (self.intervals - 1) as f64
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let variance = self.variance();
        StatsSnapshot {
            count: self.count,
            intervals: self.intervals,
            mean: self.mean,
            variance,
            std_dev: variance.sqrt(),
            min: self.min,
            max: self.max,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Tests ────────────────────────────────────────────────────────
