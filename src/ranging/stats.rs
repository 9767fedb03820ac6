/// Incremental statistics over accepted distances.

use std::time::{Duration, Instant};

/// Running count, mean and variance (Welford), plus extremes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Population variance.
    pub fn variance(&self) -> Option<f64> {
        (self.count > 0).then(|| self.m2 / self.count as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn summary(&self) -> Summary {
        Summary {
            count: self.count,
            mean: self.mean(),
            variance: self.variance(),
            std_dev: self.std_dev(),
            min: self.min(),
            max: self.max(),
        }
    }
}

/// Plain copy of a [`RunningStats`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    pub count: u64,
    pub mean: Option<f64>,
    pub variance: Option<f64>,
    pub std_dev: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Results per second, re-estimated once at least a second has passed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateCounter {
    window_start: Option<Instant>,
    count: u32,
    rate_hz: f64,
}

impl RateCounter {
    pub fn tick(&mut self, now: Instant) {
        let start = *self.window_start.get_or_insert(now);
        self.count += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= Duration::from_secs(1) {
            self.rate_hz = self.count as f64 / elapsed.as_secs_f64();
            self.window_start = Some(now);
            self.count = 0;
        }
    }

    pub fn rate_hz(&self) -> f64 {
        self.rate_hz
    }
}

/// Consistent view of all ranging statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatisticsSnapshot {
    /// Every recorded distance, flagged or not.
    pub all: Summary,
    /// Only distances without an outlier flag.
    pub accepted: Summary,
    pub rate_hz: f64,
    /// Sequences that ended in a result or were abandoned.
    pub attempts: u64,
    pub success_rate: f64,
    pub consecutive_failures: u32,
}

/// Aggregates fed by the session on every resolved sequence.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    all: RunningStats,
    accepted: RunningStats,
    rate: RateCounter,
    attempts: u64,
    successes: u64,
    consecutive_failures: u32,
}

impl Statistics {
    pub fn record_success(&mut self, distance: f64, flagged: bool, now: Instant) {
        self.all.push(distance);
        if !flagged {
            self.accepted.push(distance);
        }
        self.rate.tick(now);
        self.attempts += 1;
        self.successes += 1;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.attempts += 1;
        self.consecutive_failures += 1;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            all: self.all.summary(),
            accepted: self.accepted.summary(),
            rate_hz: self.rate.rate_hz(),
            attempts: self.attempts,
            success_rate: self.successes as f64 / self.attempts.max(1) as f64,
            consecutive_failures: self.consecutive_failures,
        }
    }
}
