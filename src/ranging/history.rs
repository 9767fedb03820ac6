/// Recorded ranging results and the outlier policy applied to them.

use std::collections::VecDeque;
use std::io::Write;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

use super::smoothing::{Smoother, SmoothingConfig};
use super::stats::{Statistics, StatisticsSnapshot};

/// Why a distance was flagged. Flagged results are still recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierFlag {
    Negative,
    OutOfRange,
    /// Too far from the trailing mean, in trailing standard deviations.
    Deviation,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierConfig {
    /// Number of trailing results the deviation test looks at.
    pub window: usize,
    /// Allowed deviation in trailing standard deviations.
    pub sigma: f64,
    pub max_range_m: f64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            window: 5,
            sigma: 3.0,
            max_range_m: 10.0,
        }
    }
}

/// One completed exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangingResult {
    pub sequence_number: u64,
    pub distance_meters: f64,
    pub timestamp: SystemTime,
    pub round_trip_latency: Duration,
    pub outlier: Option<OutlierFlag>,
    pub smoothed_meters: Option<f64>,
}

/// Append-only record of results with derived statistics.
///
/// Bounded histories drop their oldest entries; the statistics keep counting.
#[derive(Debug, Clone)]
pub struct History {
    results: VecDeque<RangingResult>,
    capacity: Option<usize>,
    outlier: OutlierConfig,
    trailing: VecDeque<f64>,
    smoother: Smoother,
    stats: Statistics,
    last_sequence: Option<u64>,
}

impl History {
    pub fn new(capacity: Option<usize>, outlier: OutlierConfig, smoothing: SmoothingConfig) -> Self {
        Self {
            results: VecDeque::new(),
            capacity,
            outlier,
            trailing: VecDeque::with_capacity(outlier.window + 1),
            smoother: Smoother::new(smoothing),
            stats: Statistics::default(),
            last_sequence: None,
        }
    }

    /// Flag, smooth and append a computed distance.
    ///
    /// Sequence numbers must increase; a repeat of an already recorded one is
    /// ignored and returns `None`.
    pub fn record(
        &mut self,
        sequence_number: u64,
        distance_meters: f64,
        round_trip_latency: Duration,
        now: Instant,
    ) -> Option<RangingResult> {
        if self.last_sequence.is_some_and(|last| sequence_number <= last) {
            tracing::debug!(seq = sequence_number, "Result already recorded, ignoring");
            return None;
        }
        self.last_sequence = Some(sequence_number);

        let outlier = self.classify(distance_meters);
        if !matches!(outlier, Some(OutlierFlag::Negative | OutlierFlag::OutOfRange)) {
            if self.trailing.len() == self.outlier.window {
                self.trailing.pop_front();
            }
            self.trailing.push_back(distance_meters);
        }
        let smoothed_meters = match outlier {
            None => self.smoother.update(distance_meters),
            Some(_) => None,
        };
        if let Some(flag) = outlier {
            tracing::warn!(seq = sequence_number, distance_m = distance_meters, ?flag, "Outlier distance");
        }

        let result = RangingResult {
            sequence_number,
            distance_meters,
            timestamp: SystemTime::now(),
            round_trip_latency,
            outlier,
            smoothed_meters,
        };
        self.stats.record_success(distance_meters, outlier.is_some(), now);

        if let Some(cap) = self.capacity {
            while self.results.len() >= cap.max(1) {
                self.results.pop_front();
            }
        }
        self.results.push_back(result.clone());
        Some(result)
    }

    /// Count an abandoned sequence.
    pub fn record_failure(&mut self) {
        self.stats.record_failure();
    }

    fn classify(&self, distance: f64) -> Option<OutlierFlag> {
        if distance < 0.0 {
            return Some(OutlierFlag::Negative);
        }
        if distance > self.outlier.max_range_m {
            return Some(OutlierFlag::OutOfRange);
        }
        if self.trailing.len() < 3 {
            return None;
        }
        let n = self.trailing.len() as f64;
        let mean = self.trailing.iter().sum::<f64>() / n;
        let std = (self.trailing.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if std < 1e-6 {
            return None;
        }
        ((distance - mean).abs() > self.outlier.sigma * std).then_some(OutlierFlag::Deviation)
    }

    pub fn latest(&self) -> Option<&RangingResult> {
        self.results.back()
    }

    pub fn results(&self) -> impl Iterator<Item = &RangingResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Write the kept results as JSON, one object per line.
    pub fn export_json_lines<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        for result in &self.results {
            serde_json::to_writer(&mut out, result)?;
            out.write_all(b"\n")?;
        }
        out.flush()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }
}
