/// Smoothing filters for the distance stream.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Scale factor making the median absolute deviation comparable to a standard deviation.
const MAD_TO_STD: f64 = 1.4826;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SmoothingConfig {
    None,
    /// Median over a window, with a MAD gate that rejects wild values.
    Median { window: usize, outlier_threshold: f64 },
    MovingAverage { window: usize, weighted: bool },
    Kalman { process_variance: f64, measurement_variance: f64 },
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        SmoothingConfig::Median {
            window: 5,
            outlier_threshold: 2.0,
        }
    }
}

/// A configured smoothing filter.
#[derive(Debug, Clone)]
pub enum Smoother {
    None,
    Median(MedianFilter),
    MovingAverage(MovingAverage),
    Kalman(Kalman),
}

impl Smoother {
    pub fn new(config: SmoothingConfig) -> Self {
        match config {
            SmoothingConfig::None => Smoother::None,
            SmoothingConfig::Median {
                window,
                outlier_threshold,
            } => Smoother::Median(MedianFilter::new(window, outlier_threshold)),
            SmoothingConfig::MovingAverage { window, weighted } => {
                Smoother::MovingAverage(MovingAverage::new(window, weighted))
            }
            SmoothingConfig::Kalman {
                process_variance,
                measurement_variance,
            } => Smoother::Kalman(Kalman::new(process_variance, measurement_variance)),
        }
    }

    /// Feed one measurement; `None` if the filter rejected it or smoothing is off.
    pub fn update(&mut self, value: f64) -> Option<f64> {
        match self {
            Smoother::None => None,
            Smoother::Median(f) => f.update(value),
            Smoother::MovingAverage(f) => Some(f.update(value)),
            Smoother::Kalman(f) => Some(f.update(value)),
        }
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct MedianFilter {
    window: usize,
    outlier_threshold: f64,
    values: VecDeque<f64>,
}

impl MedianFilter {
    pub fn new(window: usize, outlier_threshold: f64) -> Self {
        Self {
            window: window.max(1),
            outlier_threshold,
            values: VecDeque::with_capacity(window),
        }
    }

    pub fn update(&mut self, value: f64) -> Option<f64> {
        if self.values.len() >= 3 && self.is_outlier(value) {
            tracing::debug!(value, "Median filter rejected value");
            return None;
        }
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(value);
        Some(median(self.values.iter().copied()))
    }

    fn is_outlier(&self, value: f64) -> bool {
        let center = median(self.values.iter().copied());
        let mad = median(self.values.iter().map(|v| (v - center).abs()));
        if mad < 1e-6 {
            // Flat history: fall back to the standard deviation
            let n = self.values.len() as f64;
            let mean = self.values.iter().sum::<f64>() / n;
            let std = (self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            if std < 1e-6 {
                return false;
            }
            return (value - center).abs() > self.outlier_threshold * std;
        }
        (value - center).abs() > self.outlier_threshold * MAD_TO_STD * mad
    }
}

#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    weighted: bool,
    values: VecDeque<f64>,
}

impl MovingAverage {
    pub fn new(window: usize, weighted: bool) -> Self {
        Self {
            window: window.max(1),
            weighted,
            values: VecDeque::with_capacity(window),
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(value);

        if self.weighted {
            // Newest value weighs the most: weights 1..=n
            let (sum, total) = self
                .values
                .iter()
                .enumerate()
                .fold((0.0, 0.0), |(sum, total), (i, v)| {
                    let w = (i + 1) as f64;
                    (sum + w * v, total + w)
                });
            sum / total
        } else {
            self.values.iter().sum::<f64>() / self.values.len() as f64
        }
    }
}

/// Scalar Kalman filter with a constant-position model.
#[derive(Debug, Clone)]
pub struct Kalman {
    process_variance: f64,
    measurement_variance: f64,
    estimate: Option<f64>,
    estimate_error: f64,
}

impl Kalman {
    pub fn new(process_variance: f64, measurement_variance: f64) -> Self {
        Self {
            process_variance,
            measurement_variance,
            estimate: None,
            estimate_error: 1.0,
        }
    }

    pub fn update(&mut self, measurement: f64) -> f64 {
        let Some(prediction) = self.estimate else {
            self.estimate = Some(measurement);
            self.estimate_error = 1.0;
            return measurement;
        };
        let prediction_error = self.estimate_error + self.process_variance;
        let gain = prediction_error / (prediction_error + self.measurement_variance);
        let estimate = prediction + gain * (measurement - prediction);
        self.estimate_error = (1.0 - gain) * prediction_error;
        self.estimate = Some(estimate);
        estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_filter_rejects_spike() {
        let mut filter = MedianFilter::new(5, 2.0);
        for v in [1.00, 1.02, 0.98, 1.01] {
            assert!(filter.update(v).is_some());
        }
        assert_eq!(filter.update(5.0), None);
        let smoothed = filter.update(1.03).unwrap();
        assert!((smoothed - 1.01).abs() < 1e-9, "smoothed {}", smoothed);
    }

    #[test]
    fn test_median_filter_flat_history_accepts_anything() {
        let mut filter = MedianFilter::new(5, 2.0);
        for _ in 0..4 {
            filter.update(2.0);
        }
        // Zero spread: nothing to compare against
        assert!(filter.update(9.0).is_some());
    }

    #[test]
    fn test_moving_average_weighted_favors_recent() {
        let mut plain = MovingAverage::new(3, false);
        let mut weighted = MovingAverage::new(3, true);
        for v in [1.0, 2.0, 3.0, 4.0] {
            plain.update(v);
            weighted.update(v);
        }
        // Window is [2, 3, 4]
        assert!((plain.update(4.0) - (3.0 + 4.0 + 4.0) / 3.0).abs() < 1e-12);
        // [3, 4, 5] weighted 1,2,3
        let w = weighted.update(5.0);
        assert!((w - (3.0 + 8.0 + 15.0) / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_kalman_converges_toward_measurements() {
        let mut kalman = Kalman::new(1e-5, 0.01);
        assert_eq!(kalman.update(2.0), 2.0);
        let mut last = 0.0;
        for _ in 0..50 {
            last = kalman.update(3.0);
        }
        assert!(last > 2.9 && last <= 3.0, "estimate {}", last);
    }

    #[test]
    fn test_smoother_none_reports_nothing() {
        let mut s = Smoother::new(SmoothingConfig::None);
        assert_eq!(s.update(1.0), None);
    }
}
