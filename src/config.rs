use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::audio::chirp::ChirpSpec;
use crate::audio::detector::DetectorConfig;
use crate::error::RangingError;
use crate::ranging::history::OutlierConfig;
use crate::ranging::smoothing::SmoothingConfig;
use crate::ranging::state::Role;

/// Whether the session keeps ranging after the first result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Continuous,
    SingleShot,
}

/// Exchange schedule, all in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Initiator chirps this long after opening its window.
    pub lead_in_secs: f64,
    /// Responder chirps this long after opening its window.
    pub response_delay_secs: f64,
    /// Extra listening time after the latest expected arrival.
    pub window_slack_secs: f64,
    /// Self-chirp search starts this long before the reported emission.
    pub self_guard_secs: f64,
    /// Self-chirp search extends this long past the end of the chirp.
    pub self_slack_secs: f64,
    /// Longest wait for a peer message before the sequence is abandoned.
    pub response_timeout_secs: f64,
    /// Pause between sequences in continuous mode.
    pub interval_secs: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            lead_in_secs: 0.05,
            response_delay_secs: 0.25,
            window_slack_secs: 0.1,
            self_guard_secs: 0.01,
            self_slack_secs: 0.05,
            response_timeout_secs: 2.0,
            interval_secs: 0.2,
        }
    }
}

/// Everything that shapes one device's side of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangingConfig {
    pub chirp: ChirpSpec,
    pub detector: DetectorConfig,
    pub timing: TimingConfig,
    pub outlier: OutlierConfig,
    pub smoothing: SmoothingConfig,
    /// `None` keeps every result.
    pub history_capacity: Option<usize>,
    pub speed_of_sound: f64,
    pub max_consecutive_failures: u32,
    pub mode: Mode,
}

impl Default for RangingConfig {
    fn default() -> Self {
        Self {
            chirp: ChirpSpec::default(),
            detector: DetectorConfig::default(),
            timing: TimingConfig::default(),
            outlier: OutlierConfig::default(),
            smoothing: SmoothingConfig::default(),
            history_capacity: Some(100),
            speed_of_sound: 343.0,
            max_consecutive_failures: 5,
            mode: Mode::Continuous,
        }
    }
}

impl RangingConfig {
    pub fn secs_to_samples(&self, secs: f64) -> usize {
        (secs * self.chirp.sample_rate_hz as f64).round().max(0.0) as usize
    }

    /// Length of every listening window: covers the responder's delayed chirp
    /// plus the longest flight time and some slack.
    pub fn listen_secs(&self) -> f64 {
        let t = &self.timing;
        t.response_delay_secs
            + self.chirp.duration_secs as f64
            + self.outlier.max_range_m / self.speed_of_sound
            + t.window_slack_secs
    }

    /// How late the initiator may open its window, relative to the responder,
    /// before its chirp runs into the responder's self window. This is the
    /// one-way latency allowed for the echoed RANGING_START.
    pub fn echo_latency_budget_secs(&self) -> f64 {
        let t = &self.timing;
        t.response_delay_secs
            - t.self_guard_secs
            - t.lead_in_secs
            - self.chirp.duration_secs as f64
            - self.outlier.max_range_m / self.speed_of_sound
    }

    pub fn listen_samples(&self) -> usize {
        self.secs_to_samples(self.listen_secs())
    }

    /// Offset of our chirp inside our own listening window.
    pub fn emit_delay(&self, role: Role) -> Duration {
        let secs = match role {
            Role::Initiator => self.timing.lead_in_secs,
            Role::Responder => self.timing.response_delay_secs,
        };
        Duration::from_secs_f64(secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timing.response_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.timing.interval_secs)
    }

    pub fn validate(&self) -> std::result::Result<(), RangingError> {
        self.chirp.validate()?;
        let t = &self.timing;
        let chirp = self.chirp.duration_secs as f64;
        let durations = [
            t.lead_in_secs,
            t.response_delay_secs,
            t.window_slack_secs,
            t.self_guard_secs,
            t.self_slack_secs,
            t.response_timeout_secs,
            t.interval_secs,
        ];
        if durations.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(RangingError::InvalidConfig(
                "timing values must be finite and non-negative".into(),
            ));
        }
        // The initiator's self window must close before the responder's chirp can arrive
        let earliest_peer = t.response_delay_secs;
        let self_window_end = t.lead_in_secs + chirp + t.self_slack_secs;
        if earliest_peer <= self_window_end + chirp {
            return Err(RangingError::InvalidConfig(format!(
                "response delay {:.3}s too short for lead-in {:.3}s and a {:.3}s chirp",
                t.response_delay_secs, t.lead_in_secs, chirp
            )));
        }
        if self.echo_latency_budget_secs() <= 0.0 {
            return Err(RangingError::InvalidConfig(format!(
                "response delay {:.3}s leaves no time for the echoed RANGING_START",
                t.response_delay_secs
            )));
        }
        if t.lead_in_secs < t.self_guard_secs {
            return Err(RangingError::InvalidConfig(
                "lead-in must be at least the self guard".into(),
            ));
        }
        if !(self.speed_of_sound > 0.0) {
            return Err(RangingError::InvalidConfig("speed of sound must be positive".into()));
        }
        if !(self.outlier.max_range_m > 0.0) {
            return Err(RangingError::InvalidConfig("max range must be positive".into()));
        }
        let d = &self.detector;
        if !(0.0..=1.0).contains(&d.detection_threshold) || d.peak_margin < 0.0 {
            return Err(RangingError::InvalidConfig(
                "detection threshold must be in [0, 1] and peak margin non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Per-device calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Distance from this device's speaker to its own microphone.
    pub speaker_to_mic_distance_m: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            speaker_to_mic_distance_m: 0.15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub device_name: String,
    pub listen_port: u16,
    pub anchor_addr: String,
    pub log_dir: String,
    pub calibration: Calibration,
    pub ranging: RangingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = RangingConfig::default();
        let mut ranging = defaults;

        ranging.speed_of_sound = parse_var(&lookup, "BEEPBEEP_SPEED_OF_SOUND", defaults.speed_of_sound)?;
        ranging.detector.detection_threshold = parse_var(
            &lookup,
            "BEEPBEEP_DETECTION_THRESHOLD",
            defaults.detector.detection_threshold,
        )?;
        ranging.detector.peak_margin =
            parse_var(&lookup, "BEEPBEEP_PEAK_MARGIN", defaults.detector.peak_margin)?;
        ranging.outlier.sigma = parse_var(&lookup, "BEEPBEEP_OUTLIER_SIGMA", defaults.outlier.sigma)?;
        ranging.max_consecutive_failures = parse_var(
            &lookup,
            "BEEPBEEP_MAX_FAILURES",
            defaults.max_consecutive_failures,
        )?;
        let interval_ms: u64 = parse_var(
            &lookup,
            "BEEPBEEP_INTERVAL_MS",
            (defaults.timing.interval_secs * 1000.0) as u64,
        )?;
        ranging.timing.interval_secs = interval_ms as f64 / 1000.0;
        let response_delay_ms: u64 = parse_var(
            &lookup,
            "BEEPBEEP_RESPONSE_DELAY_MS",
            (defaults.timing.response_delay_secs * 1000.0) as u64,
        )?;
        ranging.timing.response_delay_secs = response_delay_ms as f64 / 1000.0;

        let speaker_to_mic_distance_m = parse_var(
            &lookup,
            "BEEPBEEP_SPEAKER_MIC_M",
            Calibration::default().speaker_to_mic_distance_m,
        )?;

        ranging
            .validate()
            .context("Ranging configuration from environment is invalid")?;

        Ok(Self {
            device_name: lookup("BEEPBEEP_DEVICE_NAME").unwrap_or_else(|| "beepbeep".into()),
            listen_port: parse_var(&lookup, "BEEPBEEP_LISTEN_PORT", 12345)?,
            anchor_addr: lookup("BEEPBEEP_ANCHOR_ADDR").unwrap_or_else(|| "127.0.0.1:12345".into()),
            log_dir: lookup("BEEPBEEP_LOG_DIR").unwrap_or_else(|| "logs".into()),
            calibration: Calibration {
                speaker_to_mic_distance_m,
            },
            ranging,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.listen_port, 12345);
        assert_eq!(config.calibration.speaker_to_mic_distance_m, 0.15);
        assert_eq!(config.ranging, RangingConfig::default());
    }

    #[test]
    fn test_variables_override_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("BEEPBEEP_DEVICE_NAME", "kitchen"),
            ("BEEPBEEP_LISTEN_PORT", "4000"),
            ("BEEPBEEP_SPEAKER_MIC_M", "0.12"),
            ("BEEPBEEP_PEAK_MARGIN", "0.05"),
            ("BEEPBEEP_INTERVAL_MS", "750"),
            ("BEEPBEEP_RESPONSE_DELAY_MS", "400"),
        ]))
        .unwrap();
        assert_eq!(config.device_name, "kitchen");
        assert_eq!(config.listen_port, 4000);
        assert_eq!(config.calibration.speaker_to_mic_distance_m, 0.12);
        assert_eq!(config.ranging.detector.peak_margin, 0.05);
        assert_eq!(config.ranging.timing.interval_secs, 0.75);
        assert_eq!(config.ranging.timing.response_delay_secs, 0.4);
        // A longer response delay buys the link more latency
        let default_budget = RangingConfig::default().echo_latency_budget_secs();
        assert!((config.ranging.echo_latency_budget_secs() - default_budget - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_unparsable_value_names_the_variable() {
        let err = Config::from_lookup(lookup(&[("BEEPBEEP_LISTEN_PORT", "lots")])).unwrap_err();
        assert!(err.to_string().contains("BEEPBEEP_LISTEN_PORT"));
    }

    #[test]
    fn test_default_schedule_is_consistent() {
        let config = RangingConfig::default();
        assert!(config.validate().is_ok());
        // 0.25 + 0.025 + 10/343 + 0.1 seconds
        let expected = ((0.25 + 0.025 + 10.0 / 343.0 + 0.1) * 48_000.0f64).round() as usize;
        assert_eq!(config.listen_samples(), expected);
        assert_eq!(config.emit_delay(Role::Responder), Duration::from_millis(250));
    }

    #[test]
    fn test_default_schedule_tolerates_slow_links() {
        // 0.25 - 0.01 - 0.05 - 0.025 - 10/343
        let budget = RangingConfig::default().echo_latency_budget_secs();
        assert!((budget - (0.165 - 10.0 / 343.0)).abs() < 1e-9);
        assert!(budget > 0.1);
    }

    #[test]
    fn test_validate_rejects_schedule_without_latency_budget() {
        let mut config = RangingConfig::default();
        config.outlier.max_range_m = 60.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("echoed RANGING_START"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_crowded_schedule() {
        let mut config = RangingConfig::default();
        config.timing.response_delay_secs = 0.08;
        assert!(matches!(config.validate(), Err(RangingError::InvalidConfig(_))));
    }
}
