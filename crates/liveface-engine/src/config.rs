use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use liveface_core::calibration::CalibrationParams;
use liveface_core::challenge::{ChallengeTiming, LOW_EAR_CUTOFF};
use liveface_core::frame::DEFAULT_DESCRIPTOR_DIM;
use liveface_core::history::DEFAULT_HISTORY_CAPACITY;
use liveface_core::matcher::DEFAULT_MATCH_THRESHOLD;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which face detector produced the landmark stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorVariant {
    /// Tiny face detector: fast, lower scores on good faces.
    Fast,
    /// SSD MobileNet: slower, better calibrated scores.
    Accurate,
}

impl DetectorVariant {
    pub fn default_min_confidence(self) -> f32 {
        match self {
            DetectorVariant::Fast => 0.5,
            DetectorVariant::Accurate => 0.6,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "tiny" => Some(DetectorVariant::Fast),
            "accurate" | "ssd" => Some(DetectorVariant::Accurate),
            _ => None,
        }
    }
}

/// Where verification decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Nearest neighbour against a cached copy of the registry's known faces.
    Local,
    /// The registry's verify endpoint decides.
    Remote,
}

impl VerifyMode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "client" => Some(VerifyMode::Local),
            "remote" | "server" => Some(VerifyMode::Remote),
            _ => None,
        }
    }
}

/// Order in which challenges are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ChallengeOrder {
    #[default]
    Fixed,
    /// Shuffle per session. Without a seed the order comes from OS entropy.
    Shuffled { seed: Option<u64> },
}

/// Engine configuration.
///
/// Defaults come from [`Config::default`]; a TOML file may override any
/// subset of fields and `LIVEFACE_*` environment variables override both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub detector: DetectorVariant,
    /// Detections scoring below this are treated as "no face".
    /// Defaults per detector variant when unset.
    pub min_confidence: Option<f32>,
    /// Descriptors collected before a registration may be submitted.
    pub required_samples: usize,
    pub verify_mode: VerifyMode,
    /// Euclidean distance below which a probe matches.
    pub match_threshold: f32,
    pub calibration_ms: u64,
    pub calibration_poll_ms: u64,
    pub challenge_timeout_ms: u64,
    pub challenge_poll_ms: u64,
    /// Pause after a detected challenge before the next is shown.
    pub acknowledge_ms: u64,
    pub history_capacity: usize,
    /// Subjects whose neutral EAR is below this skip the blink challenge.
    pub low_ear_cutoff: f32,
    pub challenge_order: ChallengeOrder,
    /// Base URL of the known-faces registry, e.g. `http://127.0.0.1:8080`.
    pub registry_url: String,
    pub request_timeout_secs: u64,
    pub descriptor_dim: usize,
    pub calibration: CalibrationParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            detector: DetectorVariant::Accurate,
            min_confidence: None,
            required_samples: 5,
            verify_mode: VerifyMode::Local,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            calibration_ms: 2200,
            calibration_poll_ms: 100,
            challenge_timeout_ms: 4500,
            challenge_poll_ms: 120,
            acknowledge_ms: 450,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            low_ear_cutoff: LOW_EAR_CUTOFF,
            challenge_order: ChallengeOrder::Fixed,
            registry_url: "http://127.0.0.1:8080".to_string(),
            request_timeout_secs: 10,
            descriptor_dim: DEFAULT_DESCRIPTOR_DIM,
            calibration: CalibrationParams::default(),
        }
    }
}

impl Config {
    /// Load configuration from `LIVEFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read a TOML file, then apply environment overrides on top.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from any `LIVEFACE_*` variables that are set and parse.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_str("LIVEFACE_DETECTOR").as_deref().and_then(DetectorVariant::parse) {
            self.detector = v;
        }
        if let Some(v) = env_parse::<f32>("LIVEFACE_MIN_CONFIDENCE") {
            self.min_confidence = Some(v);
        }
        if let Some(v) = env_str("LIVEFACE_VERIFY_MODE").as_deref().and_then(VerifyMode::parse) {
            self.verify_mode = v;
        }
        if let Some(url) = env_str("LIVEFACE_REGISTRY_URL") {
            self.registry_url = url;
        }

        self.required_samples = env_usize("LIVEFACE_REQUIRED_SAMPLES", self.required_samples);
        self.match_threshold = env_f32("LIVEFACE_MATCH_THRESHOLD", self.match_threshold);
        self.calibration_ms = env_u64("LIVEFACE_CALIBRATION_MS", self.calibration_ms);
        self.calibration_poll_ms =
            env_u64("LIVEFACE_CALIBRATION_POLL_MS", self.calibration_poll_ms);
        self.challenge_timeout_ms =
            env_u64("LIVEFACE_CHALLENGE_TIMEOUT_MS", self.challenge_timeout_ms);
        self.challenge_poll_ms = env_u64("LIVEFACE_CHALLENGE_POLL_MS", self.challenge_poll_ms);
        self.acknowledge_ms = env_u64("LIVEFACE_ACKNOWLEDGE_MS", self.acknowledge_ms);
        self.history_capacity = env_usize("LIVEFACE_HISTORY_CAPACITY", self.history_capacity);
        self.low_ear_cutoff = env_f32("LIVEFACE_LOW_EAR_CUTOFF", self.low_ear_cutoff);
        self.request_timeout_secs =
            env_u64("LIVEFACE_REQUEST_TIMEOUT_SECS", self.request_timeout_secs);
        self.descriptor_dim = env_usize("LIVEFACE_DESCRIPTOR_DIM", self.descriptor_dim);

        if let Some(seed) = env_parse::<u64>("LIVEFACE_SHUFFLE_SEED") {
            self.challenge_order = ChallengeOrder::Shuffled { seed: Some(seed) };
        } else if let Some(on) = env_str("LIVEFACE_SHUFFLE") {
            self.challenge_order = if on != "0" {
                ChallengeOrder::Shuffled { seed: None }
            } else {
                ChallengeOrder::Fixed
            };
        }
    }

    pub fn min_confidence(&self) -> f32 {
        self.min_confidence
            .unwrap_or_else(|| self.detector.default_min_confidence())
    }

    pub fn calibration_duration(&self) -> Duration {
        Duration::from_millis(self.calibration_ms)
    }

    pub fn calibration_poll(&self) -> Duration {
        Duration::from_millis(self.calibration_poll_ms.max(1))
    }

    pub fn challenge_poll(&self) -> Duration {
        Duration::from_millis(self.challenge_poll_ms.max(1))
    }

    pub fn challenge_timing(&self) -> ChallengeTiming {
        ChallengeTiming {
            timeout: Duration::from_millis(self.challenge_timeout_ms),
            acknowledge: Duration::from_millis(self.acknowledge_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f32(key: &str, default: f32) -> f32 {
    env_parse(key).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_parse(key).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_parse(key).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.required_samples, 5);
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.calibration_duration(), Duration::from_millis(2200));
        assert_eq!(config.challenge_timing().timeout, Duration::from_millis(4500));
        assert_eq!(config.challenge_timing().acknowledge, Duration::from_millis(450));
        assert_eq!(config.history_capacity, 120);
        assert_eq!(config.descriptor_dim, 128);
        assert_eq!(config.challenge_order, ChallengeOrder::Fixed);
    }

    #[test]
    fn test_min_confidence_per_detector() {
        let mut config = Config {
            detector: DetectorVariant::Fast,
            ..Config::default()
        };
        assert_eq!(config.min_confidence(), 0.5);
        config.detector = DetectorVariant::Accurate;
        assert_eq!(config.min_confidence(), 0.6);
        config.min_confidence = Some(0.8);
        assert_eq!(config.min_confidence(), 0.8);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            detector = "fast"
            verify_mode = "remote"
            required_samples = 3

            [challenge_order]
            mode = "shuffled"
            seed = 42

            [calibration]
            ear_factor = 0.7
            "#,
        )
        .unwrap();

        assert_eq!(config.detector, DetectorVariant::Fast);
        assert_eq!(config.verify_mode, VerifyMode::Remote);
        assert_eq!(config.required_samples, 3);
        assert_eq!(config.challenge_order, ChallengeOrder::Shuffled { seed: Some(42) });
        assert_eq!(config.calibration.ear_factor, 0.7);
        assert_eq!(config.calibration.smile_factor, 1.25);
        assert_eq!(config.challenge_timeout_ms, 4500);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            Config::from_toml("required_samples = \"five\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_variant_aliases() {
        assert_eq!(DetectorVariant::parse("tiny"), Some(DetectorVariant::Fast));
        assert_eq!(DetectorVariant::parse("SSD"), Some(DetectorVariant::Accurate));
        assert_eq!(VerifyMode::parse("server"), Some(VerifyMode::Remote));
        assert_eq!(VerifyMode::parse("bogus"), None);
    }
}
