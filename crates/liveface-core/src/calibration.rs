//! Per-user neutral-face calibration.
//!
//! Eye shape and resting mouth shape vary a lot between people, so fixed
//! thresholds either miss blinks on narrow eyes or fire on wide ones. Before
//! any challenge runs, the subject holds a neutral face for a short window and
//! the medians of the recorded EAR and mouth ratio become the baseline from
//! which the challenge thresholds are derived.
//!
//! The thresholds are always clamped into a safe absolute range so that a
//! pathological calibration (eyes half closed, mouth open) cannot produce a
//! validator that passes or fails unconditionally.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::history::SignalHistory;

pub const DEFAULT_CALIBRATION_DURATION: Duration = Duration::from_millis(2200);

/// How many of the most recent samples feed each median.
pub const CALIBRATION_WINDOW: usize = 60;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("no face detected; position your face in the frame and calibrate again")]
    NoFace,
}

/// Tunable constants for threshold derivation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationParams {
    /// Fraction of the neutral EAR below which the eye counts as closed.
    pub ear_factor: f32,
    pub min_ear_allowed: f32,
    pub max_ear_allowed: f32,
    /// Multiple of the neutral mouth ratio above which the face counts as smiling.
    pub smile_factor: f32,
    /// Floor for the smile threshold, also the fallback neutral mouth ratio.
    pub smile_ratio_min: f32,
    pub head_x_threshold: f32,
    /// Neutral EAR assumed when no samples were recorded.
    pub fallback_ear: f32,
    pub window: usize,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            ear_factor: 0.72,
            min_ear_allowed: 0.09,
            max_ear_allowed: 0.48,
            smile_factor: 1.25,
            smile_ratio_min: 1.2,
            head_x_threshold: 0.08,
            fallback_ear: 0.32,
            window: CALIBRATION_WINDOW,
        }
    }
}

/// Neutral-face statistics and the thresholds derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBaseline {
    pub median_ear: f32,
    pub median_mouth_ratio: f32,
    pub ear_threshold: f32,
    pub smile_threshold: f32,
    pub head_x_threshold: f32,
}

impl CalibrationBaseline {
    pub fn from_medians(
        median_ear: f32,
        median_mouth_ratio: f32,
        params: &CalibrationParams,
    ) -> Self {
        Self {
            median_ear,
            median_mouth_ratio,
            ear_threshold: ear_threshold(median_ear, params),
            smile_threshold: smile_threshold(median_mouth_ratio, params),
            head_x_threshold: params.head_x_threshold,
        }
    }

    /// Derive a baseline from the most recent `params.window` samples.
    /// Missing samples fall back to `fallback_ear` / `smile_ratio_min`.
    pub fn from_history(history: &SignalHistory, params: &CalibrationParams) -> Self {
        let ears: Vec<f32> = history.ear.window(params.window).copied().collect();
        let mouths: Vec<f32> = history.mouth_ratio.window(params.window).copied().collect();

        let median_ear = median(&ears).unwrap_or(params.fallback_ear);
        let median_mouth = median(&mouths).unwrap_or(params.smile_ratio_min);

        Self::from_medians(median_ear, median_mouth, params)
    }
}

/// Median of the finite values; `None` if there are none.
///
/// Even-length inputs yield the mean of the two middle values.
pub fn median(values: &[f32]) -> Option<f32> {
    let mut sorted: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f32::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// `clamp(median_ear * ear_factor, min_ear_allowed, max_ear_allowed)`.
pub fn ear_threshold(median_ear: f32, params: &CalibrationParams) -> f32 {
    let raw = median_ear * params.ear_factor;
    if raw.is_nan() {
        return params.min_ear_allowed;
    }
    raw.clamp(params.min_ear_allowed, params.max_ear_allowed)
}

/// `max(smile_ratio_min, median_mouth_ratio * smile_factor)`.
pub fn smile_threshold(median_mouth_ratio: f32, params: &CalibrationParams) -> f32 {
    (median_mouth_ratio * params.smile_factor).max(params.smile_ratio_min)
}

/// A calibration window in progress.
///
/// The calibrator does not drive frame capture: the frame loop keeps filling
/// the history while the owner polls [`Calibration::is_complete`] at a coarse
/// cadence and calls [`Calibration::finish`] once the window has elapsed.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    started_at: Instant,
    duration: Duration,
}

impl Calibration {
    pub fn start(now: Instant, duration: Duration) -> Self {
        Self {
            started_at: now,
            duration,
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn is_complete(&self, now: Instant) -> bool {
        self.elapsed(now) >= self.duration
    }

    pub fn finish(
        self,
        history: &SignalHistory,
        params: &CalibrationParams,
    ) -> CalibrationBaseline {
        CalibrationBaseline::from_history(history, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{HeadOffset, SignalSample};

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_median_cases() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[0.4]), Some(0.4));
        assert!(approx(median(&[0.2, 0.4]).unwrap(), 0.3));
        assert_eq!(median(&[5.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0, 5.0]), Some(3.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn test_median_ignores_non_finite() {
        assert_eq!(median(&[f32::NAN, 1.0, f32::INFINITY]), Some(1.0));
        assert_eq!(median(&[f32::NAN]), None);
    }

    #[test]
    fn test_ear_threshold_example() {
        let params = CalibrationParams::default();
        assert!(approx(ear_threshold(0.30, &params), 0.216));
    }

    #[test]
    fn test_ear_threshold_always_clamped() {
        let params = CalibrationParams::default();
        for ear in [0.0, 0.01, 0.12, 0.3, 0.66, 1.0, 10.0, 1e9, f32::MAX, f32::INFINITY] {
            let thr = ear_threshold(ear, &params);
            assert!(
                (params.min_ear_allowed..=params.max_ear_allowed).contains(&thr),
                "ear {ear} produced {thr}"
            );
        }
        assert_eq!(ear_threshold(0.0, &params), 0.09);
        assert_eq!(ear_threshold(1e9, &params), 0.48);
    }

    #[test]
    fn test_smile_threshold_floor() {
        let params = CalibrationParams::default();
        assert!(approx(smile_threshold(1.5, &params), 1.875));
        assert_eq!(smile_threshold(0.5, &params), 1.2);
    }

    #[test]
    fn test_baseline_from_medians() {
        let baseline = CalibrationBaseline::from_medians(0.30, 1.50, &CalibrationParams::default());
        assert!(approx(baseline.ear_threshold, 0.216));
        assert!(approx(baseline.smile_threshold, 1.875));
        assert_eq!(baseline.head_x_threshold, 0.08);
    }

    #[test]
    fn test_baseline_from_empty_history_uses_fallbacks() {
        let params = CalibrationParams::default();
        let baseline = CalibrationBaseline::from_history(&SignalHistory::new(120), &params);
        assert_eq!(baseline.median_ear, 0.32);
        assert_eq!(baseline.median_mouth_ratio, 1.2);
        assert!(approx(baseline.ear_threshold, 0.32 * 0.72));
        assert!(approx(baseline.smile_threshold, 1.5));
    }

    #[test]
    fn test_baseline_uses_only_recent_window() {
        let mut history = SignalHistory::new(120);
        // 60 old frames with eyes nearly shut, then 60 neutral frames.
        for ear in std::iter::repeat(0.05).take(60).chain(std::iter::repeat(0.30).take(60)) {
            history.record(&SignalSample {
                ear,
                mouth_ratio: 1.5,
                head_offset: HeadOffset::default(),
            });
        }
        let baseline = CalibrationBaseline::from_history(&history, &CalibrationParams::default());
        assert_eq!(baseline.median_ear, 0.30);
    }

    #[test]
    fn test_calibration_window_timing() {
        let t0 = Instant::now();
        let cal = Calibration::start(t0, DEFAULT_CALIBRATION_DURATION);
        assert!(!cal.is_complete(t0 + Duration::from_millis(2100)));
        assert!(cal.is_complete(t0 + Duration::from_millis(2200)));
        assert_eq!(cal.elapsed(t0), Duration::ZERO);
    }
}
