//! Active liveness challenges and the session state machine that runs them.
//!
//! A printed photo or a still on a phone screen can pass a face detector, but
//! it cannot blink, turn, or smile on request within a few seconds. After
//! calibration, the session schedules a sequence of [`Challenge`]s and polls
//! each one's validator against the signal history until it passes or its
//! timeout expires.
//!
//! Validators are pure functions of `(SignalHistory, CalibrationBaseline)` and
//! only look at the most recent window of each buffer, so stale signals from
//! long ago cannot satisfy a challenge. Time is always passed in by the
//! caller; nothing here reads the clock.
//!
//! # Threat Coverage
//!
//! - **Blocks:** printed photographs, static images on a screen.
//! - **Does not block:** a replayed video that happens to contain the
//!   requested gestures in the requested order, or a 3D mask worn by a live
//!   person.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::calibration::CalibrationBaseline;
use crate::history::SignalHistory;

/// Number of most recent samples each validator inspects.
pub const VALIDATION_WINDOW: usize = 12;

/// Minimum head/mouth samples before the turn and smile validators engage.
pub const MIN_SAMPLES: usize = 6;

/// Closed-eye readings in the window required for a blink.
pub const BLINK_MIN_CLOSED: usize = 3;
/// Turned readings in the window required for a head turn.
pub const TURN_MIN_FRAMES: usize = 3;
/// Smiling readings in the window required for a smile.
pub const SMILE_MIN_FRAMES: usize = 4;

/// Users whose neutral EAR is below this skip the blink challenge.
pub const LOW_EAR_CUTOFF: f32 = 0.18;

pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_millis(4500);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(120);
pub const DEFAULT_ACKNOWLEDGE_DELAY: Duration = Duration::from_millis(450);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Challenge {
    Blink,
    TurnLeft,
    TurnRight,
    Smile,
}

impl Challenge {
    /// Default order, before low-EAR filtering or shuffling.
    pub const DEFAULT_ORDER: [Challenge; 4] = [
        Challenge::Blink,
        Challenge::TurnLeft,
        Challenge::TurnRight,
        Challenge::Smile,
    ];

    /// Instruction shown to the subject.
    pub fn label(self) -> &'static str {
        match self {
            Challenge::Blink => "Blink slowly",
            Challenge::TurnLeft => "Turn head slightly left",
            Challenge::TurnRight => "Turn head slightly right",
            Challenge::Smile => "Smile",
        }
    }

    pub fn validate(self, history: &SignalHistory, baseline: &CalibrationBaseline) -> bool {
        match self {
            Challenge::Blink => blink_detected(history, baseline),
            Challenge::TurnLeft => turned_left(history, baseline),
            Challenge::TurnRight => turned_right(history, baseline),
            Challenge::Smile => smile_detected(history, baseline),
        }
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// At least [`BLINK_MIN_CLOSED`] of the last [`VALIDATION_WINDOW`] EAR
/// readings fall below the calibrated threshold.
pub fn blink_detected(history: &SignalHistory, baseline: &CalibrationBaseline) -> bool {
    let closed = history
        .ear
        .window(VALIDATION_WINDOW)
        .filter(|&&ear| ear < baseline.ear_threshold)
        .count();
    closed >= BLINK_MIN_CLOSED
}

pub fn turned_left(history: &SignalHistory, baseline: &CalibrationBaseline) -> bool {
    if history.head_offset.len() < MIN_SAMPLES {
        return false;
    }
    let turned = history
        .head_offset
        .window(VALIDATION_WINDOW)
        .filter(|p| p.x < -baseline.head_x_threshold)
        .count();
    turned >= TURN_MIN_FRAMES
}

pub fn turned_right(history: &SignalHistory, baseline: &CalibrationBaseline) -> bool {
    if history.head_offset.len() < MIN_SAMPLES {
        return false;
    }
    let turned = history
        .head_offset
        .window(VALIDATION_WINDOW)
        .filter(|p| p.x > baseline.head_x_threshold)
        .count();
    turned >= TURN_MIN_FRAMES
}

pub fn smile_detected(history: &SignalHistory, baseline: &CalibrationBaseline) -> bool {
    if history.mouth_ratio.len() < MIN_SAMPLES {
        return false;
    }
    let smiling = history
        .mouth_ratio
        .window(VALIDATION_WINDOW)
        .filter(|&&ratio| ratio > baseline.smile_threshold)
        .count();
    smiling >= SMILE_MIN_FRAMES
}

/// Build the challenge order for a calibrated subject.
///
/// Blink is dropped when the neutral EAR is below `low_ear_cutoff`; the
/// relative order of the rest is preserved. When `rng` is given the result is
/// shuffled with it, so callers control determinism by choosing the source.
pub fn schedule<R: Rng + ?Sized>(
    baseline: &CalibrationBaseline,
    low_ear_cutoff: f32,
    rng: Option<&mut R>,
) -> Vec<Challenge> {
    let skip_blink = baseline.median_ear < low_ear_cutoff;
    let mut order: Vec<Challenge> = Challenge::DEFAULT_ORDER
        .into_iter()
        .filter(|c| !(skip_blink && *c == Challenge::Blink))
        .collect();
    if let Some(rng) = rng {
        order.shuffle(rng);
    }
    order
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Calibrating,
    Running,
    Passed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Passed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Calibrating => "calibrating",
            SessionState::Running => "running",
            SessionState::Passed => "passed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("cannot {action} while the session is {state}; reset first")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },
    #[error("liveness challenges require a completed calibration")]
    NotCalibrated,
}

/// A single challenge was not performed before its timeout.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("failed to complete \"{challenge}\" within {} ms; reset and try again", .timeout.as_millis())]
pub struct ChallengeTimeoutError {
    pub challenge: Challenge,
    pub timeout: Duration,
}

/// Per-challenge timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChallengeTiming {
    pub timeout: Duration,
    /// Pause after a detected challenge before the next one starts.
    pub acknowledge: Duration,
}

impl Default for ChallengeTiming {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CHALLENGE_TIMEOUT,
            acknowledge: DEFAULT_ACKNOWLEDGE_DELAY,
        }
    }
}

/// Outcome of one [`ChallengeSession::tick`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeEvent {
    /// Nothing changed; poll again later.
    Pending,
    /// A new challenge became current.
    Started {
        challenge: Challenge,
        index: usize,
        progress_percent: u8,
    },
    /// The current challenge validated; the next starts after the acknowledgement delay.
    Detected(Challenge),
    /// Every scheduled challenge validated.
    Passed,
    /// The current challenge timed out; the session is now failed.
    Failed(ChallengeTimeoutError),
}

/// Liveness session state machine:
/// `Idle → Calibrating → Idle(calibrated) → Running → {Passed | Failed}`.
///
/// Terminal states persist until [`ChallengeSession::reset`].
#[derive(Debug, Clone)]
pub struct ChallengeSession {
    state: SessionState,
    calibrated: bool,
    order: Vec<Challenge>,
    current_index: usize,
    progress_percent: u8,
    challenge_started_at: Option<Instant>,
    acknowledged_at: Option<Instant>,
    timing: ChallengeTiming,
}

impl ChallengeSession {
    pub fn new(timing: ChallengeTiming) -> Self {
        Self {
            state: SessionState::Idle,
            calibrated: false,
            order: Vec::new(),
            current_index: 0,
            progress_percent: 0,
            challenge_started_at: None,
            acknowledged_at: None,
            timing,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn order(&self) -> &[Challenge] {
        &self.order
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn progress_percent(&self) -> u8 {
        self.progress_percent
    }

    pub fn challenge_started_at(&self) -> Option<Instant> {
        self.challenge_started_at
    }

    /// The challenge currently being evaluated, if running.
    pub fn current_challenge(&self) -> Option<Challenge> {
        if self.state != SessionState::Running {
            return None;
        }
        self.order.get(self.current_index).copied()
    }

    pub fn timing(&self) -> &ChallengeTiming {
        &self.timing
    }

    /// Enter `Calibrating`. Only allowed from `Idle`.
    pub fn begin_calibration(&mut self) -> Result<(), SessionError> {
        self.require_idle("calibrate")?;
        self.state = SessionState::Calibrating;
        Ok(())
    }

    /// Leave `Calibrating` with a baseline stored by the caller.
    pub fn complete_calibration(&mut self) {
        if self.state == SessionState::Calibrating {
            self.state = SessionState::Idle;
            self.calibrated = true;
        }
    }

    /// Leave `Calibrating` without a baseline.
    pub fn abort_calibration(&mut self) {
        if self.state == SessionState::Calibrating {
            self.state = SessionState::Idle;
        }
    }

    /// Start running `order`. Requires `Idle` and a completed calibration.
    pub fn start(
        &mut self,
        order: Vec<Challenge>,
        now: Instant,
    ) -> Result<ChallengeEvent, SessionError> {
        self.require_idle("start liveness challenges")?;
        if !self.calibrated {
            return Err(SessionError::NotCalibrated);
        }

        self.order = order;
        self.current_index = 0;
        self.acknowledged_at = None;
        self.state = SessionState::Running;

        if self.order.is_empty() {
            return Ok(self.pass());
        }
        Ok(self.begin_current(now))
    }

    /// Advance the machine: poll the current validator or finish an
    /// acknowledgement pause.
    pub fn tick(
        &mut self,
        now: Instant,
        history: &SignalHistory,
        baseline: &CalibrationBaseline,
    ) -> ChallengeEvent {
        if self.state != SessionState::Running {
            return ChallengeEvent::Pending;
        }

        if let Some(acknowledged_at) = self.acknowledged_at {
            if now.saturating_duration_since(acknowledged_at) < self.timing.acknowledge {
                return ChallengeEvent::Pending;
            }
            self.acknowledged_at = None;
            self.current_index += 1;
            if self.current_index >= self.order.len() {
                return self.pass();
            }
            return self.begin_current(now);
        }

        let Some(challenge) = self.order.get(self.current_index).copied() else {
            return self.pass();
        };

        // A gesture seen after the deadline does not count.
        let started = self.challenge_started_at.unwrap_or(now);
        if now.saturating_duration_since(started) >= self.timing.timeout {
            self.state = SessionState::Failed;
            return ChallengeEvent::Failed(ChallengeTimeoutError {
                challenge,
                timeout: self.timing.timeout,
            });
        }

        if challenge.validate(history, baseline) {
            self.acknowledged_at = Some(now);
            return ChallengeEvent::Detected(challenge);
        }

        ChallengeEvent::Pending
    }

    /// Return to `Idle`, forgetting calibration and progress.
    pub fn reset(&mut self) {
        *self = Self::new(self.timing);
    }

    fn begin_current(&mut self, now: Instant) -> ChallengeEvent {
        let total = self.order.len().max(1);
        self.progress_percent = ((self.current_index * 200 + total) / (2 * total)) as u8;
        self.challenge_started_at = Some(now);
        ChallengeEvent::Started {
            challenge: self.order[self.current_index],
            index: self.current_index,
            progress_percent: self.progress_percent,
        }
    }

    fn pass(&mut self) -> ChallengeEvent {
        self.state = SessionState::Passed;
        self.progress_percent = 100;
        self.challenge_started_at = None;
        ChallengeEvent::Passed
    }

    fn require_idle(&self, action: &'static str) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }
}

impl Default for ChallengeSession {
    fn default() -> Self {
        Self::new(ChallengeTiming::default())
    }
}
