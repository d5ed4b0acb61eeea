//! Owned state of one liveness/enrollment session.
//!
//! [`SessionContext`] is synchronous and never reads the clock: the actor in
//! [`crate::engine`] feeds it frames and timestamps and decides when to poll.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;

use liveface_core::api::RegisterFaceRequest;
use liveface_core::calibration::{Calibration, CalibrationBaseline, CalibrationError};
use liveface_core::challenge::{
    self, Challenge, ChallengeEvent, ChallengeSession, SessionError, SessionState,
};
use liveface_core::descriptor::{self, EnrollmentSampleSet, SampleOutcome};
use liveface_core::frame::LandmarkFrame;
use liveface_core::history::SignalHistory;
use liveface_core::matcher::{EuclideanMatcher, FaceProfile, Matcher, VerificationResult};
use liveface_core::signals::{self, SignalExtractionError};

use crate::config::{ChallengeOrder, Config};
use crate::error::{EngineError, PreconditionError};

/// Why a detector event produced no signal sample.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("no face detected")]
    NoFace,
    #[error("detection score {score:.2} below minimum {min:.2}")]
    LowConfidence { score: f32, min: f32 },
    #[error("signal extraction failed: {0}")]
    Extraction(#[from] SignalExtractionError),
}

/// Observable session state, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub challenge: Option<Challenge>,
    pub progress_percent: u8,
    pub face_detected: bool,
    pub confidence_percent: u8,
    pub registering: bool,
    pub samples_collected: usize,
    pub samples_required: usize,
    pub baseline: Option<CalibrationBaseline>,
    pub status: String,
}

impl SessionSnapshot {
    /// Instruction for the current challenge, if one is running.
    pub fn challenge_label(&self) -> Option<&'static str> {
        self.challenge.map(Challenge::label)
    }
}

pub struct SessionContext {
    config: Config,
    history: SignalHistory,
    challenge: ChallengeSession,
    calibration: Option<Calibration>,
    baseline: Option<CalibrationBaseline>,
    samples: EnrollmentSampleSet,
    registering: bool,
    last_face: Option<LandmarkFrame>,
    known_faces: Vec<FaceProfile>,
    rng: Option<StdRng>,
    status: String,
}

impl SessionContext {
    pub fn new(config: Config) -> Self {
        let rng = match config.challenge_order {
            ChallengeOrder::Fixed => None,
            ChallengeOrder::Shuffled { seed: Some(seed) } => Some(StdRng::seed_from_u64(seed)),
            ChallengeOrder::Shuffled { seed: None } => Some(StdRng::from_entropy()),
        };
        Self {
            history: SignalHistory::new(config.history_capacity),
            challenge: ChallengeSession::new(config.challenge_timing()),
            calibration: None,
            baseline: None,
            samples: EnrollmentSampleSet::new(config.required_samples),
            registering: false,
            last_face: None,
            known_faces: Vec::new(),
            rng,
            status: "Position your face in the frame".to_string(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.challenge.state()
    }

    pub fn history(&self) -> &SignalHistory {
        &self.history
    }

    pub fn baseline(&self) -> Option<&CalibrationBaseline> {
        self.baseline.as_ref()
    }

    pub fn face_detected(&self) -> bool {
        self.last_face.is_some()
    }

    pub fn samples(&self) -> &EnrollmentSampleSet {
        &self.samples
    }

    pub fn known_faces(&self) -> &[FaceProfile] {
        &self.known_faces
    }

    pub fn set_known_faces(&mut self, faces: Vec<FaceProfile>) {
        self.known_faces = faces;
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    /// Handle one detector event. `None` means the detector saw no face.
    ///
    /// Frames below the confidence floor count as "no face". A frame whose
    /// landmarks cannot be turned into signals still counts as a detected
    /// face but leaves the histories untouched.
    pub fn process_frame(&mut self, frame: Option<LandmarkFrame>) -> Result<(), FrameError> {
        let Some(frame) = frame else {
            self.last_face = None;
            return Err(FrameError::NoFace);
        };

        let min = self.config.min_confidence();
        if frame.detection_score < min {
            self.last_face = None;
            return Err(FrameError::LowConfidence {
                score: frame.detection_score,
                min,
            });
        }

        let extracted = signals::extract(&frame);
        if let Ok(sample) = &extracted {
            self.history.record(sample);
        }

        if self.registering && self.state() == SessionState::Passed {
            self.collect_sample(&frame);
        }

        self.last_face = Some(frame);
        extracted.map(|_| ()).map_err(FrameError::from)
    }

    /// The detector stream ended; nothing is in view any more.
    pub fn source_stopped(&mut self) {
        self.last_face = None;
    }

    fn collect_sample(&mut self, frame: &LandmarkFrame) {
        let Some(descriptor) = frame.descriptor.as_deref() else {
            return;
        };
        if descriptor.len() != self.config.descriptor_dim {
            tracing::debug!(
                got = descriptor.len(),
                expected = self.config.descriptor_dim,
                "skipping descriptor of unexpected dimension"
            );
            return;
        }
        match self.samples.push(descriptor) {
            SampleOutcome::Added(count) => {
                tracing::debug!(
                    count,
                    required = self.samples.required(),
                    "enrollment sample collected"
                );
                self.status = format!(
                    "Collected {count}/{} samples",
                    self.samples.required()
                );
            }
            SampleOutcome::Full => {}
            SampleOutcome::Rejected(e) => {
                tracing::debug!(error = %e, "enrollment sample rejected");
            }
        }
    }

    /// Enter `Calibrating`. Requires a face in view and an idle session.
    pub fn begin_calibration(&mut self, now: Instant) -> Result<(), EngineError> {
        if !self.face_detected() {
            self.status = "Face not detected; position your face".to_string();
            return Err(CalibrationError::NoFace.into());
        }
        self.challenge.begin_calibration()?;
        self.calibration = Some(Calibration::start(now, self.config.calibration_duration()));
        self.status = "Calibrating; keep a neutral face".to_string();
        tracing::info!(duration_ms = self.config.calibration_ms, "calibration started");
        Ok(())
    }

    pub fn calibration_complete(&self, now: Instant) -> bool {
        self.calibration.is_some_and(|c| c.is_complete(now))
    }

    /// Derive and store the baseline from the samples recorded so far.
    pub fn finish_calibration(&mut self) -> Option<CalibrationBaseline> {
        let calibration = self.calibration.take()?;
        let baseline = calibration.finish(&self.history, &self.config.calibration);
        self.baseline = Some(baseline);
        self.challenge.complete_calibration();
        self.status = format!(
            "Calibrated (ear {:.2}, mouth {:.2})",
            baseline.median_ear, baseline.median_mouth_ratio
        );
        tracing::info!(
            median_ear = baseline.median_ear,
            median_mouth_ratio = baseline.median_mouth_ratio,
            ear_threshold = baseline.ear_threshold,
            smile_threshold = baseline.smile_threshold,
            "calibration complete"
        );
        Some(baseline)
    }

    /// Schedule and start the challenges. Requires a completed calibration.
    pub fn start_challenges(&mut self, now: Instant) -> Result<ChallengeEvent, EngineError> {
        let baseline = self.baseline.ok_or(SessionError::NotCalibrated)?;
        let order = challenge::schedule(&baseline, self.config.low_ear_cutoff, self.rng.as_mut());
        tracing::info!(?order, "liveness challenges started");
        let event = self.challenge.start(order, now)?;
        self.apply_event(&event);
        Ok(event)
    }

    /// Poll the running challenge.
    pub fn tick(&mut self, now: Instant) -> ChallengeEvent {
        let Some(baseline) = self.baseline else {
            return ChallengeEvent::Pending;
        };
        let event = self.challenge.tick(now, &self.history, &baseline);
        self.apply_event(&event);
        event
    }

    fn apply_event(&mut self, event: &ChallengeEvent) {
        match event {
            ChallengeEvent::Pending => {}
            ChallengeEvent::Started { challenge, index, .. } => {
                tracing::debug!(%challenge, index, "challenge started");
                self.status = format!("Please: {challenge}");
            }
            ChallengeEvent::Detected(challenge) => {
                tracing::info!(%challenge, "challenge detected");
                self.status = format!("{challenge} detected");
            }
            ChallengeEvent::Passed => {
                tracing::info!("liveness check passed");
                self.status = "Liveness check passed".to_string();
            }
            ChallengeEvent::Failed(e) => {
                tracing::warn!(challenge = %e.challenge, "liveness challenge timed out");
                self.status = format!("Failed to {}", e.challenge.label().to_lowercase());
            }
        }
    }

    /// Begin collecting enrollment descriptors from subsequent frames.
    pub fn start_capture(&mut self) -> Result<(), EngineError> {
        if self.state() != SessionState::Passed {
            return Err(PreconditionError::LivenessNotPassed.into());
        }
        self.registering = true;
        self.samples.clear();
        self.status = format!("Capturing {} samples", self.samples.required());
        tracing::info!(required = self.samples.required(), "enrollment capture started");
        Ok(())
    }

    /// Check submission preconditions in order and build the request body.
    ///
    /// Capture stops once a request has been built.
    pub fn prepare_registration(
        &mut self,
        username: &str,
    ) -> Result<RegisterFaceRequest, EngineError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(PreconditionError::MissingUsername.into());
        }
        if !self.face_detected() {
            return Err(PreconditionError::NoFace.into());
        }
        if self.state() != SessionState::Passed {
            return Err(PreconditionError::LivenessNotPassed.into());
        }
        if !self.samples.is_complete() {
            return Err(PreconditionError::InsufficientSamples {
                required: self.samples.required(),
                collected: self.samples.len(),
            }
            .into());
        }

        let descriptor = self.samples.average()?;
        self.registering = false;
        self.status = "Creating descriptor and sending to registry".to_string();
        Ok(RegisterFaceRequest {
            username: username.to_string(),
            descriptor,
        })
    }

    /// Descriptor of the most recent detected frame, for verification.
    pub fn probe_descriptor(&self) -> Result<Vec<f32>, EngineError> {
        let frame = self.last_face.as_ref().ok_or(PreconditionError::NoFace)?;
        let descriptor = frame
            .descriptor
            .as_deref()
            .ok_or(PreconditionError::MissingDescriptor)?;
        descriptor::check_dimension(descriptor, self.config.descriptor_dim)?;
        Ok(descriptor.to_vec())
    }

    /// Nearest-neighbour match against the cached known faces.
    pub fn verify_local(&mut self, probe: &[f32]) -> VerificationResult {
        let result =
            EuclideanMatcher.compare(probe, &self.known_faces, self.config.match_threshold);
        self.record_verification(&result);
        result
    }

    pub fn record_verification(&mut self, result: &VerificationResult) {
        self.status = match &result.label {
            Some(name) if result.matched => format!("Recognized: {name} ({:.3})", result.distance),
            _ => "No match".to_string(),
        };
    }

    /// Clear histories, baseline, samples and return to `Idle`.
    ///
    /// The known-faces cache and the random source survive a reset.
    pub fn reset(&mut self) {
        self.history.clear();
        self.challenge.reset();
        self.calibration = None;
        self.baseline = None;
        self.samples.clear();
        self.registering = false;
        self.status = "Reset done".to_string();
        tracing::info!("session reset");
    }

    /// Leave a calibration or challenge run without a verdict.
    pub fn abandon(&mut self) {
        match self.state() {
            SessionState::Calibrating => {
                self.calibration = None;
                self.challenge.abort_calibration();
            }
            SessionState::Running => self.challenge.reset(),
            _ => {}
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let confidence = self
            .last_face
            .as_ref()
            .map_or(0.0, |f| f.detection_score.clamp(0.0, 1.0));
        SessionSnapshot {
            state: self.state(),
            challenge: self.challenge.current_challenge(),
            progress_percent: self.challenge.progress_percent(),
            face_detected: self.face_detected(),
            confidence_percent: (confidence * 100.0).round() as u8,
            registering: self.registering,
            samples_collected: self.samples.len(),
            samples_required: self.samples.required(),
            baseline: self.baseline,
            status: self.status.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveface_core::frame::fixtures;
    use std::time::Duration;

    fn descriptor(seed: f32) -> Vec<f32> {
        (0..128).map(|i| seed + i as f32 / 1000.0).collect()
    }

    fn face_with(seed: f32) -> LandmarkFrame {
        fixtures::with_descriptor(fixtures::neutral(), descriptor(seed))
    }

    fn ctx() -> SessionContext {
        SessionContext::new(Config {
            required_samples: 2,
            ..Config::default()
        })
    }

    /// Frame that performs whatever challenge is currently requested.
    fn performing(ctx: &SessionContext) -> LandmarkFrame {
        let frame = match ctx.snapshot().challenge {
            Some(Challenge::Blink) => fixtures::face(0.10, 1.5, 0.0),
            Some(Challenge::TurnLeft) => fixtures::face(0.30, 1.5, -0.3),
            Some(Challenge::TurnRight) => fixtures::face(0.30, 1.5, 0.3),
            Some(Challenge::Smile) => fixtures::face(0.30, 2.5, 0.0),
            None => fixtures::neutral(),
        };
        fixtures::with_descriptor(frame, descriptor(0.0))
    }

    /// Calibrate on neutral frames, then perform every challenge at ~30 fps.
    fn passed_ctx() -> SessionContext {
        let mut ctx = ctx();
        let t0 = Instant::now();
        for _ in 0..10 {
            ctx.process_frame(Some(face_with(0.0))).unwrap();
        }
        ctx.begin_calibration(t0).unwrap();
        ctx.finish_calibration().unwrap();
        ctx.start_challenges(t0).unwrap();

        let mut now = t0;
        for _ in 0..300 {
            let frame = performing(&ctx);
            ctx.process_frame(Some(frame)).unwrap();
            now += Duration::from_millis(33);
            match ctx.tick(now) {
                ChallengeEvent::Passed => return ctx,
                ChallengeEvent::Failed(e) => panic!("challenge failed: {e}"),
                _ => {}
            }
        }
        panic!("liveness never passed");
    }

    #[test]
    fn test_no_face_and_low_confidence() {
        let mut ctx = ctx();
        assert_eq!(ctx.process_frame(None), Err(FrameError::NoFace));
        assert!(!ctx.face_detected());

        let mut frame = fixtures::neutral();
        frame.detection_score = 0.3;
        assert!(matches!(
            ctx.process_frame(Some(frame)),
            Err(FrameError::LowConfidence { .. })
        ));
        assert!(!ctx.face_detected());
        assert!(ctx.history().is_empty());
    }

    #[test]
    fn test_bad_landmarks_keep_face_but_skip_signals() {
        let mut ctx = ctx();
        let mut frame = fixtures::neutral();
        frame.landmarks.truncate(10);
        assert!(matches!(
            ctx.process_frame(Some(frame)),
            Err(FrameError::Extraction(_))
        ));
        assert!(ctx.face_detected());
        assert!(ctx.history().is_empty());
    }

    #[test]
    fn test_calibration_requires_face() {
        let mut ctx = ctx();
        let err = ctx.begin_calibration(Instant::now()).unwrap_err();
        assert!(matches!(err, EngineError::Calibration(CalibrationError::NoFace)));
        assert_eq!(ctx.state(), SessionState::Idle);
    }

    #[test]
    fn test_calibration_produces_baseline() {
        let mut ctx = ctx();
        let t0 = Instant::now();
        for _ in 0..30 {
            ctx.process_frame(Some(fixtures::neutral())).unwrap();
        }
        ctx.begin_calibration(t0).unwrap();
        assert_eq!(ctx.state(), SessionState::Calibrating);
        assert!(!ctx.calibration_complete(t0 + Duration::from_millis(2000)));
        assert!(ctx.calibration_complete(t0 + Duration::from_millis(2200)));

        let baseline = ctx.finish_calibration().unwrap();
        assert!((baseline.median_ear - 0.30).abs() < 1e-3);
        assert!((baseline.ear_threshold - 0.216).abs() < 1e-3);
        assert_eq!(ctx.state(), SessionState::Idle);
        assert!(ctx.snapshot().status.starts_with("Calibrated"));
    }

    #[test]
    fn test_start_without_calibration_fails() {
        let mut ctx = ctx();
        assert!(matches!(
            ctx.start_challenges(Instant::now()),
            Err(EngineError::Session(_))
        ));
    }

    #[test]
    fn test_registration_precondition_order() {
        let mut ctx = ctx();
        assert!(matches!(
            ctx.prepare_registration("  "),
            Err(EngineError::Precondition(PreconditionError::MissingUsername))
        ));
        assert!(matches!(
            ctx.prepare_registration("alice"),
            Err(EngineError::Precondition(PreconditionError::NoFace))
        ));
        ctx.process_frame(Some(face_with(0.0))).unwrap();
        assert!(matches!(
            ctx.prepare_registration("alice"),
            Err(EngineError::Precondition(PreconditionError::LivenessNotPassed))
        ));
    }

    #[test]
    fn test_capture_collects_until_quota() {
        let mut ctx = passed_ctx();
        assert_eq!(ctx.state(), SessionState::Passed);

        // Frames before capture starts are not collected.
        ctx.process_frame(Some(face_with(9.0))).unwrap();
        assert!(ctx.samples().is_empty());

        ctx.start_capture().unwrap();
        ctx.process_frame(Some(face_with(0.0))).unwrap();
        assert!(matches!(
            ctx.prepare_registration("alice"),
            Err(EngineError::Precondition(PreconditionError::InsufficientSamples {
                required: 2,
                collected: 1
            }))
        ));

        ctx.process_frame(Some(fixtures::neutral())).unwrap();
        ctx.process_frame(Some(fixtures::with_descriptor(fixtures::neutral(), vec![1.0; 4])))
            .unwrap();
        ctx.process_frame(Some(face_with(1.0))).unwrap();
        ctx.process_frame(Some(face_with(5.0))).unwrap();
        assert_eq!(ctx.samples().len(), 2);

        let request = ctx.prepare_registration(" alice ").unwrap();
        assert_eq!(request.username, "alice");
        assert_eq!(request.descriptor.len(), 128);
        assert!((request.descriptor[0] - 0.5).abs() < 1e-6);
        assert!(!ctx.snapshot().registering);
    }

    #[test]
    fn test_probe_descriptor() {
        let mut ctx = ctx();
        assert!(matches!(
            ctx.probe_descriptor(),
            Err(EngineError::Precondition(PreconditionError::NoFace))
        ));
        ctx.process_frame(Some(fixtures::neutral())).unwrap();
        assert!(matches!(
            ctx.probe_descriptor(),
            Err(EngineError::Precondition(PreconditionError::MissingDescriptor))
        ));
        ctx.process_frame(Some(face_with(0.2))).unwrap();
        assert_eq!(ctx.probe_descriptor().unwrap(), descriptor(0.2));
    }

    #[test]
    fn test_verify_local() {
        let mut ctx = ctx();
        ctx.set_known_faces(vec![FaceProfile {
            username: "alice".to_string(),
            descriptor: descriptor(0.0),
        }]);
        let hit = ctx.verify_local(&descriptor(0.01));
        assert!(hit.matched);
        assert_eq!(hit.label.as_deref(), Some("alice"));
        assert!(ctx.snapshot().status.starts_with("Recognized: alice"));

        let miss = ctx.verify_local(&descriptor(1.0));
        assert!(!miss.matched);
        assert_eq!(ctx.snapshot().status, "No match");
    }

    #[test]
    fn test_reset_clears_session() {
        let mut ctx = passed_ctx();
        ctx.start_capture().unwrap();
        ctx.process_frame(Some(face_with(0.0))).unwrap();
        ctx.reset();

        let snap = ctx.snapshot();
        assert_eq!(snap.state, SessionState::Idle);
        assert_eq!(snap.samples_collected, 0);
        assert!(snap.baseline.is_none());
        assert!(!snap.registering);
        assert!(ctx.history().is_empty());
    }

    #[test]
    fn test_seeded_order_is_reproducible() {
        let config = Config {
            challenge_order: ChallengeOrder::Shuffled { seed: Some(11) },
            ..Config::default()
        };
        let orders: Vec<Vec<Challenge>> = (0..2)
            .map(|_| {
                let mut ctx = SessionContext::new(config.clone());
                let t0 = Instant::now();
                for _ in 0..10 {
                    ctx.process_frame(Some(fixtures::neutral())).unwrap();
                }
                ctx.begin_calibration(t0).unwrap();
                ctx.finish_calibration().unwrap();
                ctx.start_challenges(t0).unwrap();
                ctx.challenge.order().to_vec()
            })
            .collect();
        assert_eq!(orders[0], orders[1]);
        assert_eq!(orders[0].len(), 4);
    }
}
