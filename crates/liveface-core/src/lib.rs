//! Pure building blocks of the liveface pipeline: landmark frames, biometric
//! signals, bounded histories, calibration, liveness challenges and
//! descriptor matching. Nothing in this crate performs I/O or reads the clock.

pub mod api;
pub mod calibration;
pub mod challenge;
pub mod descriptor;
pub mod frame;
pub mod history;
pub mod matcher;
pub mod signals;

pub use calibration::{Calibration, CalibrationBaseline, CalibrationError, CalibrationParams};
pub use challenge::{
    Challenge, ChallengeEvent, ChallengeSession, ChallengeTimeoutError, ChallengeTiming,
    SessionError, SessionState,
};
pub use descriptor::{DescriptorError, EnrollmentSampleSet, SampleOutcome};
pub use frame::{BoundingBox, LandmarkFrame, Point};
pub use history::{HistoryBuffer, SignalHistory};
pub use matcher::{EuclideanMatcher, FaceProfile, Matcher, VerificationResult};
pub use signals::{HeadOffset, SignalExtractionError, SignalSample};
