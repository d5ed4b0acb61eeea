use thiserror::Error;

use liveface_core::calibration::CalibrationError;
use liveface_core::challenge::{ChallengeTimeoutError, SessionError};
use liveface_core::descriptor::DescriptorError;

use crate::registry::RegistryError;

/// A caller operation was refused before any work or network call happened.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreconditionError {
    #[error("enter a username before registering")]
    MissingUsername,
    #[error("no face detected")]
    NoFace,
    #[error("complete the liveness check first")]
    LivenessNotPassed,
    #[error("need {required} samples, collected {collected}")]
    InsufficientSamples { required: usize, collected: usize },
    #[error("the current frame carries no face descriptor")]
    MissingDescriptor,
    #[error("a registration is already being submitted")]
    RegistrationInFlight,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Challenge(#[from] ChallengeTimeoutError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("registry request failed: {0}")]
    Transport(#[from] RegistryError),
    #[error("session cancelled")]
    Cancelled,
    #[error("session was reset")]
    Reset,
    #[error("session task exited")]
    ChannelClosed,
}
