//! JSON bodies exchanged with a known-faces registry.
//!
//! `GET /api/known-faces` returns a plain array of [`FaceProfile`](crate::matcher::FaceProfile).

use serde::{Deserialize, Serialize};

use crate::matcher::VerificationResult;

pub const REGISTER_FACE_PATH: &str = "/api/register-face";
pub const KNOWN_FACES_PATH: &str = "/api/known-faces";
pub const VERIFY_FACE_PATH: &str = "/api/verify-face";
pub const STATUS_PATH: &str = "/api/status";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterFaceRequest {
    pub username: String,
    pub descriptor: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterFaceResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyFaceRequest {
    pub descriptor: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyFaceResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<VerifyFaceResponse> for VerificationResult {
    /// A missing distance means the server did not report one; treat it as infinitely far.
    fn from(resp: VerifyFaceResponse) -> Self {
        VerificationResult {
            matched: resp.success,
            label: if resp.success { resp.username } else { None },
            distance: resp.distance.unwrap_or(f32::INFINITY),
        }
    }
}

impl From<&VerificationResult> for VerifyFaceResponse {
    fn from(result: &VerificationResult) -> Self {
        VerifyFaceResponse {
            success: result.matched,
            username: result.label.clone(),
            distance: result.distance.is_finite().then_some(result.distance),
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub faces_enrolled: u64,
    pub match_threshold: f32,
}
