//! HTTP client for a known-faces registry (`livefaced` or compatible).
//!
//! No request is retried; a failure surfaces to the caller as
//! [`RegistryError`] and recovery is left to them.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

use liveface_core::api::{
    RegisterFaceRequest, RegisterFaceResponse, StatusResponse, VerifyFaceRequest,
    VerifyFaceResponse, KNOWN_FACES_PATH, REGISTER_FACE_PATH, STATUS_PATH, VERIFY_FACE_PATH,
};
use liveface_core::matcher::{FaceProfile, VerificationResult};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Clone, Debug)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Persist `{username, descriptor}`. A response without `success: true`
    /// is a rejection carrying the server's message.
    pub async fn register_face(
        &self,
        username: &str,
        descriptor: &[f32],
    ) -> Result<(), RegistryError> {
        let body = RegisterFaceRequest {
            username: username.to_string(),
            descriptor: descriptor.to_vec(),
        };
        let resp = self
            .http
            .post(self.url(REGISTER_FACE_PATH))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let parsed: Option<RegisterFaceResponse> = resp.json().await.ok();
        match parsed {
            Some(r) if status.is_success() && r.success => {
                tracing::info!(username, "registry accepted registration");
                Ok(())
            }
            other => Err(RegistryError::Rejected {
                status: status.as_u16(),
                message: other
                    .and_then(|r| r.message)
                    .unwrap_or_else(|| "registration failed".to_string()),
            }),
        }
    }

    pub async fn known_faces(&self) -> Result<Vec<FaceProfile>, RegistryError> {
        let resp = self.http.get(self.url(KNOWN_FACES_PATH)).send().await?;
        read_json(resp).await
    }

    /// Ask the registry to match `descriptor`. The verdict is relayed unchanged.
    pub async fn verify_face(
        &self,
        descriptor: &[f32],
    ) -> Result<VerificationResult, RegistryError> {
        let body = VerifyFaceRequest {
            descriptor: descriptor.to_vec(),
        };
        let resp = self
            .http
            .post(self.url(VERIFY_FACE_PATH))
            .json(&body)
            .send()
            .await?;
        let parsed: VerifyFaceResponse = read_json(resp).await?;
        Ok(parsed.into())
    }

    pub async fn status(&self) -> Result<StatusResponse, RegistryError> {
        let resp = self.http.get(self.url(STATUS_PATH)).send().await?;
        read_json(resp).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, RegistryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let message = rejection_message(status, resp.text().await.unwrap_or_default());
    Err(RegistryError::Rejected {
        status: status.as_u16(),
        message,
    })
}

/// Prefer the `message` field of a JSON error body, else the raw text.
fn rejection_message(status: StatusCode, body: String) -> String {
    serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or_else(|| status.to_string())
}
