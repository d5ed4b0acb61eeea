use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

use liveface_core::api::{
    RegisterFaceRequest, RegisterFaceResponse, StatusResponse, VerifyFaceRequest,
    VerifyFaceResponse, KNOWN_FACES_PATH, REGISTER_FACE_PATH, STATUS_PATH, VERIFY_FACE_PATH,
};
use liveface_core::matcher::{EuclideanMatcher, FaceProfile, Matcher};

use crate::config::Config;
use crate::store::{FaceStore, StoreError};

/// Shared state accessible by the HTTP handlers.
pub struct AppState {
    pub config: Config,
    pub store: FaceStore,
}

impl AppState {
    pub fn new(config: Config, store: FaceStore) -> Arc<Self> {
        Arc::new(Self { config, store })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(REGISTER_FACE_PATH, post(register_face))
        .route(KNOWN_FACES_PATH, get(known_faces))
        .route(VERIFY_FACE_PATH, post(verify_face))
        .route(STATUS_PATH, get(status))
        .with_state(state)
}

/// Failure bodies always carry `{success: false, message}`.
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidDescriptorDim { .. } | StoreError::InvalidDescriptorValue => {
                ApiError::BadRequest(e.to_string())
            }
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Store(e) => {
                tracing::error!(error = %e, "store operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal storage error".to_string())
            }
        };
        let body = serde_json::json!({ "success": false, "message": message });
        (status, Json(body)).into_response()
    }
}

async fn register_face(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterFaceRequest>,
) -> Result<Json<RegisterFaceResponse>, ApiError> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(ApiError::BadRequest("username must not be empty".to_string()));
    }
    state.store.validate(&req.descriptor)?;

    let id = state.store.upsert(username, &req.descriptor).await?;
    tracing::info!(username, id = %id, "face registered");

    Ok(Json(RegisterFaceResponse {
        success: true,
        message: Some(format!("registered {username}")),
    }))
}

async fn known_faces(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<FaceProfile>>, ApiError> {
    let faces = state.store.all().await?;
    tracing::debug!(count = faces.len(), "known faces listed");
    Ok(Json(faces))
}

async fn verify_face(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyFaceRequest>,
) -> Result<Json<VerifyFaceResponse>, ApiError> {
    state.store.validate(&req.descriptor)?;
    let gallery = state.store.all().await?;
    let result = EuclideanMatcher.compare(&req.descriptor, &gallery, state.config.match_threshold);

    tracing::info!(
        matched = result.matched,
        username = result.label.as_deref().unwrap_or(""),
        distance = result.distance,
        gallery = gallery.len(),
        "verify completed"
    );
    Ok(Json(VerifyFaceResponse::from(&result)))
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, ApiError> {
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        faces_enrolled: state.store.count_all().await?,
        match_threshold: state.config.match_threshold,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::path::Path;
    use tower::ServiceExt;

    const DIM: usize = 4;

    async fn app() -> Router {
        let config = Config {
            descriptor_dim: DIM,
            ..Config::default()
        };
        let store = FaceStore::open(Path::new(":memory:"), DIM).await.unwrap();
        router(AppState::new(config, store))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::get(uri).body(Body::empty()).unwrap();
        send(app, request).await
    }

    async fn post(
        app: &Router,
        uri: &str,
        json: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap();
        send(app, request).await
    }

    async fn register(
        app: &Router,
        username: &str,
        descriptor: [f32; DIM],
    ) -> (StatusCode, serde_json::Value) {
        let body = serde_json::json!({ "username": username, "descriptor": descriptor });
        post(app, REGISTER_FACE_PATH, body).await
    }

    async fn verify(app: &Router, descriptor: [f32; DIM]) -> (StatusCode, serde_json::Value) {
        post(app, VERIFY_FACE_PATH, serde_json::json!({ "descriptor": descriptor })).await
    }

    #[tokio::test]
    async fn test_register_then_list() {
        let app = app().await;
        let (status, body) = register(&app, "alice", [0.0, 0.1, 0.2, 0.3]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, body) = get(&app, KNOWN_FACES_PATH).await;
        assert_eq!(status, StatusCode::OK);
        let faces: Vec<FaceProfile> = serde_json::from_value(body).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].username, "alice");
        assert_eq!(faces[0].descriptor, vec![0.0, 0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_input() {
        let app = app().await;
        let (status, body) = register(&app, "  ", [0.0; DIM]).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let bad_dim = serde_json::json!({ "username": "alice", "descriptor": [0.0, 1.0] });
        let (status, body) = post(&app, REGISTER_FACE_PATH, bad_dim).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("dimension"));

        let (_, body) = get(&app, STATUS_PATH).await;
        assert_eq!(body["faces_enrolled"], 0);
    }

    #[tokio::test]
    async fn test_verify_match_and_miss() {
        let app = app().await;
        register(&app, "alice", [0.0; DIM]).await;

        let (status, body) = verify(&app, [0.1, 0.0, 0.0, 0.0]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["username"], "alice");

        let (status, body) = verify(&app, [10.0; DIM]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert!(body.get("username").is_none());
    }

    #[tokio::test]
    async fn test_verify_empty_registry() {
        let app = app().await;
        let (status, body) = verify(&app, [0.0; DIM]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "success": false }));
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_dimension() {
        let app = app().await;
        let body = serde_json::json!({ "descriptor": [1.0] });
        let (status, body) = post(&app, VERIFY_FACE_PATH, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_status() {
        let app = app().await;
        register(&app, "alice", [0.0; DIM]).await;
        register(&app, "alice", [0.5; DIM]).await;
        register(&app, "bob", [1.0; DIM]).await;

        let (status, body) = get(&app, STATUS_PATH).await;
        assert_eq!(status, StatusCode::OK);
        let status: StatusResponse = serde_json::from_value(body).unwrap();
        assert_eq!(status.faces_enrolled, 2);
        assert_eq!(status.match_threshold, 0.45);
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
    }
}
