//! HTTP boundary: live MJPEG feed, camera status/controls and inference.
//!
//! - `GET /health`: model and service health
//! - `GET /video_feed`, `GET /api/camera/video_feed`: MJPEG stream
//! - `GET /api/camera/snapshot`: latest frame as a single JPEG
//! - `GET /api/status`: trigger (edge read), running flag, gain
//! - `GET /api/camera/devices`: active camera, empty when stopped
//! - `POST /api/camera/gain`: set digital gain
//! - `POST /api/io/trigger`: latch the simulated IO trigger
//! - `GET /view`: bare page showing the feed
//! - `POST /infer`: multipart image inspection

use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

use crate::capture::FrameSource;
use crate::control::ControlStatus;
use crate::detect::{DetectionService, InferRequest};
use crate::error::InferError;
use crate::pipeline::stream::MULTIPART_CONTENT_TYPE;
use crate::pipeline::StreamMultiplexer;

const STREAM_PATH: &str = "/api/camera/video_feed";
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

const VIEW_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <title>Camera</title>
  <style>
    body { margin: 0; background: #111; display: flex; justify-content: center; align-items: center; min-height: 100vh; }
    img { max-width: 100%; max-height: 100vh; object-fit: contain; }
  </style>
</head>
<body>
  <img src="/api/camera/video_feed" alt="Camera feed" />
</body>
</html>
"#;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub source: Arc<FrameSource>,
    pub mux: StreamMultiplexer,
    pub detection: DetectionService,
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/video_feed", get(video_feed))
        .route(STREAM_PATH, get(video_feed))
        .route("/api/camera/snapshot", get(snapshot))
        .route("/api/camera/devices", get(devices))
        .route("/api/camera/gain", post(set_gain))
        .route("/api/io/trigger", post(trigger))
        .route("/api/status", get(status))
        .route("/view", get(view))
        .route(
            "/infer",
            post(infer).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// Serve until `shutdown` resolves. Open streams end once the multiplexer
/// is closed, so callers should close it as part of `shutdown`.
pub async fn start<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().wrap_err("Failed to read listener address")?;
    info!("Web server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .wrap_err("Web server error")?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'static str,
    model_loaded: bool,
    model_version: &'a str,
    device: &'static str,
}

async fn health(State(state): State<AppState>) -> Response {
    Json(HealthResponse {
        status: "ok",
        model_loaded: state.detection.model_loaded(),
        model_version: state.detection.model_version(),
        device: "cpu",
    })
    .into_response()
}

async fn video_feed(State(state): State<AppState>) -> Response {
    (
        [
            (header::CONTENT_TYPE, MULTIPART_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(state.mux.multipart()),
    )
        .into_response()
}

async fn snapshot(State(state): State<AppState>) -> Response {
    match state.mux.encode_snapshot().await {
        Ok(Some(frame)) => (
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg")),
                (
                    header::HeaderName::from_static("x-frame-sequence"),
                    HeaderValue::from(frame.sequence),
                ),
            ],
            frame.jpeg,
        )
            .into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            error!("Snapshot encoding failed: {}", err);
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    io_triggered: bool,
    camera_running: bool,
    digital_gain: f32,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let control = state.source.control();
    Json(StatusResponse {
        io_triggered: control.check_and_clear_io(),
        camera_running: control.is_running(),
        digital_gain: control.gain(),
    })
}

#[derive(Debug, Serialize)]
struct DeviceEntry {
    id: String,
    label: String,
    url: &'static str,
}

async fn devices(State(state): State<AppState>) -> Json<Vec<DeviceEntry>> {
    if !state.source.is_running() {
        return Json(Vec::new());
    }
    let entries = state
        .source
        .active_device()
        .map(|device| DeviceEntry {
            id: device.id,
            label: device.label,
            url: STREAM_PATH,
        })
        .into_iter()
        .collect();
    Json(entries)
}

#[derive(Debug, Deserialize)]
struct GainRequest {
    value: f32,
}

async fn set_gain(
    State(state): State<AppState>,
    Json(request): Json<GainRequest>,
) -> Json<ControlStatus> {
    let control = state.source.control();
    control.set_gain(request.value);
    Json(control.status())
}

async fn trigger(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.source.control().simulate_trigger();
    Json(serde_json::json!({ "io_triggered": true }))
}

async fn view() -> Html<&'static str> {
    Html(VIEW_HTML)
}

async fn infer(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut image: Option<Bytes> = None;
    let mut request = InferRequest::default();

    while let Some(field) = multipart.next_field().await.map_err(ApiError::bad_request)? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => image = Some(field.bytes().await.map_err(ApiError::bad_request)?),
            "barcode" => request.barcode = non_empty(field.text().await.map_err(ApiError::bad_request)?),
            "request_id" => {
                request.request_id = non_empty(field.text().await.map_err(ApiError::bad_request)?)
            }
            "imgsz" => {
                let text = field.text().await.map_err(ApiError::bad_request)?;
                if let Some(text) = non_empty(text) {
                    let size = text.trim().parse::<u32>().map_err(|_| {
                        ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid imgsz: {text}"))
                    })?;
                    request.imgsz = Some(size);
                }
            }
            _ => {}
        }
    }
    request.image = image
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Missing file"))?;

    let detection = state.detection.clone();
    let response = tokio::task::spawn_blocking(move || detection.infer(request))
        .await
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))??;
    Ok(Json(response).into_response())
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Error body in the `{ "detail": ... }` shape clients expect.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn bad_request(err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

impl From<InferError> for ApiError {
    fn from(err: InferError) -> Self {
        let status = match err {
            InferError::EmptyFile | InferError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            InferError::ModelNotLoaded | InferError::Inference(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}
