//! HTTP API.
//!
//! - `GET /` describes the service.
//! - `GET /finger` returns the last published [`FingerState`].
//! - `POST /process_frame` runs detection on an uploaded image and returns the index fingertip in
//!   pixel coordinates. This path does not touch the published state. Bodies up to
//!   [`AppState::max_frame_bytes`] are accepted.

use std::{fmt, future::poll_fn, net::SocketAddr, pin::Pin, sync::Arc};

use anyhow::Context;
use axum::{
    body::{Body, Bytes, HttpBody},
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::{
    detector::{DetectError, SharedDetector},
    tracking::{FingerState, TrackingState},
};

const ENDPOINTS: &[&str] = &[
    "/finger (GET) - latest index fingertip position and gesture",
    "/process_frame (POST) - send an encoded image for hand tracking",
];

/// Default limit for `POST /process_frame` bodies. Uncompressed 4K frames fit.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

/// State shared by all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub tracking: Arc<TrackingState>,
    pub detector: SharedDetector,
    /// Largest accepted `POST /process_frame` body, in bytes.
    pub max_frame_bytes: usize,
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/finger", get(finger))
        .route("/process_frame", post(process_frame))
        .with_state(state)
}

/// Serves the API on `addr` until Ctrl-C is pressed.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    log::info!("listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("received Ctrl-C, shutting down"),
        Err(e) => {
            // Without a signal handler the server can only be stopped by killing it.
            log::error!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Serialize)]
struct Status {
    status: &'static str,
    endpoints: &'static [&'static str],
}

async fn index() -> Json<Status> {
    Json(Status {
        status: "running",
        endpoints: ENDPOINTS,
    })
}

async fn finger(State(state): State<AppState>) -> Json<FingerState> {
    Json(state.tracking.read())
}

/// A position in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PixelPos {
    pub x: f32,
    pub y: f32,
}

/// Successful response of `POST /process_frame`.
///
/// A frame without a hand is not an error: it results in `success: false` and a message.
#[derive(Debug, PartialEq, Serialize)]
pub struct FrameResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_finger: Option<PixelPos>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

impl FrameResponse {
    fn found(pos: PixelPos) -> Self {
        Self {
            success: true,
            index_finger: Some(pos),
            message: None,
        }
    }

    fn not_found() -> Self {
        Self {
            success: false,
            index_finger: None,
            message: Some("No hand detected"),
        }
    }
}

/// Reasons `POST /process_frame` can fail.
#[derive(Debug)]
pub enum FrameError {
    /// The request body was empty.
    EmptyBody,
    /// The request body was larger than [`AppState::max_frame_bytes`].
    TooLarge { limit: usize },
    /// The request body could not be received.
    Unreadable(axum::Error),
    /// The request body could not be decoded as an image.
    Undecodable(image::ImageError),
    /// Detection failed for reasons unrelated to the request.
    Internal(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::EmptyBody => f.write_str("No image data"),
            FrameError::TooLarge { limit } => write!(f, "Image data exceeds {limit} bytes"),
            FrameError::Unreadable(_) => f.write_str("Could not read image data"),
            FrameError::Undecodable(_) => f.write_str("Invalid image format"),
            FrameError::Internal(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Undecodable(e) => Some(e),
            FrameError::Unreadable(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DetectError> for FrameError {
    fn from(e: DetectError) -> Self {
        FrameError::Internal(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IntoResponse for FrameError {
    fn into_response(self) -> Response {
        let (status, message, error) = match &self {
            FrameError::EmptyBody | FrameError::Unreadable(_) | FrameError::Undecodable(_) => {
                (StatusCode::BAD_REQUEST, Some(self.to_string()), None)
            }
            FrameError::TooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, Some(self.to_string()), None)
            }
            FrameError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
                Some(self.to_string()),
            ),
        };
        let body = ErrorBody {
            success: false,
            message,
            error,
        };
        (status, Json(body)).into_response()
    }
}

/// Collects a request body of at most `limit` bytes.
///
/// The body is taken as a raw [`Body`], since axum's `Bytes` extractor rejects everything above its
/// own 2 MiB default with a plain text response.
async fn read_frame(mut body: Body, limit: usize) -> Result<Bytes, FrameError> {
    let mut buf = Vec::new();
    while let Some(frame) = poll_fn(|cx| Pin::new(&mut body).poll_frame(cx)).await {
        let frame = frame.map_err(FrameError::Unreadable)?;
        // Trailers are ignored.
        if let Ok(data) = frame.into_data() {
            if buf.len() + data.len() > limit {
                return Err(FrameError::TooLarge { limit });
            }
            buf.extend_from_slice(&data);
        }
    }
    Ok(Bytes::from(buf))
}

async fn process_frame(
    State(state): State<AppState>,
    body: Body,
) -> Result<Json<FrameResponse>, FrameError> {
    let body = read_frame(body, state.max_frame_bytes).await.map_err(|e| {
        log::debug!("rejecting frame upload: {e}");
        e
    })?;
    if body.is_empty() {
        return Err(FrameError::EmptyBody);
    }

    let image = image::load_from_memory(&body).map_err(|e| {
        log::debug!("rejecting undecodable frame ({} bytes): {e}", body.len());
        FrameError::Undecodable(e)
    })?;
    let image = image.into_rgb8();
    let (width, height) = (image.width() as f32, image.height() as f32);

    // Inference blocks and may have to wait for the publisher to release the detector.
    let detector = state.detector.clone();
    let hands = tokio::task::spawn_blocking(move || detector.detect(&image))
        .await
        .map_err(|e| FrameError::Internal(format!("detection task failed: {e}")))
        .and_then(|res| res.map_err(FrameError::from))
        .map_err(|e| {
            log::error!("frame processing error: {e}");
            e
        })?;

    let Some(tip) = hands.first().and_then(|hand| hand.index_finger_tip()) else {
        return Ok(Json(FrameResponse::not_found()));
    };
    Ok(Json(FrameResponse::found(PixelPos {
        x: tip.x() * width,
        y: tip.y() * height,
    })))
}
