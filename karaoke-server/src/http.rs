//! HTTP and WebSocket transport over [`KaraokeService`].
//!
//! Every core call blocks (decoding, waiting, filesystem), so handlers hop
//! onto the blocking pool before touching the service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use crossbeam_channel::RecvTimeoutError;
use karaoke_core::events::SessionEvent;
use karaoke_core::service::{AudioBody, PredictRequest, StartRequest, WireStatus};
use karaoke_core::{KaraokeError, KaraokeService};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 64;
const BRIDGE_POLL: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct AppState {
    service: Arc<KaraokeService>,
}

pub fn router(service: Arc<KaraokeService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/separate", post(separate))
        .route("/separate/url", post(separate_url))
        .route("/clear-cache", post(clear_cache))
        .route("/stream/start", post(stream_start))
        .route("/stream/status/:track_id", get(stream_status))
        .route("/stream/result/:track_id", get(stream_result))
        .route("/stream/full/:track_id", get(stream_full))
        .route("/stream/predict", post(stream_predict))
        .route("/stream/cancel/:track_id", post(stream_cancel))
        .route("/events", get(events))
        .with_state(AppState { service })
}

pub async fn serve(addr: SocketAddr, service: Arc<KaraokeService>) -> anyhow::Result<()> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local = listener
        .local_addr()
        .context("failed to read local listener address")?;
    log::info!("listening on http://{local}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("shutting down");
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
}

/// JSON error envelope with the status code chosen per error kind.
struct ApiError {
    status: StatusCode,
    error: String,
    code: &'static str,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: message.into(),
            code: "KARAOKE-INVALID-REQUEST",
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: message.into(),
            code: "KARAOKE-INTERNAL",
        }
    }
}

impl From<KaraokeError> for ApiError {
    fn from(e: KaraokeError) -> Self {
        let status = match &e {
            KaraokeError::NotFound(_) => StatusCode::NOT_FOUND,
            KaraokeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            KaraokeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            KaraokeError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("{e}");
        }
        Self {
            status,
            error: e.to_string(),
            code: e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.error,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Run a blocking service call on tokio's blocking pool.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> karaoke_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("worker task failed: {e}")))?
        .map_err(ApiError::from)
}

fn audio_response(content_type: &'static str, bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
}

fn body_response(body: AudioBody) -> Response {
    audio_response(body.content_type, body.bytes)
}

async fn health(State(st): State<AppState>) -> ApiResult<impl IntoResponse> {
    let service = Arc::clone(&st.service);
    let health = blocking(move || Ok(service.health())).await?;
    Ok(Json(health))
}

async fn separate(
    State(st): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if body.is_empty() {
        return Err(ApiError::bad_request("no audio provided"));
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let service = Arc::clone(&st.service);
    let kind = service.content_type();
    let bytes = blocking(move || service.separate_bytes(body.to_vec(), content_type)).await?;
    Ok(audio_response(kind, bytes))
}

#[derive(Debug, Deserialize)]
struct UrlRequest {
    #[serde(default)]
    url: String,
}

async fn separate_url(
    State(st): State<AppState>,
    Json(req): Json<UrlRequest>,
) -> ApiResult<Response> {
    if req.url.trim().is_empty() {
        return Err(ApiError::bad_request("no url provided"));
    }
    let service = Arc::clone(&st.service);
    let kind = service.content_type();
    let bytes = blocking(move || service.separate_url(&req.url)).await?;
    Ok(audio_response(kind, bytes))
}

async fn clear_cache(State(st): State<AppState>) -> ApiResult<impl IntoResponse> {
    let service = Arc::clone(&st.service);
    let cleared = blocking(move || service.clear_cache()).await?;
    Ok(Json(cleared))
}

async fn stream_start(
    State(st): State<AppState>,
    Json(req): Json<StartRequest>,
) -> ApiResult<impl IntoResponse> {
    let service = Arc::clone(&st.service);
    let resp = blocking(move || service.start(req)).await?;
    Ok(Json(resp))
}

async fn stream_status(
    State(st): State<AppState>,
    Path(track_id): Path<String>,
) -> impl IntoResponse {
    let status = st.service.status(&track_id);
    let code = if status.status == WireStatus::NotFound {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    (code, Json(status))
}

async fn stream_result(
    State(st): State<AppState>,
    Path(track_id): Path<String>,
) -> ApiResult<Response> {
    let service = Arc::clone(&st.service);
    let body = blocking(move || service.result(&track_id)).await?;
    Ok(body_response(body))
}

async fn stream_full(
    State(st): State<AppState>,
    Path(track_id): Path<String>,
) -> ApiResult<Response> {
    let service = Arc::clone(&st.service);
    let body = blocking(move || service.wait_for_result(&track_id)).await?;
    Ok(body_response(body))
}

async fn stream_predict(
    State(st): State<AppState>,
    Json(req): Json<PredictRequest>,
) -> impl IntoResponse {
    Json(st.service.predict(req.tracks))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    success: bool,
    cancelled: bool,
}

async fn stream_cancel(
    State(st): State<AppState>,
    Path(track_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let cancelled = st.service.cancel(&track_id)?;
    Ok(Json(CancelResponse {
        success: true,
        cancelled,
    }))
}

async fn events(State(st): State<AppState>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| forward_events(st.service, socket))
}

/// Pump hub events into the socket until either side goes away.
async fn forward_events(service: Arc<KaraokeService>, mut socket: WebSocket) {
    let hub_rx = service.subscribe();
    let (tx, mut rx) = mpsc::channel::<SessionEvent>(EVENT_BUFFER);

    let bridge = tokio::task::spawn_blocking(move || loop {
        match hub_rx.recv_timeout(BRIDGE_POLL) {
            Ok(event) => {
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    });

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::error!("cannot serialize event: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    drop(rx);
    if let Err(e) = bridge.await {
        log::warn!("event bridge failed: {e}");
    }
    log::debug!("event subscriber disconnected");
}
