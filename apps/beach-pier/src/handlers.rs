use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Request, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::lifecycle::{self, DispatchError, EstablishVerdict};
use crate::notifier::BackendNotifier;
use crate::registry::{generate_token, Connection, ConnectionRegistry, PushEvent, RequestSnapshot};

#[derive(Clone)]
pub struct PierState {
    pub registry: ConnectionRegistry,
    pub notifier: BackendNotifier,
    pub heartbeat_interval: Duration,
    pub metrics: PrometheusHandle,
}

pub fn build_router(state: PierState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/dispatch", post(dispatch))
        // Every other path is a stream subscription; the inbound URL and
        // headers are forwarded to the backend, which decides.
        .fallback(subscribe)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<PierState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Open a push stream. The record is created, registered and armed with its
/// close watcher before the first await, so a dispatch or disconnect racing
/// the backend notification always finds a record to act on.
pub async fn subscribe(State(state): State<PierState>, request: Request) -> Response {
    if request.method() != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let token = generate_token();
    let snapshot = RequestSnapshot::capture(request.uri(), request.headers());
    debug!(token = %token, url = %snapshot.url, "inbound stream request");

    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Arc::new(Connection::new(token, snapshot, tx.clone()));
    state.registry.put(Arc::clone(&conn));
    conn.lock().watcher = Some(lifecycle::spawn_close_watcher(
        state.clone(),
        Arc::clone(&conn),
        tx,
    ));

    // Establishment runs detached: if this handler is dropped because the
    // client went away, the connect notification still runs to completion.
    let (verdict_tx, verdict_rx) = oneshot::channel();
    tokio::spawn(lifecycle::establish(
        state.clone(),
        Arc::clone(&conn),
        verdict_tx,
    ));

    match verdict_rx.await {
        Ok(EstablishVerdict::Open) => {
            let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
            (
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Ok(EstablishVerdict::Refuse(status)) => StatusCode::from_u16(status)
            .unwrap_or(StatusCode::BAD_GATEWAY)
            .into_response(),
        Ok(EstablishVerdict::Gone) | Err(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub token: String,
    #[serde(default)]
    pub event: Option<PushEvent>,
    #[serde(default)]
    pub close: Option<bool>,
}

#[derive(Debug, Serialize)]
struct DispatchResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct DispatchErrorBody {
    status: &'static str,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl DispatchError {
    fn label(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "validation",
            DispatchError::NotFound => "not_found",
            DispatchError::Write => "write",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::NotFound => StatusCode::NOT_FOUND,
            DispatchError::Write => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let message = match &self {
            DispatchError::Validation(message) => Some(message.clone()),
            _ => None,
        };
        (
            self.status_code(),
            Json(DispatchErrorBody {
                status: "error",
                error: self.label(),
                message,
            }),
        )
            .into_response()
    }
}

/// The backend's side channel: push an event into a connection by token
/// and/or ask for it to be closed.
pub async fn dispatch(
    State(state): State<PierState>,
    payload: Result<Json<DispatchRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            // An expected client mistake, not a server error; shape
            // validation fails before any registry lookup.
            debug!(error = %rejection.body_text(), "malformed dispatch payload");
            counter!("beach_pier_dispatch_total", 1, "result" => "validation");
            return DispatchError::Validation(rejection.body_text()).into_response();
        }
    };

    if request.token.trim().is_empty() {
        counter!("beach_pier_dispatch_total", 1, "result" => "validation");
        return DispatchError::Validation("token must be a non-empty string".to_string())
            .into_response();
    }

    match lifecycle::dispatch_event(
        &state,
        &request.token,
        request.event,
        request.close.unwrap_or(false),
    ) {
        Ok(status) => {
            counter!("beach_pier_dispatch_total", 1, "result" => status.as_str());
            Json(DispatchResponse {
                status: status.as_str(),
            })
            .into_response()
        }
        Err(err) => {
            debug!(token = %request.token, error = %err, "dispatch failed");
            counter!("beach_pier_dispatch_total", 1, "result" => err.label());
            err.into_response()
        }
    }
}
