//! HTTP API Server
//!
//! Peer protocol, lock and booking endpoints served by every node.

use std::sync::Arc;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State, Json},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::booking::{BookingRequest, BookingRouter, ForwardedResponse, Route, FORWARDED_HEADER};
use crate::cluster::NodeSpec;
use crate::election::protocol::{
    CoordinatorMessage, CoordinatorReply, ElectionMessage, ElectionReply, HeartbeatReply,
};
use crate::election::ElectionEngine;
use crate::error::{Error, Result};
use crate::lock::LockManager;

/// Shared application state
pub struct AppState {
    /// Election engine of this node
    pub engine: Arc<ElectionEngine>,
    /// Lock table served on `/lock`
    pub locks: Arc<LockManager>,
    /// Booking router
    pub booking: Arc<BookingRouter>,
    /// Resource used when a lock request names none
    pub default_resource: String,
}

/// HTTP API server
pub struct HttpServer {
    bind_address: String,
    cors_enabled: bool,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(bind_address: impl Into<String>, cors_enabled: bool, state: Arc<AppState>) -> Self {
        Self {
            bind_address: bind_address.into(),
            cors_enabled,
            state,
        }
    }

    /// Bind the listener. Peers connecting between `bind` and `serve` are
    /// queued, not refused.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("HTTP API listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Serve on a bound listener until the token is cancelled
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let mut app = create_router(self.state);
        if self.cors_enabled {
            app = app.layer(CorsLayer::permissive());
        }

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Peer protocol
        .route("/heartbeat", get(handle_heartbeat))
        .route("/election", post(handle_election))
        .route("/coordinator", post(handle_coordinator))
        // Status and info
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        // Lock
        .route("/lock", post(handle_lock))
        .route("/lock/:resource", get(handle_lock_status))
        .route("/unlock", post(handle_unlock))
        // Bookings
        .route("/reservas", post(handle_create_reservation).get(handle_list_reservations))
        .route("/reservas/:id", delete(handle_cancel_reservation))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============ Request/Response Types ============

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: self.code().to_string(),
            }),
        )
            .into_response()
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::InvalidRequest(rejection.body_text())
    }
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// `POST /lock` body
#[derive(Debug, Default, Deserialize)]
pub struct LockRequest {
    #[serde(default)]
    pub resource: Option<String>,
    /// Queue behind the holder (default) or fail immediately
    #[serde(default)]
    pub wait: Option<bool>,
}

/// `POST /lock` reply
#[derive(Debug, Serialize, Deserialize)]
pub struct LockResponse {
    pub lock: bool,
    pub resource: String,
    pub ticket: u64,
    pub epoch: u64,
}

/// `POST /unlock` body
#[derive(Debug, Default, Deserialize)]
pub struct UnlockRequest {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub ticket: Option<u64>,
}

/// Acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

// ============ Handlers ============

async fn handle_heartbeat() -> impl IntoResponse {
    Json(HeartbeatReply { ok: true })
}

async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.engine.status())
}

async fn handle_election(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<ElectionMessage>, JsonRejection>,
) -> Result<Json<ElectionReply>> {
    let Json(msg) = body?;
    Ok(Json(state.engine.handle_election_request(&msg)))
}

async fn handle_coordinator(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<CoordinatorMessage>, JsonRejection>,
) -> Result<Json<CoordinatorReply>> {
    let Json(msg) = body?;
    Ok(Json(state.engine.handle_coordinator_announcement(&msg)))
}

async fn handle_lock(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<LockRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return Error::from(rejection).into_response(),
    };
    let resource = req.resource.unwrap_or_else(|| state.default_resource.clone());
    let grant = if req.wait.unwrap_or(true) {
        state.locks.acquire(&resource).await
    } else {
        state.locks.try_acquire(&resource)
    };

    match grant {
        Ok(grant) => Json(LockResponse {
            lock: true,
            resource: grant.resource,
            ticket: grant.ticket,
            epoch: grant.epoch,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_unlock(
    State(state): State<Arc<AppState>>,
    body: std::result::Result<Json<UnlockRequest>, JsonRejection>,
) -> Result<Json<OkResponse>> {
    let Json(req) = body?;
    let resource = req.resource.unwrap_or_else(|| state.default_resource.clone());
    let outcome = state.locks.release(&resource, req.ticket);
    tracing::debug!("Unlock '{}': {:?}", resource, outcome);
    Ok(Json(OkResponse { ok: true }))
}

async fn handle_lock_status(
    State(state): State<Arc<AppState>>,
    Path(resource): Path<String>,
) -> impl IntoResponse {
    Json(state.locks.status(&resource))
}

async fn handle_create_reservation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return Error::from(rejection).into_response(),
    };
    match state.booking.route(is_forwarded(&headers)) {
        Err(e) => e.into_response(),
        Ok(Route::Forward(leader)) => {
            relay(&state, &leader, "POST", "/reservas", Some(&body)).await
        }
        Ok(Route::Local) => {
            let request: BookingRequest = match serde_json::from_value(body) {
                Ok(request) => request,
                Err(e) => return Error::InvalidRequest(e.to_string()).into_response(),
            };
            match state.booking.book(request).await {
                Ok(reservation) => (StatusCode::CREATED, Json(reservation)).into_response(),
                Err(e) => e.into_response(),
            }
        }
    }
}

async fn handle_list_reservations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    match state.booking.route(is_forwarded(&headers)) {
        Err(e) => e.into_response(),
        Ok(Route::Forward(leader)) => relay(&state, &leader, "GET", "/reservas", None).await,
        Ok(Route::Local) => Json(state.booking.list().await).into_response(),
    }
}

async fn handle_cancel_reservation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    match state.booking.route(is_forwarded(&headers)) {
        Err(e) => e.into_response(),
        Ok(Route::Forward(leader)) => {
            relay(&state, &leader, "DELETE", &format!("/reservas/{}", id), None).await
        }
        Ok(Route::Local) => match state.booking.cancel(id).await {
            Ok(reservation) => Json(reservation).into_response(),
            Err(e) => e.into_response(),
        },
    }
}

// ============ Helper Functions ============

fn is_forwarded(headers: &HeaderMap) -> bool {
    headers.contains_key(FORWARDED_HEADER)
}

/// Forward to the leader and relay its reply
async fn relay(
    state: &AppState,
    leader: &NodeSpec,
    method: &str,
    path: &str,
    body: Option<&serde_json::Value>,
) -> Response {
    match state.booking.forward(leader, method, path, body).await {
        Ok(forwarded) => forwarded_response(forwarded),
        Err(e) => e.into_response(),
    }
}

/// The leader's status and body, unchanged
fn forwarded_response(forwarded: ForwardedResponse) -> Response {
    let status = StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(forwarded.body));
    *response.status_mut() = status;
    if let Some(content_type) = forwarded
        .content_type
        .and_then(|ct| header::HeaderValue::from_str(&ct).ok())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    response
}
