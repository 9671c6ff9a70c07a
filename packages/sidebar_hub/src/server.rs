//! HTTP surface of the hub.
//!
//! Page peers upgrade `/ws` into a channel; whatever relays browser events
//! (tab activation, zoom, toolbar clicks) posts small JSON bodies. Every
//! handler only forwards to the coordinator.

use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::coordinator::HubHandle;
use crate::error::HubError;
use crate::protocol::PeerName;
use crate::session::TabDescriptor;
use crate::ws::server_link;
use crate::zoom::{ZoomScope, effective_zoom};

/// Span maker that tags each request with a unique id.
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(hub: HubHandle) -> Self {
        Self {
            hub,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(peer_socket_handler))
        .route("/tabs/active", post(active_tabs_handler))
        .route("/tabs/{id}/zoom", post(zoom_handler))
        .route("/action", post(action_handler))
        .route("/sessions", get(sessions_handler))
        .route("/preferences", get(preferences_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(state)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Sidebar hub listening on http://{}", actual_addr);
    info!("  GET  /ws?name=..&tab=..  - page peer channel");
    info!("  POST /tabs/active        - active tab snapshot");
    info!("  POST /tabs/:id/zoom      - browser zoom change");
    info!("  POST /action             - toolbar action click");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")
}

/// Query string of a peer connection.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub name: String,
    pub tab: u64,
    #[serde(default)]
    pub window: u64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub zoom: Option<f64>,
}

impl ConnectQuery {
    fn tab_descriptor(&self) -> TabDescriptor {
        TabDescriptor {
            id: self.tab,
            window_id: self.window,
            url: self.url.clone(),
            title: self.title.clone(),
            active: self.active,
            zoom_factor: self.zoom,
        }
    }
}

async fn peer_socket_handler(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, HubError> {
    let name = PeerName::parse(&query.name)?;
    let tab = query.tab_descriptor();
    let hub = state.hub.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let link = server_link(socket, format!("{}@{}", name, tab.id));
        hub.connect_peer(name, tab, link);
    }))
}

#[derive(Debug, Deserialize)]
pub struct ActiveTabsRequest {
    pub tabs: Vec<u64>,
}

async fn active_tabs_handler(
    State(state): State<AppState>,
    Json(req): Json<ActiveTabsRequest>,
) -> StatusCode {
    state.hub.set_active_tabs(req.tabs);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct ZoomChangeRequest {
    pub new_zoom_factor: f64,
    #[serde(default)]
    pub scope: ZoomScope,
}

async fn zoom_handler(
    State(state): State<AppState>,
    Path(tab_id): Path<u64>,
    Json(req): Json<ZoomChangeRequest>,
) -> Result<StatusCode, HubError> {
    if effective_zoom(req.new_zoom_factor).is_none() {
        return Err(HubError::InvalidZoom(req.new_zoom_factor));
    }
    state.hub.zoom_changed(tab_id, req.new_zoom_factor, req.scope);
    Ok(StatusCode::NO_CONTENT)
}

async fn action_handler(State(state): State<AppState>) -> StatusCode {
    state.hub.action_clicked();
    StatusCode::NO_CONTENT
}

async fn sessions_handler(State(state): State<AppState>) -> Result<impl IntoResponse, HubError> {
    Ok(Json(state.hub.sessions().await?))
}

async fn preferences_handler(State(state): State<AppState>) -> Result<impl IntoResponse, HubError> {
    Ok(Json(state.hub.preferences().await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: usize,
    pub uptime_secs: u64,
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime_secs = state.started_at.elapsed().as_secs();
    match state.hub.sessions().await {
        Ok(sessions) => Json(HealthStatus {
            status: "healthy".to_string(),
            sessions: sessions.len(),
            uptime_secs,
        })
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "stopped".to_string(),
                sessions: 0,
                uptime_secs,
            }),
        )
            .into_response(),
    }
}
