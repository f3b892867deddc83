//! HTTP front-end: one listener, a timeout-wrapped gateway handler and
//! the debug endpoints.

use crate::engine::Engine;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use http::StatusCode;
use portico_common::{GatewayError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Per-request budget at the front door.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Extended budget in debug mode, generous enough for an attached
/// debugger.
const DEBUG_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    timeout: Duration,
}

/// The gateway listener.
pub struct HttpServer {
    engine: Arc<Engine>,
    debug: bool,
}

impl HttpServer {
    pub fn new(engine: Arc<Engine>, debug: bool) -> Self {
        Self { engine, debug }
    }

    /// Bind `addr` and serve until the process stops.
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let timeout = if self.debug {
            DEBUG_REQUEST_TIMEOUT
        } else {
            REQUEST_TIMEOUT
        };
        let state = AppState {
            engine: self.engine,
            timeout,
        };

        let app = Router::new()
            .route("/_portico/health", get(health))
            .route("/_portico/status", get(status))
            .fallback(gateway)
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(GatewayError::Io)?;
        tracing::info!(addr = %addr, debug = self.debug, "gateway listening");

        axum::serve(listener, app)
            .await
            .map_err(GatewayError::Io)
    }
}

async fn gateway(State(state): State<AppState>, req: Request) -> Response {
    match tokio::time::timeout(state.timeout, state.engine.handle(req)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!("request exceeded front-door timeout");
            (StatusCode::GATEWAY_TIMEOUT, "timeout").into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.status().await)
}
