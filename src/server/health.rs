//! Health endpoint
//!
//! - `GET /health` - dependency health as JSON (200 ok/degraded, 503 unhealthy)
//! - anything else - 404 `{"error":"not found"}`

use crate::health::{HealthAggregator, HealthReport, HealthStatus};
use crate::server::shutdown::ShutdownSignal;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Body sent when a response cannot be encoded
const INTERNAL_ERROR_BODY: &str = r#"{"error":"internal server error"}"#;

/// JSON body of `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub services: BTreeMap<String, String>,
}

impl From<&HealthReport> for HealthResponse {
    fn from(report: &HealthReport) -> Self {
        Self {
            status: report.status(),
            services: report
                .outcomes()
                .iter()
                .map(|(name, outcome)| (name.clone(), outcome.summary()))
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
}

/// Encode `body` as a JSON response, degrading to a fixed 500 on failure
fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(bytes) => (status, [(CONTENT_TYPE, "application/json")], bytes).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(CONTENT_TYPE, "application/json")],
                INTERNAL_ERROR_BODY,
            )
                .into_response()
        }
    }
}

/// Health handler
///
/// Always answers; dependency failures only show up in the status and body.
async fn health(State(aggregator): State<HealthAggregator>) -> Response {
    let report = aggregator.check_all(None).await;
    json_response(report.http_status(), &HealthResponse::from(&report))
}

async fn not_found() -> Response {
    json_response(StatusCode::NOT_FOUND, &ErrorResponse { error: "not found" })
}

/// Build the router for the health endpoint
pub fn build_router(aggregator: HealthAggregator) -> Router {
    Router::new()
        // Other methods on /health are treated as unknown routes
        .route("/health", get(health).fallback(not_found))
        .fallback(not_found)
        .with_state(aggregator)
}

/// Errors that only affect the connection being accepted
fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
    )
}

/// Serve the health endpoint on an already-bound listener
///
/// Every connection runs in a task owned by this future. Once `shutdown`
/// fires, accepting stops and open connections finish their current request
/// before closing. Dropping the future aborts all connections still open.
pub async fn serve_health(
    listener: TcpListener,
    aggregator: HealthAggregator,
    mut shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let app = build_router(aggregator);

    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "Health server listening (HTTP)");
    }

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) if is_connection_error(&e) => {
                        debug!(error = %e, "Dropped connection during accept");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                connections.spawn(serve_connection(stream, peer, app.clone(), shutdown.clone()));
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    debug!(open = connections.len(), "Draining health connections");
    while connections.join_next().await.is_some() {}

    info!("Health server stopped");
    Ok(())
}

/// Serve one HTTP connection until it closes or shutdown completes it
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    mut shutdown: ShutdownSignal,
) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let connection =
        builder.serve_connection_with_upgrades(TokioIo::new(stream), TowerToHyperService::new(app));
    tokio::pin!(connection);

    let finished = tokio::select! {
        result = connection.as_mut() => Some(result),
        _ = shutdown.wait() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            // Finish the in-flight request, then close
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Health connection ended with error");
    }
}
