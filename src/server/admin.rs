//! HTTP admin API: liveness and counters.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::state::{ServerStats, StatsSnapshot};
use crate::inference::ExperimentType;
use crate::transport::TransportKind;

/// State behind the admin routes
#[derive(Debug, Clone)]
pub struct AdminState {
    /// Live counters
    pub stats: Arc<ServerStats>,
    /// Experiment served
    pub experiment: ExperimentType,
    /// Active transports
    pub transport: TransportKind,
    /// Layers in the loaded model
    pub num_layers: usize,
}

/// Create the admin router
pub fn create_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while serving
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Status response
#[derive(Serialize)]
pub struct StatusResponse {
    /// Always `"ok"` while serving
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
    /// Wire protocol version
    pub protocol_version: &'static str,
    /// Experiment served
    pub experiment: ExperimentType,
    /// Active transports
    pub transport: String,
    /// Layers in the loaded model
    pub num_layers: usize,
    /// Counters
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

async fn status(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: crate::protocol::PROTOCOL_VERSION,
        experiment: state.experiment,
        transport: state.transport.to_string(),
        num_layers: state.num_layers,
        stats: state.stats.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn router() -> Router {
        let stats = Arc::new(ServerStats::new());
        stats.record_fragment();
        stats.record_fragment();
        create_router(Arc::new(AdminState {
            stats,
            experiment: ExperimentType::Detection,
            transport: TransportKind::Tcp,
            num_layers: 3,
        }))
    }

    async fn get_json(path: &str) -> (StatusCode, serde_json::Value) {
        let response = router()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, json) = get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_status() {
        let (status, json) = get_json("/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["experiment"], "detection");
        assert_eq!(json["transport"], "TCP");
        assert_eq!(json["num_layers"], 3);
        assert_eq!(json["fragments_processed"], 2);
        assert_eq!(json["live_sessions"], 0);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (status, _) = get_json("/sessions").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
