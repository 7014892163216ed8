//! Common routes: health, readiness, version.

use crate::bridge::{BridgeRequest, SYSTEM_SERVICE};
use crate::state::AppState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    metadata: &'static str,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

/// Ready once the metadata store answers a one-row application listing.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyBody>) {
    let probe = BridgeRequest::get(SYSTEM_SERVICE, "app").with_query("limit", "1");
    match state.packager.store().handle_request(probe).await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyBody {
                status: "ok",
                metadata: "ok",
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyBody {
                    status: "degraded",
                    metadata: "unavailable",
                }),
            )
        }
    }
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /health, GET /ready, GET /version.
pub fn common_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/version", get(version))
        .with_state(state)
}
