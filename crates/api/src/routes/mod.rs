//! Route definitions

mod admin;
mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(webhooks::billing_webhook))
        .route("/admin/webhooks", get(admin::list_webhooks))
        .route("/admin/webhooks/failed", get(admin::list_failed_webhooks))
        .route(
            "/admin/webhooks/{event_id}/replay",
            post(admin::replay_webhook),
        )
        .route(
            "/admin/webhooks/{event_id}/reset",
            post(admin::reset_webhook),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
