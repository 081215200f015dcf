//! Admin webhook inspection and replay
//!
//! Operator surface over the processed-event ledger: list deliveries, replay
//! one after a fix, or reset a stuck claim. These routes sit behind the
//! deployment's admin ingress, not the public host.

use axum::extract::{Path, Query, State};
use axum::Json;
use kanjipress_billing::{WebhookEventRecord, WebhookReplayResult};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListQuery {
    fn page(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    let billing = require_billing(&state)?;
    let (limit, offset) = query.page();

    let records = billing
        .webhooks
        .list_webhooks(query.status.as_deref(), limit, offset)
        .await?;
    Ok(Json(records))
}

pub async fn list_failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    let billing = require_billing(&state)?;
    let (limit, offset) = query.page();

    let records = billing.webhooks.list_failed_webhooks(limit, offset).await?;
    Ok(Json(records))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    let billing = require_billing(&state)?;

    let result = billing.webhooks.replay_webhook(&event_id).await?;
    Ok(Json(result))
}

pub async fn reset_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let billing = require_billing(&state)?;

    billing.webhooks.reset_stuck_webhook(&event_id).await?;
    Ok(Json(serde_json::json!({ "reset": event_id })))
}

fn require_billing(state: &AppState) -> ApiResult<&std::sync::Arc<kanjipress_billing::BillingService>> {
    state
        .billing
        .as_ref()
        .ok_or_else(|| ApiError::Internal("billing is not configured".to_string()))
}
