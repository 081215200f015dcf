//! Event-level idempotency guard
//!
//! The state machine makes transitions *correct* under replay; this guard
//! makes them *silent* under replay — no second write, no second welcome
//! email. Claim and record are one atomic compare-and-set against the
//! processed-event ledger, so concurrent deliveries of the same event id
//! cannot both proceed.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::events::BillingEvent;
use crate::store::EntitlementStore;

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn EntitlementStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Try to claim exclusive processing rights for this event.
    ///
    /// Returns false for duplicates; the caller acknowledges those with
    /// success and does nothing else.
    pub async fn claim(&self, event: &BillingEvent) -> BillingResult<bool> {
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed = self
            .store
            .claim_event(&event.id, &event.event_type, event_timestamp)
            .await?;

        if !claimed {
            let reason = match self.store.event_status(&event.id).await.ok().flatten() {
                Some((status, _)) if status == "success" => "already processed successfully",
                Some((status, _)) if status == "processing" => {
                    "currently being processed by another worker"
                }
                Some(_) => "exists with another status",
                None => "unknown (race condition?)",
            };

            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                reason = %reason,
                "Duplicate webhook event - atomic idempotency check"
            );
        }

        Ok(claimed)
    }

    pub async fn mark_success(&self, event_id: &str) {
        self.finish(event_id, "success", None).await;
    }

    pub async fn mark_error(&self, event_id: &str, error: &str) {
        self.finish(event_id, "error", Some(error)).await;
    }

    /// Record the disposition, retrying once. A ledger row left in
    /// `processing` looks stuck until the timeout recovery kicks in, so the
    /// update is worth a second attempt.
    async fn finish(&self, event_id: &str, result: &str, error_message: Option<&str>) {
        if let Err(e) = self.store.finish_event(event_id, result, error_message).await {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to update webhook ledger failed, retrying..."
            );

            if let Err(retry_err) = self.store.finish_event(event_id, result, error_message).await {
                tracing::error!(
                    event_id = %event_id,
                    processing_result = %result,
                    first_error = %e,
                    retry_error = %retry_err,
                    "CRITICAL: Failed to update webhook ledger after retry. \
                     Event may appear stuck in 'processing' state. \
                     Manual intervention may be required."
                );
            }
        }
    }
}
