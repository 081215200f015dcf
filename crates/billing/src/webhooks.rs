//! Billing webhook handling
//!
//! The full pipeline for one delivery:
//! verify signature → decode → claim idempotency → resolve customer →
//! apply the state machine → version-guarded write → finish ledger →
//! dispatch side effects (post-commit, fire-and-forget).
//!
//! Concurrent deliveries are serialized two ways: the ledger claim is a
//! single atomic statement (one winner per event id), and same-customer
//! races between *different* events are resolved by the bounded
//! read-compute-write cycle against the record version.

use std::sync::Arc;

use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::audit::AuditEntry;
use crate::client::StripeClient;
use crate::customer::{CustomerRecord, CustomerResolver};
use crate::email::{BillingEmailService, NotificationDispatcher};
use crate::entitlement::{self, SideEffect};
use crate::error::{BillingError, BillingResult};
use crate::events::{decode_event, BillingEvent, EventKind};
use crate::idempotency::IdempotencyGuard;
use crate::plans::PlanCatalog;
use crate::signature::SignatureVerifier;
use crate::store::{CasOutcome, EntitlementStore, WebhookEventRecord};

/// Attempts at the read-compute-write cycle before the conflict surfaces as
/// a transient failure (the provider will redeliver).
const MAX_WRITE_ATTEMPTS: usize = 3;
const WRITE_RETRY_INTERVAL_MS: u64 = 25;

/// Webhook handler for billing provider events
pub struct WebhookHandler {
    stripe: StripeClient,
    store: Arc<dyn EntitlementStore>,
    verifier: SignatureVerifier,
    resolver: CustomerResolver,
    guard: IdempotencyGuard,
    catalog: PlanCatalog,
    notifier: NotificationDispatcher,
}

/// What one processed event did to the record.
struct AppliedEvent {
    record: CustomerRecord,
    effects: Vec<SideEffect>,
    wrote: bool,
}

impl WebhookHandler {
    pub fn new(
        stripe: StripeClient,
        store: Arc<dyn EntitlementStore>,
        email: BillingEmailService,
    ) -> Self {
        let verifier = SignatureVerifier::new(stripe.config().webhook_secret.clone());
        let catalog = PlanCatalog::from_price_ids(&stripe.config().price_ids);
        let resolver = CustomerResolver::new(store.clone());
        let guard = IdempotencyGuard::new(store.clone());
        let notifier = NotificationDispatcher::new(email);

        Self {
            stripe,
            store,
            verifier,
            resolver,
            guard,
            catalog,
            notifier,
        }
    }

    /// Verify and decode a raw webhook delivery.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<BillingEvent> {
        let value = self.verifier.verify(payload, signature)?;
        decode_event(&value)
    }

    /// Handle a verified event end to end.
    ///
    /// Duplicates (including concurrent redeliveries) return Ok without side
    /// effects: the atomic ledger claim admits exactly one processor per
    /// event id.
    pub async fn handle_event(&self, event: BillingEvent) -> BillingResult<()> {
        if !self.guard.claim(&event).await? {
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing billing webhook event (claimed exclusive processing rights)"
        );

        let result = self.process_event_internal(&event).await;

        match &result {
            Ok(()) => self.guard.mark_success(&event.id).await,
            Err(e) => self.guard.mark_error(&event.id, &e.to_string()).await,
        }

        result
    }

    /// Internal event processing logic, shared with replay.
    async fn process_event_internal(&self, event: &BillingEvent) -> BillingResult<()> {
        match &event.kind {
            EventKind::Ignored { event_type } => {
                // Tracked so new provider event types surface in the logs.
                tracing::info!(
                    event_type = %event_type,
                    event_id = %event.id,
                    "Received unhandled event type - no handler configured"
                );
                return Ok(());
            }
            EventKind::CheckoutExpired { session_id } => {
                tracing::info!(
                    event_id = %event.id,
                    session_id = %session_id,
                    "Checkout session expired without completing"
                );
                return Ok(());
            }
            _ => {}
        }

        let event = self.with_resolved_price(event).await?;

        let applied = RetryIf::spawn(
            FixedInterval::from_millis(WRITE_RETRY_INTERVAL_MS).take(MAX_WRITE_ATTEMPTS - 1),
            || self.apply_once(&event),
            |e: &BillingError| matches!(e, BillingError::Conflict(_)),
        )
        .await
        .map_err(|e| match e {
            BillingError::Conflict(msg) => {
                tracing::warn!(
                    event_id = %event.id,
                    attempts = MAX_WRITE_ATTEMPTS,
                    "Optimistic-concurrency retries exhausted"
                );
                BillingError::Conflict(msg)
            }
            other => other,
        })?;

        // Side effects only after the write is durably committed.
        self.notifier.dispatch(applied.effects);

        let audit = AuditEntry::new(applied.record.id, event.event_type.clone())
            .provider_event(event.id.clone())
            .data(serde_json::json!({
                "has_access": applied.record.has_access,
                "plan_id": applied.record.plan_id,
                "record_changed": applied.wrote,
            }));
        if let Err(e) = self.store.append_audit(&audit).await {
            tracing::warn!(error = %e, "Failed to append billing audit entry");
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            customer_id = %applied.record.id,
            has_access = applied.record.has_access,
            record_changed = applied.wrote,
            "Billing event applied"
        );

        Ok(())
    }

    /// One read-compute-write cycle. A version conflict is returned as
    /// `Conflict` for the retry wrapper; each retry re-reads fresh state.
    async fn apply_once(&self, event: &BillingEvent) -> BillingResult<AppliedEvent> {
        let resolved = match self.resolver.resolve(event).await {
            Ok(resolved) => resolved,
            Err(BillingError::Resolution(msg)) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Could not resolve event to a customer; nothing to update"
                );
                return Err(BillingError::Resolution(msg));
            }
            Err(e) => return Err(e),
        };

        let outcome = entitlement::apply(
            &resolved.record,
            resolved.newly_created,
            event,
            &self.catalog,
        );

        if outcome.changed {
            match self
                .store
                .compare_and_swap(&outcome.record, resolved.version)
                .await?
            {
                CasOutcome::Applied { .. } => {}
                CasOutcome::Conflict => {
                    return Err(BillingError::Conflict(format!(
                        "version moved for customer {}",
                        outcome.record.id
                    )));
                }
            }
        }

        Ok(AppliedEvent {
            record: outcome.record,
            effects: outcome.effects,
            wrote: outcome.changed,
        })
    }

    /// Checkout completions sometimes arrive without inlined line items.
    /// Recover the purchased price (and any missing identity) from the
    /// session itself before giving up on the event.
    async fn with_resolved_price(&self, event: &BillingEvent) -> BillingResult<BillingEvent> {
        let session = match &event.kind {
            EventKind::CheckoutCompleted(session) if session.price_id.is_none() => session,
            _ => return Ok(event.clone()),
        };

        tracing::info!(
            event_id = %event.id,
            session_id = %session.session_id,
            "Checkout event missing line items; fetching session from provider"
        );

        let fetched = self
            .stripe
            .fetch_checkout_session(&session.session_id)
            .await?;

        let mut merged = session.clone();
        merged.price_id = fetched.price_id;
        if merged.customer_id.is_none() {
            merged.customer_id = fetched.customer_id;
        }
        if merged.customer_email.is_none() {
            merged.customer_email = fetched.customer_email;
        }
        if merged.client_reference_id.is_none() {
            merged.client_reference_id = fetched.client_reference_id;
        }

        if merged.price_id.is_none() {
            return Err(BillingError::Decode(format!(
                "checkout session {} has no resolvable price id",
                merged.session_id
            )));
        }

        if let Some(price_id) = &merged.price_id {
            if self.catalog.resolve(price_id).is_none() {
                tracing::warn!(
                    price_id = %price_id,
                    session_id = %merged.session_id,
                    "Checkout completed for a price outside the configured catalog"
                );
            }
        }

        Ok(BillingEvent {
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            created: event.created,
            kind: EventKind::CheckoutCompleted(merged),
        })
    }

    // ============ WEBHOOK REPLAY FUNCTIONALITY ============

    /// List stored webhook events, optionally filtered by status.
    pub async fn list_webhooks(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store.list_events(status_filter, limit, offset).await
    }

    /// List webhook events that failed processing.
    pub async fn list_failed_webhooks(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store.list_events(Some("error"), limit, offset).await
    }

    /// Replay a webhook event by refetching it from the provider and
    /// re-processing it.
    ///
    /// Useful after transient failures or for manual intervention once a bug
    /// is fixed. Replay relies on the state machine's idempotence: re-running
    /// an already-applied event settles into the same record.
    pub async fn replay_webhook(&self, event_id: &str) -> BillingResult<WebhookReplayResult> {
        tracing::info!(event_id = %event_id, "Attempting to replay webhook event");

        let (previous_status, previous_error) =
            self.store.event_status(event_id).await?.ok_or_else(|| {
                BillingError::NotFound(format!("webhook event {} not found", event_id))
            })?;

        let raw = self.stripe.fetch_event(event_id).await?;
        let event = decode_event(&raw)?;

        self.store
            .finish_event(
                event_id,
                "replaying",
                Some(&format!(
                    "Replay initiated. Previous status: {}. Previous error: {}",
                    previous_status,
                    previous_error.as_deref().unwrap_or("none")
                )),
            )
            .await?;

        let process_result = self.process_event_internal(&event).await;

        let (new_status, new_error) = match &process_result {
            Ok(()) => ("success".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };
        self.store
            .finish_event(event_id, &new_status, new_error.as_deref())
            .await?;

        tracing::info!(
            event_id = %event_id,
            previous_status = %previous_status,
            new_status = %new_status,
            success = process_result.is_ok(),
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            provider_event_id: event_id.to_string(),
            event_type: event.event_type,
            previous_status,
            previous_error,
            new_status,
            new_error,
            success: process_result.is_ok(),
        })
    }

    /// Reset a stuck or failed webhook so it can be claimed again.
    pub async fn reset_stuck_webhook(&self, event_id: &str) -> BillingResult<()> {
        self.store.reclaim_for_replay(event_id).await?;
        tracing::info!(event_id = %event_id, "Webhook reset for replay");
        Ok(())
    }
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookReplayResult {
    pub provider_event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}
