// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries context strings
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kanjipress Billing Module
//!
//! Converts asynchronous billing-provider webhooks into a consistent,
//! idempotent local record of paid access.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC verification of webhook deliveries
//! - **Event Decoding**: closed tagged union over the provider event catalog
//! - **Customer Resolution**: deterministic fallback chain from event to record
//! - **Entitlement State Machine**: pure, total, idempotent transitions
//! - **Idempotency Guard**: atomic per-event claim against the shared database
//! - **Optimistic Concurrency**: version-guarded writes with bounded retry
//! - **Email Notifications**: best-effort, post-commit side effects
//! - **Webhook Replay**: inspect, reset, and re-process stored deliveries

pub mod audit;
pub mod client;
pub mod customer;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod plans;
pub mod signature;
pub mod store;
pub mod webhooks;


// Audit
pub use audit::AuditEntry;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Customer
pub use customer::{CustomerRecord, CustomerResolver, ResolvedCustomer};

// Email
pub use email::{BillingEmailService, EmailConfig, NotificationDispatcher};

// Entitlement
pub use entitlement::{apply, EntitlementState, Outcome, SideEffect};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{decode_event, BillingEvent, CheckoutSession, EventKind};

// Idempotency
pub use idempotency::IdempotencyGuard;

// Plans
pub use plans::{Plan, PlanCatalog};

// Signature
pub use signature::SignatureVerifier;

// Store
pub use store::{
    CasOutcome, EntitlementStore, MemoryStore, PgStore, VersionedRecord, WebhookEventRecord,
};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookReplayResult};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines the engine's components
pub struct BillingService {
    pub email: BillingEmailService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let email = BillingEmailService::from_env();
        Ok(Self::with_parts(stripe, pool, email))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);
        let email = BillingEmailService::from_env();
        Self::with_parts(stripe, pool, email)
    }

    fn with_parts(stripe: StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        let store: Arc<dyn EntitlementStore> = Arc::new(PgStore::new(pool));
        Self {
            email: email.clone(),
            webhooks: WebhookHandler::new(stripe, store, email),
        }
    }
}
