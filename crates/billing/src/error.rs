//! Billing error types
//!
//! The webhook endpoint's only client is the provider's retry machinery, so
//! the taxonomy is organized around one question: can a redelivery fix this?
//! `is_retryable` answers it; everything else is acknowledged and logged.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Bad or missing webhook signature. Not retryable; no mutation happened.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Payload is structurally invalid for its declared event type.
    /// Not retryable; a redelivery carries the same bytes.
    #[error("failed to decode event payload: {0}")]
    Decode(String),

    /// Event could not be mapped to any customer record.
    #[error("could not resolve event to a customer: {0}")]
    Resolution(String),

    /// Price id not present in the plan catalog.
    #[error("no plan configured for price {0}")]
    PlanNotFound(String),

    /// Optimistic-concurrency retries exhausted. Transient; retryable.
    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    /// Storage unavailable or query failed. Transient; retryable.
    #[error("database error: {0}")]
    Database(String),

    /// Provider REST API call failed (session fetch, event fetch).
    #[error("provider API error: {0}")]
    ProviderApi(String),

    /// Notification delivery failed. Always swallowed by callers.
    #[error("notification error: {0}")]
    Notification(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Missing or malformed configuration (environment variables).
    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether a provider redelivery could plausibly succeed.
    ///
    /// Only these surface as 500 from the webhook endpoint; anything else is
    /// acknowledged with 200 so the provider does not storm us with retries
    /// that cannot help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_) | BillingError::Conflict(_) | BillingError::ProviderApi(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        BillingError::ProviderApi(e.to_string())
    }
}
