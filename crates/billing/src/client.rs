//! Stripe configuration and REST client
//!
//! The engine talks to Stripe over two narrow calls: fetching a checkout
//! session (to recover line items the event did not inline) and fetching a
//! raw event (for admin replay). Everything else arrives via webhooks.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{BillingError, BillingResult};
use crate::events::CheckoutSession;

const DEFAULT_API_BASE: &str = "https://api.stripe.com";
const PROVIDER_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Configured Stripe price ids, one per purchasable plan.
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub plus_monthly: Option<String>,
    pub plus_annual: Option<String>,
    pub school_monthly: Option<String>,
    pub school_annual: Option<String>,
}

impl PriceIds {
    fn from_env() -> Self {
        Self {
            plus_monthly: std::env::var("STRIPE_PRICE_PLUS_MONTHLY").ok(),
            plus_annual: std::env::var("STRIPE_PRICE_PLUS_ANNUAL").ok(),
            school_monthly: std::env::var("STRIPE_PRICE_SCHOOL_MONTHLY").ok(),
            school_annual: std::env::var("STRIPE_PRICE_SCHOOL_ANNUAL").ok(),
        }
    }
}

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub api_base: String,
    pub price_ids: PriceIds,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let api_base =
            std::env::var("STRIPE_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            api_base,
            price_ids: PriceIds::from_env(),
        })
    }
}

/// Thin Stripe REST client
#[derive(Clone)]
pub struct StripeClient {
    config: Arc<StripeConfig>,
    http: reqwest::Client,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            config: Arc::new(config),
            http,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Fetch a checkout session with its line items expanded.
    ///
    /// Used when a `checkout.session.completed` event arrives without inlined
    /// line items; the purchased price id lives on the session.
    pub async fn fetch_checkout_session(&self, session_id: &str) -> BillingResult<CheckoutSession> {
        let url = format!(
            "{}/v1/checkout/sessions/{}?expand[]=line_items",
            self.config.api_base, session_id
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BillingError::NotFound(format!(
                "checkout session {} not found",
                session_id
            )));
        }
        if !response.status().is_success() {
            return Err(BillingError::ProviderApi(format!(
                "checkout session fetch returned {}",
                response.status()
            )));
        }

        let body: Value = response.json().await?;
        CheckoutSession::from_object(&body).ok_or_else(|| {
            BillingError::ProviderApi(format!(
                "checkout session {} response missing id",
                session_id
            ))
        })
    }

    /// Fetch a raw event by id, for webhook replay.
    pub async fn fetch_event(&self, event_id: &str) -> BillingResult<Value> {
        let url = format!("{}/v1/events/{}", self.config.api_base, event_id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BillingError::NotFound(format!(
                "event {} not found at provider",
                event_id
            )));
        }
        if !response.status().is_success() {
            return Err(BillingError::ProviderApi(format!(
                "event fetch returned {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}
