//! Billing webhook endpoint
//!
//! Response codes are a contract with the provider's retry machinery, not
//! with a human client:
//! - 200 acknowledges everything a retry cannot fix (processed, duplicate,
//!   ignored, malformed-for-type, unresolvable) so the provider stops;
//! - 400 rejects unauthenticated payloads (provider will not retry);
//! - 500 is reserved for transient failures where a redelivery can succeed.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use kanjipress_billing::BillingError;

use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(billing) = state.billing.as_ref() else {
        // Misconfiguration on our side; a later redelivery may find the
        // server configured, so ask for one.
        tracing::error!("Billing webhook received but billing is not configured");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let event = match billing.webhooks.verify_event(&body, signature) {
        Ok(event) => event,
        Err(BillingError::WebhookSignatureInvalid) => {
            tracing::warn!("Rejected webhook with invalid signature");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid signature" })),
            )
                .into_response();
        }
        Err(e) => {
            // Authenticated but structurally broken; a retry carries the
            // same bytes, so acknowledge and log.
            tracing::warn!(error = %e, "Acknowledging undecodable webhook payload");
            return (
                StatusCode::OK,
                Json(serde_json::json!({ "received": true })),
            )
                .into_response();
        }
    };

    match billing.webhooks.handle_event(event).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "received": true })),
        )
            .into_response(),
        Err(e) if e.is_retryable() => {
            tracing::error!(error = %e, "Transient webhook failure; requesting redelivery");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Acknowledging non-retryable webhook failure");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "received": true })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use hmac::{Hmac, Mac};
    use kanjipress_billing::{BillingService, PriceIds, StripeConfig};
    use sha2::Sha256;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::routes::create_router;
    use crate::state::AppState;

    fn test_state() -> AppState {
        let config = Config {
            database_url: "postgres://localhost/kanjipress_test".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            enable_billing: true,
        };
        // Lazy pool: no connection is made unless a query runs.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        let billing = BillingService::new(
            StripeConfig {
                secret_key: "sk_test_123".to_string(),
                webhook_secret: "whsec_test".to_string(),
                api_base: "http://127.0.0.1:9".to_string(),
                price_ids: PriceIds::default(),
            },
            pool.clone(),
        );
        AppState::with_billing(pool, config, Arc::new(billing))
    }

    fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_signature_is_rejected_with_400() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                Request::post("/webhooks/billing")
                    .body(Body::from("{\"id\":\"evt_1\",\"type\":\"invoice.paid\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tampered_signature_is_rejected_with_400() {
        let app = create_router(test_state());
        let payload = "{\"id\":\"evt_1\",\"type\":\"invoice.paid\",\"data\":{\"object\":{}}}";
        // Signed with the wrong secret.
        let header = sign("whsec_other", time::OffsetDateTime::now_utc().unix_timestamp(), payload);

        let response = app
            .oneshot(
                Request::post("/webhooks/billing")
                    .header("stripe-signature", header)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn authenticated_but_malformed_payload_is_acknowledged() {
        let app = create_router(test_state());
        // Known type with a missing required field: decode error, not auth error.
        let payload = "{\"id\":\"evt_1\",\"type\":\"customer.subscription.paused\",\"data\":{\"object\":{\"id\":\"sub_1\"}}}";
        let header = sign("whsec_test", time::OffsetDateTime::now_utc().unix_timestamp(), payload);

        let response = app
            .oneshot(
                Request::post("/webhooks/billing")
                    .header("stripe-signature", header)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
