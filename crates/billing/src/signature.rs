//! Webhook signature verification
//!
//! Stripe signs each delivery with `Stripe-Signature: t=<unix>,v1=<hex>`,
//! where `v1` is HMAC-SHA256 over `"{t}.{body}"` keyed by the endpoint
//! secret. Verification enforces a timestamp tolerance so captured payloads
//! cannot be replayed later, and compares signatures in constant time.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (seconds) of the signed timestamp.
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Verifies that a raw webhook payload genuinely originates from Stripe.
#[derive(Clone)]
pub struct SignatureVerifier {
    webhook_secret: String,
}

impl SignatureVerifier {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify the signature header and parse the payload.
    ///
    /// Returns the parsed JSON on success; any failure is
    /// `WebhookSignatureInvalid` (the caller responds 400, no mutation).
    pub fn verify(&self, payload: &str, signature_header: &str) -> BillingResult<Value> {
        self.verify_at(
            payload,
            signature_header,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }

    /// Verification with an explicit clock, so tolerance is testable.
    pub fn verify_at(&self, payload: &str, signature_header: &str, now: i64) -> BillingResult<Value> {
        // Header format: t=timestamp,v1=signature[,v0=signature]
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature_header.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1]),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::warn!("Missing v1 signature in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if (now - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        // The secret's "whsec_" prefix is not part of the key material.
        let secret_key = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if !bool::from(computed.as_bytes().ct_eq(v1_signature.as_bytes())) {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Signed payload is not valid JSON");
            BillingError::WebhookSignatureInvalid
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: i64, payload: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let verifier = SignatureVerifier::new("whsec_test_secret");
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let header = sign("whsec_test_secret", 1_700_000_000, payload);

        let value = verifier.verify_at(payload, &header, 1_700_000_000).unwrap();
        assert_eq!(value["id"], "evt_1");
    }

    #[test]
    fn rejects_tampered_payload() {
        let verifier = SignatureVerifier::new("whsec_test_secret");
        let header = sign("whsec_test_secret", 1_700_000_000, r#"{"id":"evt_1"}"#);

        let result = verifier.verify_at(r#"{"id":"evt_2"}"#, &header, 1_700_000_000);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = SignatureVerifier::new("whsec_real");
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign("whsec_other", 1_700_000_000, payload);

        assert!(verifier.verify_at(payload, &header, 1_700_000_000).is_err());
    }

    #[test]
    fn rejects_stale_timestamp() {
        let verifier = SignatureVerifier::new("whsec_test_secret");
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign("whsec_test_secret", 1_700_000_000, payload);

        let result = verifier.verify_at(payload, &header, 1_700_000_000 + 301);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn rejects_malformed_header() {
        let verifier = SignatureVerifier::new("whsec_test_secret");
        assert!(verifier.verify_at("{}", "not-a-header", 0).is_err());
        assert!(verifier.verify_at("{}", "t=abc,v1=", 0).is_err());
    }
}
