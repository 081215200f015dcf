//! Billing audit trail
//!
//! Append-only record of applied entitlement transitions, written after the
//! fact for operators and reconciliation. Audit writes are best-effort: a
//! failure is logged and never fails the webhook.

use serde_json::Value;
use uuid::Uuid;

/// One audit entry, built alongside an applied transition.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub customer_id: Uuid,
    pub event_type: String,
    pub provider_event_id: Option<String>,
    pub data: Value,
}

impl AuditEntry {
    pub fn new(customer_id: Uuid, event_type: impl Into<String>) -> Self {
        Self {
            customer_id,
            event_type: event_type.into(),
            provider_event_id: None,
            data: Value::Object(Default::default()),
        }
    }

    pub fn provider_event(mut self, event_id: impl Into<String>) -> Self {
        self.provider_event_id = Some(event_id.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}
