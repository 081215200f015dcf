//! Billing event decoding
//!
//! Webhook payloads arrive as `{id, type, created, data: {object}}`. The
//! decoder maps them onto a closed set of typed variants; everything the
//! engine does downstream dispatches on `EventKind`, never on raw JSON.
//!
//! Unknown event types decode to [`EventKind::Ignored`] rather than failing:
//! the provider's catalog grows over time and an unrecognized type must not
//! break ingestion. A *known* type missing required fields is a hard
//! `Decode` error, acknowledged to the provider without retry.

use serde_json::Value;

use crate::error::{BillingError, BillingResult};

/// A single verified, decoded provider event.
#[derive(Debug, Clone)]
pub struct BillingEvent {
    /// Provider-assigned, globally unique. The idempotency key.
    pub id: String,
    /// The raw `type` string, kept for the processed-event ledger.
    pub event_type: String,
    /// Provider-side creation time, unix seconds.
    pub created: i64,
    pub kind: EventKind,
}

/// Closed set of event variants the engine understands.
#[derive(Debug, Clone)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSession),
    CheckoutExpired { session_id: String },
    SubscriptionPaused(SubscriptionFacts),
    SubscriptionResumed(SubscriptionFacts),
    SubscriptionUpdated(SubscriptionFacts),
    TrialWillEnd(SubscriptionFacts),
    SubscriptionDeleted(SubscriptionFacts),
    InvoicePaid(InvoiceFacts),
    InvoicePaymentFailed(InvoiceFacts),
    /// Recognized as well-formed but not handled by this engine.
    Ignored { event_type: String },
}

/// Checkout session read model.
///
/// Built either from the inlined event object or from a provider API fetch
/// when line items were not inlined.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub session_id: String,
    /// Locally issued id embedded at checkout time; identity before a
    /// billing customer id exists.
    pub client_reference_id: Option<String>,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    /// Purchased price, derived from the first line item.
    pub price_id: Option<String>,
    pub amount_total: Option<i64>,
}

impl CheckoutSession {
    /// Build from a checkout session object (inlined or API response).
    pub fn from_object(object: &Value) -> Option<Self> {
        let session_id = object.get("id")?.as_str()?.to_string();

        Some(Self {
            session_id,
            client_reference_id: str_field(object, "client_reference_id"),
            customer_id: expandable_id(object.get("customer")),
            customer_email: str_field(object, "customer_email").or_else(|| {
                object
                    .pointer("/customer_details/email")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }),
            price_id: object
                .pointer("/line_items/data/0/price/id")
                .and_then(Value::as_str)
                .map(str::to_string),
            amount_total: object.get("amount_total").and_then(Value::as_i64),
        })
    }
}

/// Fields shared by the subscription lifecycle events.
#[derive(Debug, Clone)]
pub struct SubscriptionFacts {
    pub subscription_id: String,
    pub customer_id: String,
    pub customer_email: Option<String>,
    pub price_id: Option<String>,
    /// Pause marker, populated on `customer.subscription.updated` when the
    /// object carries a `pause_collection` field (set → Some(true),
    /// explicit null → Some(false), absent → None).
    pub paused: Option<bool>,
    /// Populated on `customer.subscription.trial_will_end`.
    pub trial_end: Option<i64>,
}

/// Fields carried by invoice events.
#[derive(Debug, Clone)]
pub struct InvoiceFacts {
    pub invoice_id: String,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    /// Price of the first subscription line item.
    pub price_id: Option<String>,
    pub amount_cents: i64,
    pub attempt_count: i64,
}

/// Decode a verified payload into a typed event.
pub fn decode_event(payload: &Value) -> BillingResult<BillingEvent> {
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| BillingError::Decode("event missing id".to_string()))?
        .to_string();
    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| BillingError::Decode("event missing type".to_string()))?
        .to_string();
    let created = payload.get("created").and_then(Value::as_i64).unwrap_or(0);

    let object = payload.pointer("/data/object").unwrap_or(&Value::Null);

    let kind = match event_type.as_str() {
        "checkout.session.completed" => {
            let session = CheckoutSession::from_object(object).ok_or_else(|| {
                BillingError::Decode("checkout.session.completed missing session id".to_string())
            })?;
            if session.customer_id.is_none()
                && session.customer_email.is_none()
                && session.client_reference_id.is_none()
            {
                return Err(BillingError::Decode(
                    "checkout.session.completed carries no customer identity".to_string(),
                ));
            }
            EventKind::CheckoutCompleted(session)
        }
        "checkout.session.expired" => EventKind::CheckoutExpired {
            session_id: str_field(object, "id").ok_or_else(|| {
                BillingError::Decode("checkout.session.expired missing session id".to_string())
            })?,
        },
        "customer.subscription.paused" => {
            EventKind::SubscriptionPaused(subscription_facts(object, &event_type)?)
        }
        "customer.subscription.resumed" => {
            EventKind::SubscriptionResumed(subscription_facts(object, &event_type)?)
        }
        "customer.subscription.updated" => {
            EventKind::SubscriptionUpdated(subscription_facts(object, &event_type)?)
        }
        "customer.subscription.trial_will_end" => {
            EventKind::TrialWillEnd(subscription_facts(object, &event_type)?)
        }
        "customer.subscription.deleted" => {
            EventKind::SubscriptionDeleted(subscription_facts(object, &event_type)?)
        }
        "invoice.paid" => EventKind::InvoicePaid(invoice_facts(object, &event_type, "amount_paid")?),
        "invoice.payment_failed" => {
            EventKind::InvoicePaymentFailed(invoice_facts(object, &event_type, "amount_due")?)
        }
        _ => EventKind::Ignored {
            event_type: event_type.clone(),
        },
    };

    Ok(BillingEvent {
        id,
        event_type,
        created,
        kind,
    })
}

fn subscription_facts(object: &Value, event_type: &str) -> BillingResult<SubscriptionFacts> {
    let subscription_id = str_field(object, "id")
        .ok_or_else(|| BillingError::Decode(format!("{} missing subscription id", event_type)))?;
    let customer_id = expandable_id(object.get("customer"))
        .ok_or_else(|| BillingError::Decode(format!("{} missing customer", event_type)))?;

    // pause_collection distinguishes "explicitly unpaused" (null) from
    // "nothing said about pausing" (absent).
    let paused = match object.get("pause_collection") {
        Some(Value::Null) => Some(false),
        Some(_) => Some(true),
        None => None,
    };

    Ok(SubscriptionFacts {
        subscription_id,
        customer_id,
        customer_email: str_field(object, "customer_email"),
        price_id: object
            .pointer("/items/data/0/price/id")
            .and_then(Value::as_str)
            .map(str::to_string),
        paused,
        trial_end: object.get("trial_end").and_then(Value::as_i64),
    })
}

fn invoice_facts(object: &Value, event_type: &str, amount_field: &str) -> BillingResult<InvoiceFacts> {
    let invoice_id = str_field(object, "id")
        .ok_or_else(|| BillingError::Decode(format!("{} missing invoice id", event_type)))?;

    let customer_id = expandable_id(object.get("customer"));
    let customer_email = str_field(object, "customer_email");

    if customer_id.is_none() && customer_email.is_none() {
        return Err(BillingError::Decode(format!(
            "{} carries no customer identity",
            event_type
        )));
    }

    Ok(InvoiceFacts {
        invoice_id,
        customer_id,
        customer_email,
        price_id: object
            .pointer("/lines/data/0/price/id")
            .and_then(Value::as_str)
            .or_else(|| {
                object
                    .pointer("/lines/data/0/plan/id")
                    .and_then(Value::as_str)
            })
            .map(str::to_string),
        amount_cents: object.get(amount_field).and_then(Value::as_i64).unwrap_or(0),
        attempt_count: object.get("attempt_count").and_then(Value::as_i64).unwrap_or(0),
    })
}

impl BillingEvent {
    /// Provider customer id carried by the event, if any.
    pub fn customer_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::CheckoutCompleted(s) => s.customer_id.as_deref(),
            EventKind::SubscriptionPaused(f)
            | EventKind::SubscriptionResumed(f)
            | EventKind::SubscriptionUpdated(f)
            | EventKind::TrialWillEnd(f)
            | EventKind::SubscriptionDeleted(f) => Some(&f.customer_id),
            EventKind::InvoicePaid(f) | EventKind::InvoicePaymentFailed(f) => {
                f.customer_id.as_deref()
            }
            EventKind::CheckoutExpired { .. } | EventKind::Ignored { .. } => None,
        }
    }

    /// Customer email carried by the event, if any.
    pub fn customer_email(&self) -> Option<&str> {
        match &self.kind {
            EventKind::CheckoutCompleted(s) => s.customer_email.as_deref(),
            EventKind::SubscriptionPaused(f)
            | EventKind::SubscriptionResumed(f)
            | EventKind::SubscriptionUpdated(f)
            | EventKind::TrialWillEnd(f)
            | EventKind::SubscriptionDeleted(f) => f.customer_email.as_deref(),
            EventKind::InvoicePaid(f) | EventKind::InvoicePaymentFailed(f) => {
                f.customer_email.as_deref()
            }
            EventKind::CheckoutExpired { .. } | EventKind::Ignored { .. } => None,
        }
    }

    /// Locally issued reference id, present only on checkout completion.
    pub fn client_reference_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::CheckoutCompleted(s) => s.client_reference_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_checkout_completed(&self) -> bool {
        matches!(self.kind, EventKind::CheckoutCompleted(_))
    }
}

fn str_field(object: &Value, field: &str) -> Option<String> {
    object.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Extract an id from a field that may be a bare id string or an expanded
/// object with an `id` member.
fn expandable_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}
