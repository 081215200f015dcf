//! Entitlement state machine
//!
//! The heart of the engine: a pure, total function from (current record,
//! event kind) to (next record, side effects). Redelivery is expected, not
//! exceptional, so every transition is idempotent by construction — applying
//! the same event twice from the same state yields the same state.
//!
//! State is a projection of the record, never stored separately:
//! no record → Unprovisioned; access → Active; no access with a plan on
//! file → Paused (subscription intact); no access and no plan → Revoked
//! (terminal until a new checkout).

use crate::customer::CustomerRecord;
use crate::events::{BillingEvent, EventKind};
use crate::plans::PlanCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitlementState {
    Unprovisioned,
    Active,
    Paused,
    Revoked,
}

impl EntitlementState {
    /// Project the state of a (possibly absent) record.
    pub fn of(record: Option<&CustomerRecord>) -> Self {
        match record {
            None => EntitlementState::Unprovisioned,
            Some(r) if r.has_access => EntitlementState::Active,
            Some(r) if r.plan_id.is_some() => EntitlementState::Paused,
            Some(_) => EntitlementState::Revoked,
        }
    }
}

impl std::fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntitlementState::Unprovisioned => "unprovisioned",
            EntitlementState::Active => "active",
            EntitlementState::Paused => "paused",
            EntitlementState::Revoked => "revoked",
        };
        write!(f, "{}", s)
    }
}

/// A side effect scheduled by a transition. Dispatched only after the record
/// write commits, and never allowed to fail the request.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    WelcomeEmail {
        email: String,
        plan_name: String,
    },
    TrialEndingNotice {
        email: String,
        plan_name: String,
        days_remaining: i64,
    },
}

/// Result of applying one event to one record.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub record: CustomerRecord,
    /// False when the event was informational for this state; no write and
    /// no side effects happen.
    pub changed: bool,
    pub effects: Vec<SideEffect>,
}

impl Outcome {
    fn unchanged(record: CustomerRecord) -> Self {
        Self {
            record,
            changed: false,
            effects: Vec::new(),
        }
    }
}

/// Apply one event to a resolved record.
///
/// `is_new` marks a record created by this resolution (checkout bootstrap);
/// it is what distinguishes the welcome-email transition from a re-checkout
/// by an existing customer.
pub fn apply(
    current: &CustomerRecord,
    is_new: bool,
    event: &BillingEvent,
    catalog: &PlanCatalog,
) -> Outcome {
    let state = if is_new {
        EntitlementState::Unprovisioned
    } else {
        EntitlementState::of(Some(current))
    };

    match &event.kind {
        EventKind::CheckoutCompleted(session) => {
            let mut next = current.clone();
            next.has_access = true;
            if let Some(price_id) = &session.price_id {
                next.plan_id = Some(price_id.clone());
            }
            // Adopt identity the checkout taught us: a real provider id
            // supersedes an email placeholder, and the receipt email is the
            // freshest address on file.
            if let Some(customer_id) = &session.customer_id {
                next.billing_customer_id = Some(customer_id.clone());
            }
            if let Some(email) = &session.customer_email {
                next.email = email.clone();
            }

            let mut effects = Vec::new();
            if state == EntitlementState::Unprovisioned {
                let plan_name = next
                    .plan_id
                    .as_deref()
                    .map(|p| catalog.plan_name(p))
                    .unwrap_or_else(|| "Kanjipress".to_string());
                effects.push(SideEffect::WelcomeEmail {
                    email: next.email.clone(),
                    plan_name,
                });
            }

            let changed = is_new || next != *current;
            Outcome {
                record: next,
                changed,
                effects,
            }
        }

        EventKind::SubscriptionPaused(_) => match state {
            EntitlementState::Active => {
                let mut next = current.clone();
                next.has_access = false;
                Outcome {
                    record: next,
                    changed: true,
                    effects: Vec::new(),
                }
            }
            // Already paused, revoked, or never provisioned: nothing to take away.
            _ => Outcome::unchanged(current.clone()),
        },

        EventKind::SubscriptionResumed(_) => match state {
            EntitlementState::Paused => {
                let mut next = current.clone();
                next.has_access = true;
                Outcome {
                    record: next,
                    changed: true,
                    effects: Vec::new(),
                }
            }
            // Revoked stays revoked: only a new checkout revives it.
            _ => Outcome::unchanged(current.clone()),
        },

        EventKind::SubscriptionUpdated(facts) => match facts.paused {
            Some(true) => reapply_as(current, is_new, event, catalog, || {
                EventKind::SubscriptionPaused(facts.clone())
            }),
            Some(false) => reapply_as(current, is_new, event, catalog, || {
                EventKind::SubscriptionResumed(facts.clone())
            }),
            None => {
                // A plan change on an entitled record re-points the plan;
                // anything else is informational.
                match (&facts.price_id, &current.plan_id) {
                    (Some(new_price), Some(old_price))
                        if new_price != old_price && state != EntitlementState::Revoked =>
                    {
                        let mut next = current.clone();
                        next.plan_id = Some(new_price.clone());
                        Outcome {
                            record: next,
                            changed: true,
                            effects: Vec::new(),
                        }
                    }
                    _ => Outcome::unchanged(current.clone()),
                }
            }
        },

        EventKind::TrialWillEnd(facts) => {
            let mut outcome = Outcome::unchanged(current.clone());
            if state == EntitlementState::Active {
                // The provider fires this ~3 days ahead; compute remaining
                // days from the event's own clock so replays are stable.
                let days_remaining = facts
                    .trial_end
                    .map(|end| ((end - event.created) / 86_400).max(1))
                    .unwrap_or(3);
                let plan_name = current
                    .plan_id
                    .as_deref()
                    .map(|p| catalog.plan_name(p))
                    .unwrap_or_else(|| "Kanjipress".to_string());
                outcome.effects.push(SideEffect::TrialEndingNotice {
                    email: current.email.clone(),
                    plan_name,
                    days_remaining,
                });
            }
            outcome
        }

        EventKind::SubscriptionDeleted(_) => match state {
            EntitlementState::Revoked | EntitlementState::Unprovisioned => {
                Outcome::unchanged(current.clone())
            }
            _ => {
                let mut next = current.clone();
                next.has_access = false;
                next.plan_id = None;
                Outcome {
                    record: next,
                    changed: true,
                    effects: Vec::new(),
                }
            }
        },

        EventKind::InvoicePaid(facts) => {
            // An invoice only confirms the plan already on file. A stale or
            // duplicate invoice for another price must never re-grant access
            // under the wrong plan.
            match (&facts.price_id, &current.plan_id) {
                (Some(invoice_price), Some(plan_id)) if invoice_price != plan_id => {
                    tracing::warn!(
                        customer_id = %current.id,
                        invoice_price = %invoice_price,
                        plan_id = %plan_id,
                        invoice_id = %facts.invoice_id,
                        "Invoice price does not match recorded plan; ignoring"
                    );
                }
                _ => {}
            }
            Outcome::unchanged(current.clone())
        }

        // Rely on the eventual subscription.deleted for revocation.
        EventKind::InvoicePaymentFailed(_) => Outcome::unchanged(current.clone()),

        EventKind::CheckoutExpired { .. } | EventKind::Ignored { .. } => {
            Outcome::unchanged(current.clone())
        }
    }
}

/// Re-dispatch an event under a substituted kind (pause markers on
/// `subscription.updated` behave exactly like the dedicated events).
fn reapply_as(
    current: &CustomerRecord,
    is_new: bool,
    event: &BillingEvent,
    catalog: &PlanCatalog,
    kind: impl FnOnce() -> EventKind,
) -> Outcome {
    let substituted = BillingEvent {
        id: event.id.clone(),
        event_type: event.event_type.clone(),
        created: event.created,
        kind: kind(),
    };
    apply(current, is_new, &substituted, catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::decode_event;
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn catalog() -> PlanCatalog {
        PlanCatalog::from_price_ids(&crate::client::PriceIds {
            plus_monthly: Some("price_A".to_string()),
            ..Default::default()
        })
    }

    fn active_record() -> CustomerRecord {
        CustomerRecord {
            id: Uuid::new_v4(),
            billing_customer_id: Some("cus_1".to_string()),
            email: "a@x.com".to_string(),
            plan_id: Some("price_A".to_string()),
            has_access: true,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn event(payload: serde_json::Value) -> BillingEvent {
        decode_event(&payload).unwrap()
    }

    fn paused_event() -> BillingEvent {
        event(json!({
            "id": "evt_p", "type": "customer.subscription.paused",
            "data": {"object": {"id": "sub_1", "customer": "cus_1"}}
        }))
    }

    fn resumed_event() -> BillingEvent {
        event(json!({
            "id": "evt_r", "type": "customer.subscription.resumed",
            "data": {"object": {"id": "sub_1", "customer": "cus_1"}}
        }))
    }

    fn deleted_event() -> BillingEvent {
        event(json!({
            "id": "evt_d", "type": "customer.subscription.deleted",
            "data": {"object": {"id": "sub_1", "customer": "cus_1"}}
        }))
    }

    fn checkout() -> BillingEvent {
        event(json!({
            "id": "evt_c", "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_1", "customer": "cus_1", "customer_email": "a@x.com",
                "line_items": {"data": [{"price": {"id": "price_A"}}]}
            }}
        }))
    }

    #[test]
    fn state_projection() {
        assert_eq!(EntitlementState::of(None), EntitlementState::Unprovisioned);

        let mut record = active_record();
        assert_eq!(EntitlementState::of(Some(&record)), EntitlementState::Active);

        record.has_access = false;
        assert_eq!(EntitlementState::of(Some(&record)), EntitlementState::Paused);

        record.plan_id = None;
        assert_eq!(EntitlementState::of(Some(&record)), EntitlementState::Revoked);
    }

    #[test]
    fn bootstrap_checkout_grants_access_and_schedules_welcome() {
        let seed = CustomerRecord {
            plan_id: None,
            has_access: false,
            ..active_record()
        };

        let outcome = apply(&seed, true, &checkout(), &catalog());
        assert!(outcome.changed);
        assert!(outcome.record.has_access);
        assert_eq!(outcome.record.plan_id.as_deref(), Some("price_A"));
        assert_eq!(
            outcome.effects,
            vec![SideEffect::WelcomeEmail {
                email: "a@x.com".to_string(),
                plan_name: "Kanjipress Plus (monthly)".to_string(),
            }]
        );
    }

    #[test]
    fn existing_customer_checkout_has_no_welcome_email() {
        let record = active_record();
        let outcome = apply(&record, false, &checkout(), &catalog());
        assert!(outcome.record.has_access);
        assert!(outcome.effects.is_empty());
    }

    #[test]
    fn pause_then_resume_and_resume_then_pause() {
        let record = active_record();
        let catalog = catalog();

        // paused then resumed → Active
        let paused = apply(&record, false, &paused_event(), &catalog);
        assert!(!paused.record.has_access);
        let resumed = apply(&paused.record, false, &resumed_event(), &catalog);
        assert!(resumed.record.has_access);

        // resumed (no-op while Active) then paused → Paused: last event wins
        let noop = apply(&record, false, &resumed_event(), &catalog);
        assert!(!noop.changed);
        let paused_again = apply(&noop.record, false, &paused_event(), &catalog);
        assert!(!paused_again.record.has_access);
        assert_eq!(paused_again.record.plan_id.as_deref(), Some("price_A"));
    }

    #[test]
    fn transitions_are_idempotent_under_replay() {
        let record = active_record();
        let catalog = catalog();

        for ev in [paused_event(), resumed_event(), deleted_event(), checkout()] {
            let once = apply(&record, false, &ev, &catalog);
            let twice = apply(&once.record, false, &ev, &catalog);
            assert_eq!(once.record, twice.record, "replaying {} diverged", ev.event_type);
            // The second application from the settled state does nothing.
            assert!(!twice.changed);
        }
    }

    #[test]
    fn deletion_revokes_from_any_state() {
        let catalog = catalog();
        let active = active_record();
        let mut paused = active_record();
        paused.has_access = false;

        for record in [active, paused] {
            let outcome = apply(&record, false, &deleted_event(), &catalog);
            assert!(outcome.changed);
            assert!(!outcome.record.has_access);
            assert!(outcome.record.plan_id.is_none());
        }
    }

    #[test]
    fn revoked_is_terminal_except_for_checkout() {
        let catalog = catalog();
        let mut revoked = active_record();
        revoked.has_access = false;
        revoked.plan_id = None;

        for ev in [resumed_event(), paused_event()] {
            let outcome = apply(&revoked, false, &ev, &catalog);
            assert!(!outcome.changed, "{} revived a revoked record", ev.event_type);
        }

        let matching_invoice = event(json!({
            "id": "evt_i", "type": "invoice.paid",
            "data": {"object": {"id": "in_1", "customer": "cus_1", "amount_paid": 900,
                "lines": {"data": [{"price": {"id": "price_A"}}]}}}
        }));
        let outcome = apply(&revoked, false, &matching_invoice, &catalog);
        assert!(!outcome.changed);
        assert!(!outcome.record.has_access);

        let revived = apply(&revoked, false, &checkout(), &catalog);
        assert!(revived.record.has_access);
        assert!(revived.effects.is_empty(), "re-checkout is not a bootstrap");
    }

    #[test]
    fn mismatched_invoice_price_never_changes_access() {
        let record = active_record();
        let mismatched = event(json!({
            "id": "evt_i2", "type": "invoice.paid",
            "data": {"object": {"id": "in_2", "customer": "cus_1", "amount_paid": 900,
                "lines": {"data": [{"price": {"id": "price_B"}}]}}}
        }));

        let outcome = apply(&record, false, &mismatched, &catalog());
        assert!(!outcome.changed);
        assert_eq!(outcome.record, record);
    }

    #[test]
    fn payment_failure_alone_changes_nothing() {
        let record = active_record();
        let failed = event(json!({
            "id": "evt_f", "type": "invoice.payment_failed",
            "data": {"object": {"id": "in_3", "customer": "cus_1", "amount_due": 900,
                "attempt_count": 2}}
        }));

        let outcome = apply(&record, false, &failed, &catalog());
        assert!(!outcome.changed);
        assert!(outcome.effects.is_empty());
    }

    #[test]
    fn updated_with_pause_marker_behaves_like_pause_events() {
        let catalog = catalog();
        let record = active_record();

        let pausing = event(json!({
            "id": "evt_u1", "type": "customer.subscription.updated",
            "data": {"object": {"id": "sub_1", "customer": "cus_1",
                "pause_collection": {"behavior": "void"}}}
        }));
        let paused = apply(&record, false, &pausing, &catalog);
        assert!(!paused.record.has_access);

        let unpausing = event(json!({
            "id": "evt_u2", "type": "customer.subscription.updated",
            "data": {"object": {"id": "sub_1", "customer": "cus_1",
                "pause_collection": null}}
        }));
        let resumed = apply(&paused.record, false, &unpausing, &catalog);
        assert!(resumed.record.has_access);
    }

    #[test]
    fn updated_with_new_price_repoints_plan() {
        let record = active_record();
        let plan_change = event(json!({
            "id": "evt_u3", "type": "customer.subscription.updated",
            "data": {"object": {"id": "sub_1", "customer": "cus_1",
                "items": {"data": [{"price": {"id": "price_B"}}]}}}
        }));

        let outcome = apply(&record, false, &plan_change, &catalog());
        assert!(outcome.changed);
        assert_eq!(outcome.record.plan_id.as_deref(), Some("price_B"));
        assert!(outcome.record.has_access, "plan change does not touch access");
    }

    #[test]
    fn trial_ending_schedules_notice_without_state_change() {
        let record = active_record();
        let trial = event(json!({
            "id": "evt_t", "type": "customer.subscription.trial_will_end",
            "created": 1_700_000_000,
            "data": {"object": {"id": "sub_1", "customer": "cus_1",
                "trial_end": 1_700_000_000 + 3 * 86_400}}
        }));

        let outcome = apply(&record, false, &trial, &catalog());
        assert!(!outcome.changed);
        assert_eq!(
            outcome.effects,
            vec![SideEffect::TrialEndingNotice {
                email: "a@x.com".to_string(),
                plan_name: "Kanjipress Plus (monthly)".to_string(),
                days_remaining: 3,
            }]
        );
    }
}
