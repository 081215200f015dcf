//! Customer records and event-to-customer resolution
//!
//! Every event must map to exactly one local record before the state machine
//! runs. The original handler grew ad hoc "try customer id, then try email"
//! lookups in several places; here the fallback chain exists once, in order,
//! and each branch is tested independently.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::store::EntitlementStore;

/// The durable entitlement record.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerRecord {
    /// Local identity, immutable.
    pub id: Uuid,
    /// Provider customer id once known. Seeded with the email as a
    /// placeholder when a checkout completes before the provider assigns one.
    pub billing_customer_id: Option<String>,
    pub email: String,
    /// Price id of the current plan; None means no subscription on file.
    pub plan_id: Option<String>,
    pub has_access: bool,
    pub updated_at: OffsetDateTime,
}

/// A record together with its optimistic-concurrency version.
#[derive(Debug, Clone)]
pub struct ResolvedCustomer {
    pub record: CustomerRecord,
    pub version: i64,
    /// True when this resolution created the record (checkout bootstrap).
    pub newly_created: bool,
}

/// Maps a billing event to exactly one customer record.
///
/// Resolution order, first match wins:
/// 1. exact `billing_customer_id` match;
/// 2. `client_reference_id` (checkout events only) looked up as a local id;
/// 3. match on email (covers records seeded before the provider id was
///    captured, and customers deleted upstream);
/// 4. checkout events only: create a new record;
/// 5. otherwise there is nothing to update.
#[derive(Clone)]
pub struct CustomerResolver {
    store: Arc<dyn EntitlementStore>,
}

impl CustomerResolver {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, event: &BillingEvent) -> BillingResult<ResolvedCustomer> {
        if let Some(customer_id) = event.customer_id() {
            if let Some((record, version)) =
                self.store.find_by_billing_customer_id(customer_id).await?
            {
                return Ok(ResolvedCustomer {
                    record,
                    version,
                    newly_created: false,
                });
            }
        }

        if let Some(reference) = event.client_reference_id() {
            match Uuid::parse_str(reference) {
                Ok(local_id) => {
                    if let Some((record, version)) = self.store.find_by_local_id(local_id).await? {
                        return Ok(ResolvedCustomer {
                            record,
                            version,
                            newly_created: false,
                        });
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        client_reference_id = %reference,
                        "Checkout carried a malformed client reference id"
                    );
                }
            }
        }

        if let Some(email) = event.customer_email() {
            if let Some((record, version)) = self.store.find_by_email(email).await? {
                return Ok(ResolvedCustomer {
                    record,
                    version,
                    newly_created: false,
                });
            }
        }

        if event.is_checkout_completed() {
            return self.create_from_checkout(event).await;
        }

        Err(BillingError::Resolution(format!(
            "no customer record for event {} ({})",
            event.id, event.event_type
        )))
    }

    /// Create the seed record for a first-time checkout. The state machine
    /// grants access; this only establishes identity. The provider customer
    /// id falls back to the email when the provider has not assigned one yet.
    async fn create_from_checkout(&self, event: &BillingEvent) -> BillingResult<ResolvedCustomer> {
        let email = event
            .customer_email()
            .ok_or_else(|| {
                BillingError::Resolution(format!(
                    "checkout event {} has no email to seed a record from",
                    event.id
                ))
            })?
            .to_string();

        let billing_customer_id = event
            .customer_id()
            .map(str::to_string)
            .unwrap_or_else(|| email.clone());

        let record = CustomerRecord {
            id: Uuid::new_v4(),
            billing_customer_id: Some(billing_customer_id),
            email,
            plan_id: None,
            has_access: false,
            updated_at: OffsetDateTime::now_utc(),
        };

        match self.store.insert(&record).await {
            Ok(version) => Ok(ResolvedCustomer {
                record,
                version,
                newly_created: true,
            }),
            // Unique-index collision: a concurrent delivery created the
            // record between our lookup and insert. Resolve to theirs.
            Err(BillingError::Conflict(_)) => {
                if let Some(key) = record.billing_customer_id.as_deref() {
                    if let Some((existing, version)) =
                        self.store.find_by_billing_customer_id(key).await?
                    {
                        return Ok(ResolvedCustomer {
                            record: existing,
                            version,
                            newly_created: false,
                        });
                    }
                }
                if let Some((existing, version)) = self.store.find_by_email(&record.email).await? {
                    return Ok(ResolvedCustomer {
                        record: existing,
                        version,
                        newly_created: false,
                    });
                }
                Err(BillingError::Resolution(format!(
                    "insert collided for event {} but no record was found on re-lookup",
                    event.id
                )))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::decode_event;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn resolver(store: &Arc<MemoryStore>) -> CustomerResolver {
        CustomerResolver::new(store.clone() as Arc<dyn EntitlementStore>)
    }

    fn record(billing_customer_id: Option<&str>, email: &str) -> CustomerRecord {
        CustomerRecord {
            id: Uuid::new_v4(),
            billing_customer_id: billing_customer_id.map(str::to_string),
            email: email.to_string(),
            plan_id: Some("price_A".to_string()),
            has_access: true,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn paused_event(customer_id: &str) -> BillingEvent {
        decode_event(&json!({
            "id": "evt_p1",
            "type": "customer.subscription.paused",
            "data": {"object": {"id": "sub_1", "customer": customer_id}}
        }))
        .unwrap()
    }

    fn checkout_event(reference: Option<&str>, customer: Option<&str>, email: &str) -> BillingEvent {
        decode_event(&json!({
            "id": "evt_c1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_1",
                "client_reference_id": reference,
                "customer": customer,
                "customer_email": email,
                "line_items": {"data": [{"price": {"id": "price_A"}}]}
            }}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn resolves_by_billing_customer_id_first() {
        let store = Arc::new(MemoryStore::new());
        let by_id = record(Some("cus_1"), "id@x.com");
        let by_email = record(None, "shared@x.com");
        store.insert(&by_id).await.unwrap();
        store.insert(&by_email).await.unwrap();

        let resolved = resolver(&store).resolve(&paused_event("cus_1")).await.unwrap();
        assert_eq!(resolved.record.id, by_id.id);
        assert!(!resolved.newly_created);
    }

    #[tokio::test]
    async fn falls_back_to_client_reference_id() {
        let store = Arc::new(MemoryStore::new());
        let existing = record(None, "ref@x.com");
        store.insert(&existing).await.unwrap();

        let event = checkout_event(Some(&existing.id.to_string()), Some("cus_new"), "other@x.com");
        let resolved = resolver(&store).resolve(&event).await.unwrap();
        assert_eq!(resolved.record.id, existing.id);
    }

    #[tokio::test]
    async fn falls_back_to_email() {
        let store = Arc::new(MemoryStore::new());
        // Seeded before the provider id was captured: placeholder identity.
        let existing = CustomerRecord {
            billing_customer_id: Some("legacy@x.com".to_string()),
            ..record(None, "legacy@x.com")
        };
        store.insert(&existing).await.unwrap();

        let event = decode_event(&json!({
            "id": "evt_i1",
            "type": "invoice.paid",
            "data": {"object": {
                "id": "in_1",
                "customer": "cus_unseen",
                "customer_email": "legacy@x.com",
                "amount_paid": 900
            }}
        }))
        .unwrap();

        let resolved = resolver(&store).resolve(&event).await.unwrap();
        assert_eq!(resolved.record.id, existing.id);
    }

    #[tokio::test]
    async fn checkout_creates_when_nothing_matches() {
        let store = Arc::new(MemoryStore::new());
        let event = checkout_event(None, None, "new@x.com");

        let resolved = resolver(&store).resolve(&event).await.unwrap();
        assert!(resolved.newly_created);
        // No provider id on the event: the email is the placeholder identity.
        assert_eq!(resolved.record.billing_customer_id.as_deref(), Some("new@x.com"));
        assert!(!resolved.record.has_access, "access is granted by the state machine, not the resolver");

        let (found, _) = store.find_by_email("new@x.com").await.unwrap().unwrap();
        assert_eq!(found.id, resolved.record.id);
    }

    #[tokio::test]
    async fn non_checkout_event_with_no_match_is_a_resolution_error() {
        let store = Arc::new(MemoryStore::new());
        let result = resolver(&store).resolve(&paused_event("cus_missing")).await;
        assert!(matches!(result, Err(BillingError::Resolution(_))));
    }
}
