//! Entitlement persistence gateway
//!
//! All durable state goes through [`EntitlementStore`]: customer records
//! with version-guarded writes, the processed-event ledger backing the
//! idempotency guard, and the audit trail. The Postgres implementation is
//! the production path; the in-memory implementation exists for tests.
//!
//! The ledger lives in the shared database, never in process memory: a
//! single instance's memory cannot arbitrate duplicates once more than one
//! instance receives webhooks.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::customer::CustomerRecord;
use crate::error::{BillingError, BillingResult};

/// A record paired with the version its read observed.
pub type VersionedRecord = (CustomerRecord, i64);

/// How long a `processing` claim may sit before another worker may steal it.
/// Covers workers that died mid-event without finishing their ledger row.
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Outcome of a version-guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { new_version: i64 },
    /// The version moved underneath us; re-read and re-compute.
    Conflict,
}

/// Stored ledger row for one webhook delivery.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn find_by_billing_customer_id(&self, id: &str) -> BillingResult<Option<VersionedRecord>>;
    async fn find_by_local_id(&self, id: Uuid) -> BillingResult<Option<VersionedRecord>>;
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<VersionedRecord>>;

    /// Insert a new record at version 1. A unique-index collision (same
    /// billing customer id or local id) returns `Conflict`.
    async fn insert(&self, record: &CustomerRecord) -> BillingResult<i64>;

    /// Write `record` only if the stored version still equals
    /// `expected_version`.
    async fn compare_and_swap(
        &self,
        record: &CustomerRecord,
        expected_version: i64,
    ) -> BillingResult<CasOutcome>;

    /// Atomically claim exclusive processing rights for an event id.
    ///
    /// Returns true when this caller won the claim; false when the event was
    /// already claimed or completed. Failed events are claimable again (a
    /// provider redelivery after a 500 must get another attempt), as are
    /// claims stuck in `processing` longer than
    /// [`PROCESSING_TIMEOUT_MINUTES`].
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Current `(processing_result, error_message)` for an event id.
    async fn event_status(&self, event_id: &str) -> BillingResult<Option<(String, Option<String>)>>;

    /// Record the final disposition of a claimed event.
    async fn finish_event(
        &self,
        event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn list_events(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Reset a stuck or failed event so it can be replayed.
    async fn reclaim_for_replay(&self, event_id: &str) -> BillingResult<()>;

    /// Best-effort audit append; callers log and continue on failure.
    async fn append_audit(&self, entry: &AuditEntry) -> BillingResult<()>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: Uuid,
    billing_customer_id: Option<String>,
    email: String,
    plan_id: Option<String>,
    has_access: bool,
    version: i64,
    updated_at: OffsetDateTime,
}

impl From<CustomerRow> for VersionedRecord {
    fn from(row: CustomerRow) -> Self {
        (
            CustomerRecord {
                id: row.id,
                billing_customer_id: row.billing_customer_id,
                email: row.email,
                plan_id: row.plan_id,
                has_access: row.has_access,
                updated_at: row.updated_at,
            },
            row.version,
        )
    }
}

const CUSTOMER_COLUMNS: &str =
    "id, billing_customer_id, email, plan_id, has_access, version, updated_at";

/// Postgres-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementStore for PgStore {
    async fn find_by_billing_customer_id(&self, id: &str) -> BillingResult<Option<VersionedRecord>> {
        let row: Option<CustomerRow> = sqlx::query_as(&format!(
            "SELECT {} FROM customers WHERE billing_customer_id = $1",
            CUSTOMER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn find_by_local_id(&self, id: Uuid) -> BillingResult<Option<VersionedRecord>> {
        let row: Option<CustomerRow> = sqlx::query_as(&format!(
            "SELECT {} FROM customers WHERE id = $1",
            CUSTOMER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<VersionedRecord>> {
        // Oldest record wins if an email somehow appears twice.
        let row: Option<CustomerRow> = sqlx::query_as(&format!(
            "SELECT {} FROM customers WHERE email = $1 ORDER BY created_at ASC LIMIT 1",
            CUSTOMER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn insert(&self, record: &CustomerRecord) -> BillingResult<i64> {
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO customers (id, billing_customer_id, email, plan_id, has_access, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, 1, NOW())
            ON CONFLICT DO NOTHING
            RETURNING version
            "#,
        )
        .bind(record.id)
        .bind(record.billing_customer_id.as_deref())
        .bind(&record.email)
        .bind(record.plan_id.as_deref())
        .bind(record.has_access)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some((version,)) => Ok(version),
            None => Err(BillingError::Conflict(format!(
                "customer insert collided for {}",
                record.email
            ))),
        }
    }

    async fn compare_and_swap(
        &self,
        record: &CustomerRecord,
        expected_version: i64,
    ) -> BillingResult<CasOutcome> {
        let updated: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE customers
            SET billing_customer_id = $2,
                email = $3,
                plan_id = $4,
                has_access = $5,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $6
            RETURNING version
            "#,
        )
        .bind(record.id)
        .bind(record.billing_customer_id.as_deref())
        .bind(&record.email)
        .bind(record.plan_id.as_deref())
        .bind(record.has_access)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match updated {
            Some((new_version,)) => CasOutcome::Applied { new_version },
            None => CasOutcome::Conflict,
        })
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        // INSERT..ON CONFLICT..RETURNING atomically claims exclusive
        // processing rights: exactly one concurrent caller gets a row back.
        // The ON CONFLICT arm re-claims failed or reset events, and events
        // stuck in 'processing' past the timeout (a worker died without
        // finishing its ledger row).
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_webhook_events
                (provider_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Re-claimed at ', NOW()::TEXT,
                                       '; previous: ', billing_webhook_events.processing_result)
            WHERE billing_webhook_events.processing_result IN ('error', 'pending_replay')
               OR (billing_webhook_events.processing_result = 'processing'
                   AND billing_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn event_status(&self, event_id: &str) -> BillingResult<Option<(String, Option<String>)>> {
        let row: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT processing_result, error_message FROM billing_webhook_events WHERE provider_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE provider_event_id = $3
            "#,
        )
        .bind(result)
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_events(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records: Vec<WebhookEventRecord> = match status_filter {
            Some(status) => {
                sqlx::query_as(
                    r#"
                    SELECT id, provider_event_id, event_type, event_timestamp,
                           processing_result, processing_started_at, error_message, created_at
                    FROM billing_webhook_events
                    WHERE processing_result = $1
                    ORDER BY created_at DESC
                    LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, provider_event_id, event_type, event_timestamp,
                           processing_result, processing_started_at, error_message, created_at
                    FROM billing_webhook_events
                    ORDER BY created_at DESC
                    LIMIT $1 OFFSET $2
                    "#,
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(records)
    }

    async fn reclaim_for_replay(&self, event_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET processing_result = 'pending_replay',
                error_message = CONCAT('Reset for replay at ', NOW()::TEXT)
            WHERE provider_event_id = $1
              AND processing_result IN ('processing', 'error')
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "event {} not found or not in a resettable state",
                event_id
            )));
        }

        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (customer_id, event_type, provider_event_id, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.customer_id)
        .bind(&entry.event_type)
        .bind(entry.provider_event_id.as_deref())
        .bind(&entry.data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MemEvent {
    record: WebhookEventRecord,
}

#[derive(Default)]
struct MemoryInner {
    customers: HashMap<Uuid, (CustomerRecord, i64)>,
    events: HashMap<String, MemEvent>,
    audit: Vec<AuditEntry>,
}

/// Mutex-guarded in-memory store with the same claim and CAS semantics as
/// the Postgres implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit entries recorded so far (test inspection).
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.audit.clone()
    }

    /// Number of customer records (test inspection).
    pub async fn customer_count(&self) -> usize {
        self.inner.lock().await.customers.len()
    }
}

#[async_trait]
impl EntitlementStore for MemoryStore {
    async fn find_by_billing_customer_id(&self, id: &str) -> BillingResult<Option<VersionedRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .customers
            .values()
            .find(|(r, _)| r.billing_customer_id.as_deref() == Some(id))
            .cloned())
    }

    async fn find_by_local_id(&self, id: Uuid) -> BillingResult<Option<VersionedRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.customers.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<VersionedRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .customers
            .values()
            .find(|(r, _)| r.email == email)
            .cloned())
    }

    async fn insert(&self, record: &CustomerRecord) -> BillingResult<i64> {
        let mut inner = self.inner.lock().await;

        let collides = inner.customers.contains_key(&record.id)
            || (record.billing_customer_id.is_some()
                && inner.customers.values().any(|(r, _)| {
                    r.billing_customer_id == record.billing_customer_id
                }));
        if collides {
            return Err(BillingError::Conflict(format!(
                "customer insert collided for {}",
                record.email
            )));
        }

        inner.customers.insert(record.id, (record.clone(), 1));
        Ok(1)
    }

    async fn compare_and_swap(
        &self,
        record: &CustomerRecord,
        expected_version: i64,
    ) -> BillingResult<CasOutcome> {
        let mut inner = self.inner.lock().await;

        match inner.customers.get_mut(&record.id) {
            Some((stored, version)) if *version == expected_version => {
                *stored = record.clone();
                *version += 1;
                Ok(CasOutcome::Applied { new_version: *version })
            }
            Some(_) => Ok(CasOutcome::Conflict),
            None => Ok(CasOutcome::Conflict),
        }
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = inner.events.get_mut(event_id) {
            let stuck = existing.record.processing_result == "processing"
                && existing
                    .record
                    .processing_started_at
                    .map(|t| now - t > time::Duration::minutes(PROCESSING_TIMEOUT_MINUTES))
                    .unwrap_or(true);
            let reclaimable = matches!(
                existing.record.processing_result.as_str(),
                "error" | "pending_replay"
            );

            if stuck || reclaimable {
                existing.record.processing_result = "processing".to_string();
                existing.record.processing_started_at = Some(now);
                return Ok(true);
            }
            return Ok(false);
        }

        inner.events.insert(
            event_id.to_string(),
            MemEvent {
                record: WebhookEventRecord {
                    id: Uuid::new_v4(),
                    provider_event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    event_timestamp,
                    processing_result: "processing".to_string(),
                    processing_started_at: Some(now),
                    error_message: None,
                    created_at: now,
                },
            },
        );
        Ok(true)
    }

    async fn event_status(&self, event_id: &str) -> BillingResult<Option<(String, Option<String>)>> {
        let inner = self.inner.lock().await;
        Ok(inner.events.get(event_id).map(|e| {
            (
                e.record.processing_result.clone(),
                e.record.error_message.clone(),
            )
        }))
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.events.get_mut(event_id) {
            event.record.processing_result = result.to_string();
            event.record.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn list_events(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let inner = self.inner.lock().await;
        let mut records: Vec<WebhookEventRecord> = inner
            .events
            .values()
            .map(|e| e.record.clone())
            .filter(|r| status_filter.map(|s| r.processing_result == s).unwrap_or(true))
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(records
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn reclaim_for_replay(&self, event_id: &str) -> BillingResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.events.get_mut(event_id) {
            Some(event)
                if matches!(event.record.processing_result.as_str(), "processing" | "error") =>
            {
                event.record.processing_result = "pending_replay".to_string();
                Ok(())
            }
            _ => Err(BillingError::NotFound(format!(
                "event {} not found or not in a resettable state",
                event_id
            ))),
        }
    }

    async fn append_audit(&self, entry: &AuditEntry) -> BillingResult<()> {
        self.inner.lock().await.audit.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(email: &str) -> CustomerRecord {
        CustomerRecord {
            id: Uuid::new_v4(),
            billing_customer_id: Some(format!("cus_{}", email)),
            email: email.to_string(),
            plan_id: None,
            has_access: false,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn cas_applies_only_at_expected_version() {
        let store = MemoryStore::new();
        let mut rec = record("a@x.com");
        let v1 = store.insert(&rec).await.unwrap();

        rec.has_access = true;
        let outcome = store.compare_and_swap(&rec, v1).await.unwrap();
        assert!(matches!(outcome, CasOutcome::Applied { new_version: 2 }));

        // A write against the stale version must conflict.
        rec.has_access = false;
        let stale = store.compare_and_swap(&rec, v1).await.unwrap();
        assert_eq!(stale, CasOutcome::Conflict);

        let (stored, version) = store.find_by_local_id(rec.id).await.unwrap().unwrap();
        assert!(stored.has_access, "stale write must not land");
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = MemoryStore::new();
        let rec = record("a@x.com");
        store.insert(&rec).await.unwrap();

        let dup = CustomerRecord {
            id: Uuid::new_v4(),
            ..rec.clone()
        };
        assert!(matches!(
            store.insert(&dup).await,
            Err(BillingError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_finished() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();

        assert!(store.claim_event("evt_1", "invoice.paid", now).await.unwrap());
        assert!(!store.claim_event("evt_1", "invoice.paid", now).await.unwrap());

        store.finish_event("evt_1", "success", None).await.unwrap();
        assert!(!store.claim_event("evt_1", "invoice.paid", now).await.unwrap());
        assert_eq!(
            store.event_status("evt_1").await.unwrap(),
            Some(("success".to_string(), None))
        );
    }

    #[tokio::test]
    async fn failed_event_is_claimable_again_on_redelivery() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();

        assert!(store.claim_event("evt_1", "invoice.paid", now).await.unwrap());
        store
            .finish_event("evt_1", "error", Some("boom"))
            .await
            .unwrap();

        // A 500 response asks the provider to redeliver; the redelivery
        // must win the claim and get another attempt.
        assert!(store.claim_event("evt_1", "invoice.paid", now).await.unwrap());
        assert!(!store.claim_event("evt_1", "invoice.paid", now).await.unwrap());
    }

    #[tokio::test]
    async fn reclaim_rejects_successful_events() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();

        store.claim_event("evt_1", "invoice.paid", now).await.unwrap();
        store.finish_event("evt_1", "success", None).await.unwrap();

        assert!(matches!(
            store.reclaim_for_replay("evt_1").await,
            Err(BillingError::NotFound(_))
        ));
    }
}
