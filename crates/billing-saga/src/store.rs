//! Persistence for billing rows. Mirrors `PostgresHospitalDirectory`'s split
//! between a `sqlx`-backed implementation and an in-memory test double, using
//! the runtime-checked `sqlx::query`/`query_as` builders rather than the
//! compile-time `query!` macros (those need a live database reachable at
//! build time).

use async_trait::async_trait;
use incident_proto::Cents;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingRowStatus {
    Pending,
    Paid,
    Cancelled,
}

impl BillingRowStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Cancelled => "CANCELLED",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "PAID" => Self::Paid,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingRow {
    pub billing_id: String,
    pub incident_id: Uuid,
    pub patient_id: String,
    pub amount: Cents,
    pub status: BillingRowStatus,
    pub payment_reference: Option<String>,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn create_pending(&self, incident_id: Uuid, patient_id: &str, amount: Cents) -> anyhow::Result<BillingRow>;
    async fn mark_paid(&self, billing_id: &str, payment_reference: &str) -> anyhow::Result<()>;
    async fn mark_cancelled(&self, billing_id: &str) -> anyhow::Result<()>;
}

pub struct PostgresBillingStore {
    pool: sqlx::PgPool,
}

impl PostgresBillingStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BillingRowRecord {
    billing_id: String,
    incident_id: Uuid,
    patient_id: String,
    amount_cents: i64,
    status: String,
}

impl From<BillingRowRecord> for BillingRow {
    fn from(r: BillingRowRecord) -> Self {
        BillingRow {
            billing_id: r.billing_id,
            incident_id: r.incident_id,
            patient_id: r.patient_id,
            amount: Cents(r.amount_cents),
            status: BillingRowStatus::from_str(&r.status),
            payment_reference: None,
        }
    }
}

#[async_trait]
impl BillingStore for PostgresBillingStore {
    async fn create_pending(&self, incident_id: Uuid, patient_id: &str, amount: Cents) -> anyhow::Result<BillingRow> {
        let billing_id = Uuid::new_v4().to_string();
        let row: BillingRowRecord = sqlx::query_as(
            "INSERT INTO billing_rows (billing_id, incident_id, patient_id, amount_cents, status) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING billing_id, incident_id, patient_id, amount_cents, status",
        )
        .bind(&billing_id)
        .bind(incident_id)
        .bind(patient_id)
        .bind(amount.0)
        .bind(BillingRowStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn mark_paid(&self, billing_id: &str, payment_reference: &str) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE billing_rows SET status = $1, payment_reference = $2 WHERE billing_id = $3")
            .bind(BillingRowStatus::Paid.as_str())
            .bind(payment_reference)
            .bind(billing_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("billing row {billing_id} not found")
        }
        Ok(())
    }

    async fn mark_cancelled(&self, billing_id: &str) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE billing_rows SET status = $1 WHERE billing_id = $2")
            .bind(BillingRowStatus::Cancelled.as_str())
            .bind(billing_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("billing row {billing_id} not found")
        }
        Ok(())
    }
}

pub struct InMemoryBillingStore {
    rows: parking_lot::Mutex<std::collections::HashMap<String, BillingRow>>,
    fail_create: bool,
    fail_mark_paid: bool,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self { rows: parking_lot::Mutex::new(std::collections::HashMap::new()), fail_create: false, fail_mark_paid: false }
    }

    pub fn failing_create() -> Self {
        Self { rows: parking_lot::Mutex::new(std::collections::HashMap::new()), fail_create: true, fail_mark_paid: false }
    }

    pub fn failing_mark_paid() -> Self {
        Self { rows: parking_lot::Mutex::new(std::collections::HashMap::new()), fail_create: false, fail_mark_paid: true }
    }

    pub fn snapshot(&self, billing_id: &str) -> Option<BillingRow> {
        self.rows.lock().get(billing_id).cloned()
    }
}

impl Default for InMemoryBillingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn create_pending(&self, incident_id: Uuid, patient_id: &str, amount: Cents) -> anyhow::Result<BillingRow> {
        if self.fail_create {
            anyhow::bail!("database unavailable")
        }
        let row = BillingRow {
            billing_id: Uuid::new_v4().to_string(),
            incident_id,
            patient_id: patient_id.to_string(),
            amount,
            status: BillingRowStatus::Pending,
            payment_reference: None,
        };
        self.rows.lock().insert(row.billing_id.clone(), row.clone());
        Ok(row)
    }

    async fn mark_paid(&self, billing_id: &str, payment_reference: &str) -> anyhow::Result<()> {
        if self.fail_mark_paid {
            anyhow::bail!("database unavailable")
        }
        let mut rows = self.rows.lock();
        let row = rows.get_mut(billing_id).ok_or_else(|| anyhow::anyhow!("billing row {billing_id} not found"))?;
        row.status = BillingRowStatus::Paid;
        row.payment_reference = Some(payment_reference.to_string());
        Ok(())
    }

    async fn mark_cancelled(&self, billing_id: &str) -> anyhow::Result<()> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(billing_id).ok_or_else(|| anyhow::anyhow!("billing row {billing_id} not found"))?;
        row.status = BillingRowStatus::Cancelled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_mark_paid_round_trips() {
        let store = InMemoryBillingStore::new();
        let row = store.create_pending(Uuid::new_v4(), "patient-1", Cents(5000)).await.unwrap();
        assert_eq!(row.status, BillingRowStatus::Pending);

        store.mark_paid(&row.billing_id, "pay_ref_123").await.unwrap();
        let updated = store.snapshot(&row.billing_id).unwrap();
        assert_eq!(updated.status, BillingRowStatus::Paid);
        assert_eq!(updated.payment_reference.as_deref(), Some("pay_ref_123"));
    }

    #[tokio::test]
    async fn mark_cancelled_on_unknown_row_errors() {
        let store = InMemoryBillingStore::new();
        assert!(store.mark_cancelled("missing").await.is_err());
    }
}
