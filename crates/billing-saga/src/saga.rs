//! The PENDING → {PAID | CANCELLED} state machine (spec §4.5), with a
//! best-effort compensation procedure grounded on `gf-failover`'s
//! failover-step sequence: every step is tried and logged independently,
//! and a step that fails never aborts the ones after it.

use chrono::Utc;
use incident_proto::{BillingOutcome, BillingOutcomeStatus, InitiateBilling};
use tracing::warn;

use crate::ports::{InsurancePort, PaymentGatewayPort, PaymentResult};
use crate::store::BillingStore;

/// Runs the saga to completion and returns the outcome to publish. Returns
/// `None` only when the pending row itself can't be created — at that
/// point nothing external has happened yet, so there is nothing to
/// compensate and the caller requeues the command instead of acking it.
pub async fn run_saga(
    request: &InitiateBilling,
    store: &dyn BillingStore,
    insurance: &dyn InsurancePort,
    payment: &dyn PaymentGatewayPort,
) -> Option<BillingOutcome> {
    let row = match store.create_pending(request.incident_id, &request.patient_id, request.amount).await {
        Ok(row) => row,
        Err(e) => {
            warn!(error = %e, incident_id = %request.incident_id, "failed to create pending billing row");
            return None;
        }
    };

    let verification = insurance.verify(&request.patient_id, request.incident_id, request.amount).await;
    if !matches!(verification, crate::ports::InsuranceVerification::Approved) {
        return Some(compensate(&row, store, None, verification.reason()).await);
    }

    match payment.charge(request.incident_id, request.amount).await {
        PaymentResult::Approved { reference } => match store.mark_paid(&row.billing_id, &reference).await {
            Ok(()) => Some(BillingOutcome {
                billing_id: row.billing_id,
                incident_id: row.incident_id,
                patient_id: row.patient_id,
                amount: row.amount,
                status: BillingOutcomeStatus::Completed,
                payment_reference: Some(reference),
                error: None,
                timestamp: Utc::now(),
            }),
            Err(e) => {
                warn!(error = %e, billing_id = %row.billing_id, "failed to record payment, compensating");
                Some(compensate(&row, store, Some((payment, reference.as_str())), "DB_UPDATE_FAILED").await)
            }
        },
        PaymentResult::Declined => Some(compensate(&row, store, None, "PAYMENT_DECLINED").await),
        PaymentResult::Failed => Some(compensate(&row, store, None, "PAYMENT_SERVICE_ERROR").await),
    }
}

/// Refunds (if a charge actually went through), marks the row CANCELLED,
/// and builds the failure outcome. Each step is attempted regardless of
/// whether the previous one succeeded (spec §4.5's failure policy).
async fn compensate(
    row: &crate::store::BillingRow,
    store: &dyn BillingStore,
    charged: Option<(&dyn PaymentGatewayPort, &str)>,
    reason: &str,
) -> BillingOutcome {
    if let Some((payment, payment_reference)) = charged {
        if let Err(e) = payment.refund(payment_reference, row.amount).await {
            warn!(error = %e, billing_id = %row.billing_id, "refund failed during compensation");
        }
    }

    if let Err(e) = store.mark_cancelled(&row.billing_id).await {
        warn!(error = %e, billing_id = %row.billing_id, "mark_cancelled failed during compensation");
    }

    BillingOutcome {
        billing_id: row.billing_id.clone(),
        incident_id: row.incident_id,
        patient_id: row.patient_id.clone(),
        amount: row.amount,
        status: BillingOutcomeStatus::Cancelled,
        payment_reference: None,
        error: Some(reason.to_string()),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::mock::{MockInsurancePort, MockPaymentGatewayPort};
    use crate::ports::InsuranceVerification;
    use crate::store::InMemoryBillingStore;
    use incident_proto::Cents;
    use uuid::Uuid;

    fn request() -> InitiateBilling {
        InitiateBilling::new(Uuid::new_v4(), "patient-1".to_string(), Some("hosp-1".to_string()), Cents(5000))
    }

    #[tokio::test]
    async fn happy_path_completes_and_marks_paid() {
        let store = InMemoryBillingStore::new();
        let insurance = MockInsurancePort { response: InsuranceVerification::Approved };
        let payment = MockPaymentGatewayPort::approving("pay_ref_1");

        let req = request();
        let outcome = run_saga(&req, &store, &insurance, &payment).await.unwrap();

        assert_eq!(outcome.status, BillingOutcomeStatus::Completed);
        assert_eq!(outcome.payment_reference.as_deref(), Some("pay_ref_1"));
        let row = store.snapshot(&outcome.billing_id).unwrap();
        assert_eq!(row.status, crate::store::BillingRowStatus::Paid);
    }

    #[tokio::test]
    async fn no_policy_compensates_without_charging() {
        let store = InMemoryBillingStore::new();
        let insurance = MockInsurancePort { response: InsuranceVerification::NoPolicy };
        let payment = MockPaymentGatewayPort::declining();

        let outcome = run_saga(&request(), &store, &insurance, &payment).await.unwrap();

        assert_eq!(outcome.status, BillingOutcomeStatus::Cancelled);
        assert_eq!(outcome.error.as_deref(), Some("NO_POLICY"));
        assert!(payment.refund_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn declined_payment_compensates_without_refund() {
        let store = InMemoryBillingStore::new();
        let insurance = MockInsurancePort { response: InsuranceVerification::Approved };
        let payment = MockPaymentGatewayPort::declining();

        let outcome = run_saga(&request(), &store, &insurance, &payment).await.unwrap();

        assert_eq!(outcome.status, BillingOutcomeStatus::Cancelled);
        assert_eq!(outcome.error.as_deref(), Some("PAYMENT_DECLINED"));
        assert!(payment.refund_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn db_failure_after_payment_triggers_refund() {
        let store = InMemoryBillingStore::failing_mark_paid();
        let insurance = MockInsurancePort { response: InsuranceVerification::Approved };
        let payment = MockPaymentGatewayPort::approving("pay_ref_2");

        let outcome = run_saga(&request(), &store, &insurance, &payment).await.unwrap();

        assert_eq!(outcome.status, BillingOutcomeStatus::Cancelled);
        assert_eq!(outcome.error.as_deref(), Some("DB_UPDATE_FAILED"));
        assert_eq!(payment.refund_calls.lock().as_slice(), ["pay_ref_2"]);
    }

    #[tokio::test]
    async fn create_row_failure_returns_none() {
        let store = InMemoryBillingStore::failing_create();
        let insurance = MockInsurancePort { response: InsuranceVerification::Approved };
        let payment = MockPaymentGatewayPort::approving("pay_ref_3");

        assert!(run_saga(&request(), &store, &insurance, &payment).await.is_none());
    }
}
