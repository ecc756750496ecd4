//! External collaborators the saga calls out to: insurance verification and
//! the payment gateway. Both are traits so the saga itself never depends on
//! `reqwest` directly — grounded on `claw-provision::Provider`'s shape of
//! one trait per external system, with a real HTTP implementation and a
//! test double behind it.

use std::time::Duration;

use async_trait::async_trait;
use incident_proto::Cents;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Insurance ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsuranceVerification {
    Approved,
    NoPolicy,
    InsufficientCoverage,
    ServiceUnavailable,
    ServiceError,
}

impl InsuranceVerification {
    /// The reason string recorded on `event.billing.failed` when
    /// compensation runs (spec §4.5's named failure branches).
    pub fn reason(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::NoPolicy => "NO_POLICY",
            Self::InsufficientCoverage => "INSUFFICIENT_COVERAGE",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::ServiceError => "SERVICE_ERROR",
        }
    }
}

#[async_trait]
pub trait InsurancePort: Send + Sync {
    async fn verify(&self, patient_id: &str, incident_id: Uuid, amount: Cents) -> InsuranceVerification;
}

#[derive(Debug, Serialize)]
struct VerifyRequest {
    patient_id: String,
    incident_id: Uuid,
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    verified: bool,
}

pub struct HttpInsurancePort {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInsurancePort {
    pub fn new(base_url: String) -> Self {
        Self { client: reqwest::Client::new(), base_url }
    }
}

#[async_trait]
impl InsurancePort for HttpInsurancePort {
    async fn verify(&self, patient_id: &str, incident_id: Uuid, amount: Cents) -> InsuranceVerification {
        let url = format!("{}/insurance/verify", self.base_url);
        let body = VerifyRequest { patient_id: patient_id.to_string(), incident_id, amount: amount.as_dollars() };

        let response = match self.client.post(&url).json(&body).timeout(HTTP_TIMEOUT).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, %incident_id, "insurance verify request failed");
                return InsuranceVerification::ServiceUnavailable;
            }
        };

        match response.status().as_u16() {
            200 => match response.json::<VerifyResponse>().await {
                Ok(v) if v.verified => InsuranceVerification::Approved,
                Ok(_) => InsuranceVerification::InsufficientCoverage,
                Err(e) => {
                    warn!(error = %e, %incident_id, "insurance verify returned unparseable body");
                    InsuranceVerification::ServiceError
                }
            },
            404 => InsuranceVerification::NoPolicy,
            402 => InsuranceVerification::InsufficientCoverage,
            other => {
                warn!(status = other, %incident_id, "insurance verify returned unexpected status");
                InsuranceVerification::ServiceError
            }
        }
    }
}

// ─── Payment gateway ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentResult {
    Approved { reference: String },
    Declined,
    Failed,
}

#[async_trait]
pub trait PaymentGatewayPort: Send + Sync {
    async fn charge(&self, incident_id: Uuid, amount: Cents) -> PaymentResult;
    /// Best-effort; the caller logs failures and moves on regardless.
    async fn refund(&self, payment_reference: &str, amount: Cents) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize)]
struct ChargeRequest {
    amount_cents: i64,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChargeResponse {
    success: bool,
    #[serde(default)]
    payment_intent_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefundRequest {
    payment_intent_id: String,
    amount_cents: i64,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpPaymentGatewayPort {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentGatewayPort {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self { client: reqwest::Client::new(), base_url, api_key }
    }
}

#[async_trait]
impl PaymentGatewayPort for HttpPaymentGatewayPort {
    async fn charge(&self, incident_id: Uuid, amount: Cents) -> PaymentResult {
        let url = format!("{}/charges", self.base_url);
        let body = ChargeRequest { amount_cents: amount.0, description: format!("incident {incident_id}") };

        let response = match self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, %incident_id, "payment charge request failed");
                return PaymentResult::Failed;
            }
        };

        match response.json::<ChargeResponse>().await {
            Ok(parsed) if parsed.success => match parsed.payment_intent_id {
                Some(reference) => PaymentResult::Approved { reference },
                None => PaymentResult::Failed,
            },
            Ok(parsed) => {
                warn!(error = ?parsed.error, %incident_id, "payment declined");
                PaymentResult::Declined
            }
            Err(e) => {
                warn!(error = %e, %incident_id, "payment charge returned unparseable body");
                PaymentResult::Failed
            }
        }
    }

    async fn refund(&self, payment_reference: &str, amount: Cents) -> anyhow::Result<()> {
        let url = format!("{}/refunds", self.base_url);
        let body = RefundRequest { payment_intent_id: payment_reference.to_string(), amount_cents: amount.0 };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await?;
        let parsed: RefundResponse = response.json().await?;
        if parsed.success {
            Ok(())
        } else {
            anyhow::bail!(parsed.error.unwrap_or_else(|| "refund declined".to_string()))
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    pub struct MockInsurancePort {
        pub response: InsuranceVerification,
    }

    #[async_trait]
    impl InsurancePort for MockInsurancePort {
        async fn verify(&self, _patient_id: &str, _incident_id: Uuid, _amount: Cents) -> InsuranceVerification {
            self.response
        }
    }

    pub struct MockPaymentGatewayPort {
        pub charge_result: PaymentResult,
        pub refund_calls: Mutex<Vec<String>>,
        pub refund_should_fail: bool,
    }

    impl MockPaymentGatewayPort {
        pub fn approving(reference: &str) -> Self {
            Self {
                charge_result: PaymentResult::Approved { reference: reference.to_string() },
                refund_calls: Mutex::new(Vec::new()),
                refund_should_fail: false,
            }
        }

        pub fn declining() -> Self {
            Self { charge_result: PaymentResult::Declined, refund_calls: Mutex::new(Vec::new()), refund_should_fail: false }
        }
    }

    #[async_trait]
    impl PaymentGatewayPort for MockPaymentGatewayPort {
        async fn charge(&self, _incident_id: Uuid, _amount: Cents) -> PaymentResult {
            self.charge_result.clone()
        }

        async fn refund(&self, payment_reference: &str, _amount: Cents) -> anyhow::Result<()> {
            self.refund_calls.lock().push(payment_reference.to_string());
            if self.refund_should_fail {
                anyhow::bail!("refund service unavailable")
            } else {
                Ok(())
            }
        }
    }
}
