//! Wires `cmd.billing.initiate` to the saga and publishes its outcome on
//! `event.billing.completed` / `event.billing.failed`.

use incident_broker::{publish_json, Channel, HandlerOutcome};
use incident_proto::{InitiateBilling, RoutingKey};
use tracing::warn;

use crate::ports::{InsurancePort, PaymentGatewayPort};
use crate::saga::run_saga;
use crate::store::BillingStore;

pub const QUEUE_NAME: &str = "billing-saga.q.initiate";

pub async fn handle_delivery(
    body: Vec<u8>,
    store: &dyn BillingStore,
    insurance: &dyn InsurancePort,
    payment: &dyn PaymentGatewayPort,
    publish_channel: &Channel,
    exchange_name: &str,
    app_id: &str,
) -> HandlerOutcome {
    let request: InitiateBilling = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "dropping malformed billing.initiate message");
            return HandlerOutcome::Drop;
        }
    };

    // A row-creation failure has no external effect to compensate — spec
    // §4.5 "Create row" step: "ack the message and return". Requeueing here
    // would just spin the saga, which is not idempotent across retries.
    let outcome = match run_saga(&request, store, insurance, payment).await {
        Some(outcome) => outcome,
        None => {
            warn!(incident_id = %request.incident_id, "billing row creation failed, acking (nothing to compensate)");
            return HandlerOutcome::Ack;
        }
    };

    let routing_key = outcome.routing_key();
    let type_name = match routing_key {
        RoutingKey::EventBillingCompleted => "BillingCompleted",
        _ => "BillingFailed",
    };

    // The saga has already made its only move — charged or compensated,
    // row already PAID or CANCELLED. Requeueing now would re-run a
    // non-idempotent saga (re-verify insurance, re-charge the gateway), so
    // this always acks; a publish failure here is logged, matching spec
    // §4.5's "the consumed message is always acked after compensation
    // completes" for the cancelled path, generalized to the completed path
    // for the same reason.
    if let Err(e) = publish_json(publish_channel, exchange_name, routing_key, &outcome, outcome.incident_id, type_name, app_id).await {
        warn!(error = %e, incident_id = %outcome.incident_id, billing_id = %outcome.billing_id, "billing outcome publish failed, not retrying (saga already ran)");
    }
    HandlerOutcome::Ack
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_is_stable() {
        assert_eq!(QUEUE_NAME, "billing-saga.q.initiate");
    }
}
