//! Wires the three handlers onto their input queues (spec §4.3's
//! single-active-consumer `triage-actionable` / `dispatch-status` /
//! `billing-status`).

use incident_broker::{publish_json, Channel, HandlerOutcome};
use incident_proto::{BillingOutcome, DispatchEvent, RoutingKey, TriageStatus};
use tracing::warn;

use crate::{handle_billing_outcome, handle_dispatch_event, handle_triage_status, IdempotencyLedger};

pub const QUEUE_TRIAGE_ACTIONABLE: &str = "events-manager.q.triage-actionable";
pub const QUEUE_DISPATCH_STATUS: &str = "events-manager.q.dispatch-status";
pub const QUEUE_BILLING_STATUS: &str = "events-manager.q.billing-status";

/// Both publishes must succeed before ack (spec §4.3); either failing
/// requeues the whole message, so a retried emergency may re-alert and
/// re-request an ambulance — the source system accepts this and so do we.
pub async fn handle_triage_delivery(
    body: Vec<u8>,
    publish_channel: &Channel,
    exchange_name: &str,
    app_id: &str,
) -> HandlerOutcome {
    let status: TriageStatus = match serde_json::from_slice(&body) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "dropping malformed triage-actionable message");
            return HandlerOutcome::Drop;
        }
    };

    let outcome = handle_triage_status(&status);

    if let Err(e) = publish_json(
        publish_channel,
        exchange_name,
        RoutingKey::CmdNotificationSendAlert,
        &outcome.alert,
        status.incident_id,
        "SendAlert",
        app_id,
    )
    .await
    {
        warn!(error = %e, incident_id = %status.incident_id, "send_alert publish failed, requeueing");
        return HandlerOutcome::Retry;
    }

    if let Some(request) = outcome.dispatch_request {
        if let Err(e) = publish_json(
            publish_channel,
            exchange_name,
            RoutingKey::CmdDispatchRequestAmbulance,
            &request,
            status.incident_id,
            "RequestAmbulance",
            app_id,
        )
        .await
        {
            warn!(error = %e, incident_id = %status.incident_id, "request_ambulance publish failed, requeueing");
            return HandlerOutcome::Retry;
        }
    }

    HandlerOutcome::Ack
}

/// The idempotency check-then-insert happens before the billing publish is
/// attempted (spec §4.3's literal ordering). A billing-publish failure
/// after a successful insert is logged and acked rather than requeued —
/// the ledger already considers the incident billed, so requeueing would
/// just spin without ever retrying the publish (spec §9 open question).
pub async fn handle_dispatch_delivery(
    body: Vec<u8>,
    ledger: &IdempotencyLedger,
    publish_channel: &Channel,
    exchange_name: &str,
    app_id: &str,
) -> HandlerOutcome {
    let event: DispatchEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "dropping malformed dispatch-status message");
            return HandlerOutcome::Drop;
        }
    };

    let outcome = handle_dispatch_event(&event, ledger);

    if let Err(e) = publish_json(
        publish_channel,
        exchange_name,
        RoutingKey::CmdNotificationSendAlert,
        &outcome.alert,
        event.incident_id,
        "SendAlert",
        app_id,
    )
    .await
    {
        warn!(error = %e, incident_id = %event.incident_id, "send_alert publish failed, requeueing");
        return HandlerOutcome::Retry;
    }

    if let Some(billing) = outcome.billing {
        if let Err(e) = publish_json(
            publish_channel,
            exchange_name,
            RoutingKey::CmdBillingInitiate,
            &billing,
            event.incident_id,
            "InitiateBilling",
            app_id,
        )
        .await
        {
            warn!(error = %e, incident_id = %event.incident_id, "billing.initiate publish failed, not retrying (ledger already marked billed)");
        }
    }

    HandlerOutcome::Ack
}

pub async fn handle_billing_delivery(
    body: Vec<u8>,
    publish_channel: &Channel,
    exchange_name: &str,
    app_id: &str,
) -> HandlerOutcome {
    let outcome: BillingOutcome = match serde_json::from_slice(&body) {
        Ok(o) => o,
        Err(e) => {
            warn!(error = %e, "dropping malformed billing-status message");
            return HandlerOutcome::Drop;
        }
    };

    let alert = handle_billing_outcome(&outcome);

    match publish_json(
        publish_channel,
        exchange_name,
        RoutingKey::CmdNotificationSendAlert,
        &alert,
        outcome.incident_id,
        "SendAlert",
        app_id,
    )
    .await
    {
        Ok(()) => HandlerOutcome::Ack,
        Err(e) => {
            warn!(error = %e, incident_id = %outcome.incident_id, "send_alert publish failed, requeueing");
            HandlerOutcome::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_are_stable() {
        assert_eq!(QUEUE_TRIAGE_ACTIONABLE, "events-manager.q.triage-actionable");
        assert_eq!(QUEUE_DISPATCH_STATUS, "events-manager.q.dispatch-status");
        assert_eq!(QUEUE_BILLING_STATUS, "events-manager.q.billing-status");
    }
}
