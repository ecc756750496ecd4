//! Wires the classifier onto the broker: consume `wearable.data`, classify,
//! publish actionable transitions.

use incident_broker::{Channel, HandlerOutcome};
use incident_proto::{RoutingKey, VitalsReading};
use tracing::{debug, warn};

use crate::Ledger;

pub const QUEUE_NAME: &str = "triage.q.wearable-data";

/// Handle one `wearable.data` delivery.
///
/// Malformed bodies are dropped (spec §4.2: "Malformed messages are
/// dropped"); a publish failure is retried by requeueing so the
/// orchestrator sees the reading again.
pub async fn handle_delivery(
    body: Vec<u8>,
    ledger: &Ledger,
    publish_channel: &Channel,
    exchange_name: &str,
    app_id: &str,
) -> HandlerOutcome {
    let reading: VitalsReading = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "dropping malformed wearable.data message");
            return HandlerOutcome::Drop;
        }
    };

    let Some(triage_status) = ledger.process(&reading) else {
        debug!(patient_id = %reading.patient_id, "no status transition, nothing to publish");
        return HandlerOutcome::Ack;
    };

    let routing_key = triage_status
        .status
        .routing_key()
        .expect("process() never returns a Normal transition");

    let publish_result = incident_broker::publish_json(
        publish_channel,
        exchange_name,
        routing_key,
        &triage_status,
        triage_status.incident_id,
        "TriageStatus",
        app_id,
    )
    .await;

    match publish_result {
        Ok(()) => HandlerOutcome::Ack,
        Err(e) => {
            warn!(error = %e, incident_id = %triage_status.incident_id, "publish failed, requeueing");
            HandlerOutcome::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    // `handle_delivery`'s JSON-parsing and ledger-dispatch logic is covered
    // indirectly through `Ledger::process` and `classify` unit tests; the
    // broker round-trip itself is exercised in `incident-tests`.
    use super::*;

    #[test]
    fn queue_name_is_stable() {
        assert_eq!(QUEUE_NAME, "triage.q.wearable-data");
    }
}
