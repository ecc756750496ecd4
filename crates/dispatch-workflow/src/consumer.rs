//! Wires hospital selection and the per-incident workflow onto
//! `cmd.dispatch.request_ambulance` (spec §4.4).

use std::sync::Arc;

use incident_broker::HandlerOutcome;
use incident_proto::RequestAmbulance;
use tracing::{info, warn};

use crate::hospital::{resolve_hospital, eta_minutes, HospitalDirectory, PlacesApiFallback};
use crate::workflow::ActiveDispatches;

pub const QUEUE_NAME: &str = "dispatch.q.request-ambulance";

/// Default severity used when a request doesn't carry one (spec §4.4:
/// "severity (default 1)" — `RequestAmbulance` itself never carries a
/// numeric severity field, only the textual `reason`).
const DEFAULT_SEVERITY: i32 = 1;

/// Resolve a hospital and spawn the per-incident workflow. The workflow
/// runs for the lifetime of the incident (up to ~15s); the triggering
/// message is acked once the workflow is launched, not once it completes.
#[allow(clippy::too_many_arguments)]
pub async fn handle_delivery(
    body: Vec<u8>,
    conn: Arc<lapin::Connection>,
    active: Arc<ActiveDispatches>,
    directory: Arc<dyn HospitalDirectory>,
    fallback: Arc<dyn PlacesApiFallback>,
    exchange_name: String,
    app_id: String,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> HandlerOutcome {
    let request: RequestAmbulance = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "dropping malformed request_ambulance message");
            return HandlerOutcome::Drop;
        }
    };

    let resolved = match resolve_hospital(directory.as_ref(), fallback.as_ref(), request.location, DEFAULT_SEVERITY).await {
        Ok(Some(scored)) => scored,
        Ok(None) => {
            warn!(incident_id = %request.incident_id, "no hospital available, dropping request");
            return HandlerOutcome::Drop;
        }
        Err(e) => {
            warn!(error = %e, incident_id = %request.incident_id, "hospital lookup failed, requeueing");
            return HandlerOutcome::Retry;
        }
    };

    let eta = eta_minutes(resolved.distance_km);

    info!(
        incident_id = %request.incident_id,
        hospital = %resolved.hospital.id,
        distance_km = resolved.distance_km,
        eta,
        "launching dispatch workflow"
    );

    tokio::spawn(crate::workflow::run_workflow(
        conn,
        active,
        exchange_name,
        app_id,
        request.incident_id,
        request.patient_id,
        Some(resolved.hospital.id),
        eta,
        shutdown,
    ));

    HandlerOutcome::Ack
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_name_is_stable() {
        assert_eq!(QUEUE_NAME, "dispatch.q.request-ambulance");
    }
}
