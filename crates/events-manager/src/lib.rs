//! Orchestration: turn triage and dispatch events into alert commands, a
//! conditional ambulance request, and an idempotent billing kickoff.
//!
//! Each `handle_*` function here is a pure translation from one inbound
//! event to the commands it produces; [`consumer`] is the only piece that
//! touches the broker. The one piece of shared mutable state is
//! [`IdempotencyLedger`], which makes "exactly one `cmd.billing.initiate`
//! per incident" hold regardless of how many `arrived_at_hospital` events
//! get redelivered.

#![forbid(unsafe_code)]

use std::collections::HashSet;

use incident_proto::{
    AlertCommand, BillingOutcome, Cents, DispatchEvent, DispatchStatus, InitiateBilling,
    RequestAmbulance, TriageStatus, TriageStatusKind,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

pub mod consumer;

/// Flat fee billed per ambulance dispatch. The source system never wires an
/// amount into `cmd.billing.initiate` — events-manager assigns one.
pub const AMBULANCE_DISPATCH_FEE: Cents = Cents(5000);

// ─── Idempotency ───────────────────────────────────────────────────────────────

/// Set of incidents for which `cmd.billing.initiate` has already been
/// emitted (spec §3 `IdempotencyLedger`). Unbounded for the lifetime of the
/// process — see the bounded-growth note in the design ledger.
pub struct IdempotencyLedger {
    billed_incidents: Mutex<HashSet<Uuid>>,
}

impl Default for IdempotencyLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyLedger {
    pub fn new() -> Self {
        Self {
            billed_incidents: Mutex::new(HashSet::new()),
        }
    }

    /// Check-then-insert under one mutex acquisition. Returns `true` only
    /// the first time a given incident is seen.
    pub fn try_bill(&self, incident_id: Uuid) -> bool {
        self.billed_incidents.lock().insert(incident_id)
    }
}

// ─── Triage handler ────────────────────────────────────────────────────────────

pub struct TriageOutcome {
    pub alert: AlertCommand,
    pub dispatch_request: Option<RequestAmbulance>,
}

fn triage_alert_vars(status: &TriageStatus) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("patient_id".to_string(), Value::String(status.patient_id.clone()));
    vars.insert("status".to_string(), Value::String(status.status.to_string()));
    vars.insert(
        "metrics".to_string(),
        serde_json::to_value(status.metrics).expect("VitalsMetrics always serializes"),
    );
    vars.insert(
        "location".to_string(),
        serde_json::to_value(status.location).expect("Location always serializes"),
    );
    vars.insert(
        "ts".to_string(),
        serde_json::to_value(status.ts).expect("DateTime always serializes"),
    );
    vars
}

fn triage_template(status: TriageStatusKind) -> incident_proto::AlertTemplate {
    match status {
        TriageStatusKind::Abnormal => incident_proto::AlertTemplate::TriageAbnormal,
        TriageStatusKind::Emergency => incident_proto::AlertTemplate::TriageEmergency,
        TriageStatusKind::Normal => {
            unreachable!("triage-actionable queue is only ever bound to abnormal/emergency")
        }
    }
}

/// Every actionable triage status always produces an alert; emergency
/// additionally requests an ambulance (spec §4.3 "Triage handler").
pub fn handle_triage_status(status: &TriageStatus) -> TriageOutcome {
    let alert = AlertCommand::new(status.incident_id, triage_template(status.status), triage_alert_vars(status));

    let dispatch_request = (status.status == TriageStatusKind::Emergency).then(|| {
        RequestAmbulance::new(
            status.incident_id,
            status.patient_id.clone(),
            status.location,
            "TRIAGE_EMERGENCY",
        )
    });

    TriageOutcome { alert, dispatch_request }
}

// ─── Dispatch handler ──────────────────────────────────────────────────────────

pub struct DispatchOutcome {
    pub alert: AlertCommand,
    pub billing: Option<InitiateBilling>,
}

fn dispatch_alert_vars(event: &DispatchEvent) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("patient_id".to_string(), Value::String(event.patient_id.clone()));
    vars.insert("unit_id".to_string(), Value::String(event.unit_id.clone()));
    if let Some(hospital_id) = &event.hospital_id {
        vars.insert("hospital_id".to_string(), Value::String(hospital_id.clone()));
    }
    if let Some(eta) = event.eta_minutes {
        vars.insert("eta_minutes".to_string(), Value::Number(eta.into()));
    }
    vars.insert(
        "ts".to_string(),
        serde_json::to_value(event.ts).expect("DateTime always serializes"),
    );
    vars
}

/// Every dispatch status transition produces an alert from the fixed
/// routing-key → template table (spec §4.3); `arrived_at_hospital` also
/// kicks off billing, guarded by the idempotency ledger.
pub fn handle_dispatch_event(event: &DispatchEvent, ledger: &IdempotencyLedger) -> DispatchOutcome {
    let alert = AlertCommand::new(
        event.incident_id,
        event.status.alert_template(),
        dispatch_alert_vars(event),
    );

    let billing = (event.status == DispatchStatus::ArrivedAtHospital && ledger.try_bill(event.incident_id))
        .then(|| {
            InitiateBilling::new(
                event.incident_id,
                event.patient_id.clone(),
                event.hospital_id.clone(),
                AMBULANCE_DISPATCH_FEE,
            )
        });

    DispatchOutcome { alert, billing }
}

// ─── Billing handler ───────────────────────────────────────────────────────────

fn billing_alert_vars(outcome: &BillingOutcome) -> Map<String, Value> {
    let mut vars = Map::new();
    vars.insert("patient_id".to_string(), Value::String(outcome.patient_id.clone()));
    vars.insert("amount".to_string(), Value::String(outcome.amount.to_string()));
    if let Some(reference) = &outcome.payment_reference {
        vars.insert("payment_reference".to_string(), Value::String(reference.clone()));
    }
    if let Some(error) = &outcome.error {
        vars.insert("error".to_string(), Value::String(error.clone()));
    }
    vars
}

/// `billing.completed`/`billing.failed` both collapse to one alert (spec
/// §4.3 "Billing handler").
pub fn handle_billing_outcome(outcome: &BillingOutcome) -> AlertCommand {
    AlertCommand::new(outcome.incident_id, outcome.alert_template(), billing_alert_vars(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use incident_proto::{AlertTemplate, BillingOutcomeStatus, Location};

    fn triage_status(incident_id: Uuid, kind: TriageStatusKind) -> TriageStatus {
        TriageStatus::new(
            incident_id,
            "p1".to_string(),
            kind,
            Default::default(),
            Location { lat: 1.0, lng: 2.0 },
            Utc::now(),
        )
    }

    #[test]
    fn abnormal_triage_alerts_but_does_not_dispatch() {
        let outcome = handle_triage_status(&triage_status(Uuid::new_v4(), TriageStatusKind::Abnormal));
        assert_eq!(outcome.alert.template, AlertTemplate::TriageAbnormal);
        assert!(outcome.dispatch_request.is_none());
    }

    #[test]
    fn emergency_triage_alerts_and_dispatches() {
        let outcome = handle_triage_status(&triage_status(Uuid::new_v4(), TriageStatusKind::Emergency));
        assert_eq!(outcome.alert.template, AlertTemplate::TriageEmergency);
        let request = outcome.dispatch_request.expect("emergency must request an ambulance");
        assert_eq!(request.reason, "TRIAGE_EMERGENCY");
    }

    fn dispatch_event(incident_id: Uuid, status: DispatchStatus) -> DispatchEvent {
        DispatchEvent {
            incident_id,
            dispatch_id: Uuid::new_v4(),
            patient_id: "p1".to_string(),
            unit_id: "unit-1".to_string(),
            hospital_id: Some("hosp-1".to_string()),
            status,
            eta_minutes: Some(7),
            ts: Utc::now(),
        }
    }

    #[test]
    fn only_arrived_at_hospital_initiates_billing() {
        let ledger = IdempotencyLedger::new();
        let incident_id = Uuid::new_v4();
        for status in [DispatchStatus::UnitAssigned, DispatchStatus::Enroute, DispatchStatus::PatientOnboard] {
            let outcome = handle_dispatch_event(&dispatch_event(incident_id, status), &ledger);
            assert!(outcome.billing.is_none());
        }
        let outcome = handle_dispatch_event(&dispatch_event(incident_id, DispatchStatus::ArrivedAtHospital), &ledger);
        assert!(outcome.billing.is_some());
    }

    #[test]
    fn duplicate_arrived_events_bill_exactly_once() {
        let ledger = IdempotencyLedger::new();
        let incident_id = Uuid::new_v4();
        let first = handle_dispatch_event(&dispatch_event(incident_id, DispatchStatus::ArrivedAtHospital), &ledger);
        let second = handle_dispatch_event(&dispatch_event(incident_id, DispatchStatus::ArrivedAtHospital), &ledger);
        assert!(first.billing.is_some());
        assert!(second.billing.is_none(), "second arrived event for the same incident must not re-bill");
        assert!(second.alert.template == AlertTemplate::DispatchArrivedAtHospital, "the alert itself still fires every time");
    }

    #[test]
    fn different_incidents_each_bill_once() {
        let ledger = IdempotencyLedger::new();
        let a = handle_dispatch_event(&dispatch_event(Uuid::new_v4(), DispatchStatus::ArrivedAtHospital), &ledger);
        let b = handle_dispatch_event(&dispatch_event(Uuid::new_v4(), DispatchStatus::ArrivedAtHospital), &ledger);
        assert!(a.billing.is_some());
        assert!(b.billing.is_some());
    }

    #[test]
    fn billing_outcomes_map_to_alert_templates() {
        let completed = BillingOutcome {
            billing_id: "b1".to_string(),
            incident_id: Uuid::new_v4(),
            patient_id: "p1".to_string(),
            amount: Cents(5000),
            status: BillingOutcomeStatus::Completed,
            payment_reference: Some("ref-1".to_string()),
            error: None,
            timestamp: Utc::now(),
        };
        assert_eq!(handle_billing_outcome(&completed).template, AlertTemplate::BillingCompleted);

        let cancelled = BillingOutcome {
            status: BillingOutcomeStatus::Cancelled,
            payment_reference: None,
            error: Some("NO_POLICY".to_string()),
            ..completed
        };
        assert_eq!(handle_billing_outcome(&cancelled).template, AlertTemplate::BillingFailed);
    }
}
