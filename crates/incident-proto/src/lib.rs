//! Shared wire types for the incident pipeline message fabric.
//!
//! Every message that crosses the broker is defined here as an explicit,
//! `serde`-tagged Rust type rather than a duck-typed JSON blob — the triage
//! classifier, events manager, dispatch workflow, and billing saga all
//! depend on this crate instead of parsing each other's payloads ad hoc.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ─── Routing keys ──────────────────────────────────────────────────────────────

/// Every routing key used on the topic exchange, in one place.
///
/// Centralising these avoids the classic duck-typed-topology bug where a
/// producer and consumer drift to slightly different string literals.
#[derive(Debug, Clone, Copy, Hash)]
pub enum RoutingKey {
    WearableData,
    TriageStatusAbnormal,
    TriageStatusEmergency,
    CmdNotificationSendAlert,
    CmdDispatchRequestAmbulance,
    EventDispatchUnitAssigned,
    EventDispatchEnroute,
    EventDispatchPatientOnboard,
    EventDispatchArrivedAtHospital,
    DispatchUpdatesPatientVitals,
    CmdBillingInitiate,
    EventBillingCompleted,
    EventBillingFailed,
}

impl RoutingKey {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WearableData => "wearable.data",
            Self::TriageStatusAbnormal => "triage.status.abnormal",
            Self::TriageStatusEmergency => "triage.status.emergency",
            Self::CmdNotificationSendAlert => "cmd.notification.send_alert",
            Self::CmdDispatchRequestAmbulance => "cmd.dispatch.request_ambulance",
            Self::EventDispatchUnitAssigned => "event.dispatch.unit_assigned",
            Self::EventDispatchEnroute => "event.dispatch.enroute",
            Self::EventDispatchPatientOnboard => "event.dispatch.patient_onboard",
            Self::EventDispatchArrivedAtHospital => "event.dispatch.arrived_at_hospital",
            Self::DispatchUpdatesPatientVitals => "dispatch.updates.patient_vitals",
            Self::CmdBillingInitiate => "cmd.billing.initiate",
            Self::EventBillingCompleted => "event.billing.completed",
            Self::EventBillingFailed => "event.billing.failed",
        }
    }

    /// Parse a routing key that may carry a dynamic suffix (e.g.
    /// `triage.status.*`), returning the base variant for exact literals only.
    pub fn from_str_exact(s: &str) -> Option<Self> {
        Some(match s {
            "wearable.data" => Self::WearableData,
            "triage.status.abnormal" => Self::TriageStatusAbnormal,
            "triage.status.emergency" => Self::TriageStatusEmergency,
            "cmd.notification.send_alert" => Self::CmdNotificationSendAlert,
            "cmd.dispatch.request_ambulance" => Self::CmdDispatchRequestAmbulance,
            "event.dispatch.unit_assigned" => Self::EventDispatchUnitAssigned,
            "event.dispatch.enroute" => Self::EventDispatchEnroute,
            "event.dispatch.patient_onboard" => Self::EventDispatchPatientOnboard,
            "event.dispatch.arrived_at_hospital" => Self::EventDispatchArrivedAtHospital,
            "dispatch.updates.patient_vitals" => Self::DispatchUpdatesPatientVitals,
            "cmd.billing.initiate" => Self::CmdBillingInitiate,
            "event.billing.completed" => Self::EventBillingCompleted,
            "event.billing.failed" => Self::EventBillingFailed,
            _ => return None,
        })
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq for RoutingKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for RoutingKey {}

// ─── Common value types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

/// Source device metadata. Never validated (no device auth — see spec
/// non-goals); forwarded opaquely by triage, ignored by everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct VitalsMetrics {
    #[serde(default)]
    pub heart_rate_bpm: Option<i32>,
    #[serde(default)]
    pub spo2_pct: Option<f64>,
    #[serde(default)]
    pub respiration_rate_bpm: Option<i32>,
    #[serde(default)]
    pub body_temperature_c: Option<f64>,
    #[serde(default)]
    pub steps_since_last: Option<i64>,
}

/// Integer-cents money. All saga arithmetic happens here; conversion to a
/// gateway's native representation happens only at the gateway client
/// boundary (spec §9 "Amount representation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cents(pub i64);

impl Cents {
    pub const fn from_dollars(dollars: f64) -> Self {
        Self((dollars * 100.0) as i64)
    }

    pub fn as_dollars(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Cents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.2}", self.as_dollars())
    }
}

// ─── wearable.data ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalsReading {
    pub patient_id: String,
    pub device_id: String,
    #[serde(default)]
    pub device: Option<DeviceInfo>,
    pub location: Location,
    pub timestamp_ms: i64,
    pub metrics: VitalsMetrics,
}

// ─── triage.status.{abnormal|emergency} ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriageStatusKind {
    Normal,
    Abnormal,
    Emergency,
}

impl TriageStatusKind {
    pub fn routing_key(self) -> Option<RoutingKey> {
        match self {
            Self::Normal => None,
            Self::Abnormal => Some(RoutingKey::TriageStatusAbnormal),
            Self::Emergency => Some(RoutingKey::TriageStatusEmergency),
        }
    }
}

impl fmt::Display for TriageStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Abnormal => write!(f, "abnormal"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageStatus {
    #[serde(rename = "type")]
    pub kind: String,
    pub incident_id: Uuid,
    pub patient_id: String,
    pub status: TriageStatusKind,
    pub metrics: VitalsMetrics,
    pub location: Location,
    pub ts: DateTime<Utc>,
}

impl TriageStatus {
    pub fn new(
        incident_id: Uuid,
        patient_id: String,
        status: TriageStatusKind,
        metrics: VitalsMetrics,
        location: Location,
        ts: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: "TriageStatus".to_string(),
            incident_id,
            patient_id,
            status,
            metrics,
            location,
            ts,
        }
    }
}

// ─── cmd.notification.send_alert ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertTemplate {
    #[serde(rename = "TRIAGE_ABNORMAL")]
    TriageAbnormal,
    #[serde(rename = "TRIAGE_EMERGENCY")]
    TriageEmergency,
    #[serde(rename = "DISPATCH_UNIT_ASSIGNED")]
    DispatchUnitAssigned,
    #[serde(rename = "DISPATCH_ENROUTE")]
    DispatchEnroute,
    #[serde(rename = "DISPATCH_PATIENT_ONBOARD")]
    DispatchPatientOnboard,
    #[serde(rename = "DISPATCH_ARRIVED_AT_HOSPITAL")]
    DispatchArrivedAtHospital,
    #[serde(rename = "BILLING_COMPLETED")]
    BillingCompleted,
    #[serde(rename = "BILLING_FAILED")]
    BillingFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub incident_id: Uuid,
    pub template: AlertTemplate,
    pub vars: serde_json::Map<String, serde_json::Value>,
}

impl AlertCommand {
    pub fn new(
        incident_id: Uuid,
        template: AlertTemplate,
        vars: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            kind: "SendAlert".to_string(),
            incident_id,
            template,
            vars,
        }
    }
}

// ─── cmd.dispatch.request_ambulance ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestAmbulance {
    #[serde(rename = "type")]
    pub kind: String,
    pub incident_id: Uuid,
    pub patient_id: String,
    pub command: String,
    pub location: Location,
    pub reason: String,
}

impl RequestAmbulance {
    pub fn new(incident_id: Uuid, patient_id: String, location: Location, reason: &str) -> Self {
        Self {
            kind: "RequestAmbulance".to_string(),
            incident_id,
            patient_id,
            command: "request_ambulance".to_string(),
            location,
            reason: reason.to_string(),
        }
    }
}

// ─── event.dispatch.* ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    UnitAssigned,
    Enroute,
    PatientOnboard,
    ArrivedAtHospital,
}

impl DispatchStatus {
    pub fn routing_key(self) -> RoutingKey {
        match self {
            Self::UnitAssigned => RoutingKey::EventDispatchUnitAssigned,
            Self::Enroute => RoutingKey::EventDispatchEnroute,
            Self::PatientOnboard => RoutingKey::EventDispatchPatientOnboard,
            Self::ArrivedAtHospital => RoutingKey::EventDispatchArrivedAtHospital,
        }
    }

    pub fn alert_template(self) -> AlertTemplate {
        match self {
            Self::UnitAssigned => AlertTemplate::DispatchUnitAssigned,
            Self::Enroute => AlertTemplate::DispatchEnroute,
            Self::PatientOnboard => AlertTemplate::DispatchPatientOnboard,
            Self::ArrivedAtHospital => AlertTemplate::DispatchArrivedAtHospital,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub incident_id: Uuid,
    pub dispatch_id: Uuid,
    pub patient_id: String,
    pub unit_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hospital_id: Option<String>,
    pub status: DispatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_minutes: Option<u32>,
    pub ts: DateTime<Utc>,
}

// ─── dispatch.updates.patient_vitals ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientVitalsUpdate {
    pub dispatch_id: Uuid,
    pub patient_id: String,
    pub vitals: VitalsMetrics,
    pub recorded_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

// ─── cmd.billing.initiate ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateBilling {
    #[serde(rename = "type")]
    pub kind: String,
    pub incident_id: Uuid,
    pub patient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hospital_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub amount: Cents,
}

impl InitiateBilling {
    pub fn new(incident_id: Uuid, patient_id: String, hospital_id: Option<String>, amount: Cents) -> Self {
        Self {
            kind: "InitiateBilling".to_string(),
            incident_id,
            patient_id,
            hospital_id,
            summary: None,
            amount,
        }
    }
}

// ─── event.billing.{completed|failed} ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BillingOutcomeStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingOutcome {
    pub billing_id: String,
    pub incident_id: Uuid,
    pub patient_id: String,
    pub amount: Cents,
    pub status: BillingOutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl BillingOutcome {
    pub fn routing_key(&self) -> RoutingKey {
        match self.status {
            BillingOutcomeStatus::Completed => RoutingKey::EventBillingCompleted,
            BillingOutcomeStatus::Cancelled => RoutingKey::EventBillingFailed,
        }
    }

    pub fn alert_template(&self) -> AlertTemplate {
        match self.status {
            BillingOutcomeStatus::Completed => AlertTemplate::BillingCompleted,
            BillingOutcomeStatus::Cancelled => AlertTemplate::BillingFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_roundtrips_through_str() {
        for rk in [
            RoutingKey::WearableData,
            RoutingKey::TriageStatusAbnormal,
            RoutingKey::TriageStatusEmergency,
            RoutingKey::CmdNotificationSendAlert,
            RoutingKey::CmdDispatchRequestAmbulance,
            RoutingKey::EventDispatchUnitAssigned,
            RoutingKey::EventDispatchEnroute,
            RoutingKey::EventDispatchPatientOnboard,
            RoutingKey::EventDispatchArrivedAtHospital,
            RoutingKey::DispatchUpdatesPatientVitals,
            RoutingKey::CmdBillingInitiate,
            RoutingKey::EventBillingCompleted,
            RoutingKey::EventBillingFailed,
        ] {
            assert_eq!(RoutingKey::from_str_exact(rk.as_str()), Some(rk));
        }
    }

    #[test]
    fn cents_formats_as_dollars() {
        assert_eq!(Cents(12345).to_string(), "$123.45");
        assert_eq!(Cents::from_dollars(50.0).0, 5000);
    }

    #[test]
    fn triage_status_serializes_with_type_tag() {
        let ts = TriageStatus::new(
            Uuid::nil(),
            "p1".to_string(),
            TriageStatusKind::Emergency,
            VitalsMetrics::default(),
            Location { lat: 0.0, lng: 0.0 },
            Utc::now(),
        );
        let json = serde_json::to_value(&ts).unwrap();
        assert_eq!(json["type"], "TriageStatus");
        assert_eq!(json["status"], "emergency");

        let back: TriageStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back.patient_id, ts.patient_id);
    }
}
