//! Triage classification and per-patient transition filtering.
//!
//! Converts a stream of [`VitalsReading`]s into a deduplicated stream of
//! actionable [`TriageStatus`] events. The classification table and the
//! transition filter are both pure, synchronous functions; [`Ledger`] is
//! the only piece of mutable state, guarded by a single mutex the way
//! spec §4.2's "Concurrency" note requires.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use chrono::Utc;
use incident_proto::{TriageStatus, TriageStatusKind, VitalsMetrics, VitalsReading};
use parking_lot::Mutex;
use uuid::Uuid;

pub mod consumer;

// ─── Classification ────────────────────────────────────────────────────────────

/// Treat a missing metric as out-of-range: "for safety" (spec §4.2), any
/// gap in the reading is assumed to be the worst case rather than ignored.
fn out_of_range_or<T: Copy>(value: Option<T>, is_out_of_range: impl Fn(T) -> bool) -> bool {
    value.map(is_out_of_range).unwrap_or(true)
}

/// Classify a single reading's metrics, first match wins (spec §4.2 table).
///
/// Returns the status plus a short human-readable reason for the
/// eventual alert body.
pub fn classify(metrics: &VitalsMetrics) -> (TriageStatusKind, &'static str) {
    let spo2_critical = out_of_range_or(metrics.spo2_pct, |v| v < 91.0);
    let hr_critical = out_of_range_or(metrics.heart_rate_bpm, |v| v > 150 || v < 40);
    let temp_critical = out_of_range_or(metrics.body_temperature_c, |v| v > 39.0 || v < 35.0);
    let resp_critical = out_of_range_or(metrics.respiration_rate_bpm, |v| v > 30 || v < 8);

    if spo2_critical {
        return (TriageStatusKind::Emergency, "severe hypoxia");
    }
    if hr_critical {
        return (TriageStatusKind::Emergency, "critical heart rate");
    }
    if temp_critical {
        return (TriageStatusKind::Emergency, "critical temperature");
    }
    if resp_critical {
        return (TriageStatusKind::Emergency, "critical respiration");
    }

    let spo2_abnormal = out_of_range_or(metrics.spo2_pct, |v| v < 95.0);
    let hr_abnormal = out_of_range_or(metrics.heart_rate_bpm, |v| v > 100 || v < 50);
    let temp_abnormal = out_of_range_or(metrics.body_temperature_c, |v| v > 37.5 || v < 36.0);
    let resp_abnormal = out_of_range_or(metrics.respiration_rate_bpm, |v| v > 24 || v < 10);

    if spo2_abnormal {
        return (TriageStatusKind::Abnormal, "mild hypoxia");
    }
    if hr_abnormal {
        return (TriageStatusKind::Abnormal, "abnormal heart rate");
    }
    if temp_abnormal {
        return (TriageStatusKind::Abnormal, "abnormal temperature");
    }
    if resp_abnormal {
        return (TriageStatusKind::Abnormal, "abnormal respiration");
    }

    (TriageStatusKind::Normal, "vitals within normal range")
}

// ─── Transition filter ─────────────────────────────────────────────────────────

/// Per-patient last-observed-status ledger (spec §3 `PatientStatusLedger`).
pub struct Ledger {
    last_status: Mutex<HashMap<String, TriageStatusKind>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            last_status: Mutex::new(HashMap::new()),
        }
    }

    /// Process one reading. Returns `Some(TriageStatus)` only when the
    /// classified status is a fresh transition into {abnormal, emergency}
    /// (spec §3 invariant — "normal" is never emitted downstream).
    pub fn process(&self, reading: &VitalsReading) -> Option<TriageStatus> {
        let (status, reason) = classify(&reading.metrics);
        let mut ledger = self.last_status.lock();
        let previous = ledger
            .get(&reading.patient_id)
            .copied()
            .unwrap_or(TriageStatusKind::Normal);

        if status == previous {
            return None;
        }
        ledger.insert(reading.patient_id.clone(), status);
        drop(ledger);

        match status {
            TriageStatusKind::Normal => None,
            TriageStatusKind::Abnormal | TriageStatusKind::Emergency => {
                let _ = reason;
                Some(TriageStatus::new(
                    Uuid::new_v4(),
                    reading.patient_id.clone(),
                    status,
                    reading.metrics,
                    reading.location,
                    Utc::now(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use incident_proto::Location;

    fn metrics(hr: i32, spo2: f64, resp: i32, temp: f64) -> VitalsMetrics {
        VitalsMetrics {
            heart_rate_bpm: Some(hr),
            spo2_pct: Some(spo2),
            respiration_rate_bpm: Some(resp),
            body_temperature_c: Some(temp),
            steps_since_last: Some(0),
        }
    }

    #[test]
    fn classifies_normal_baseline() {
        let (status, _) = classify(&metrics(70, 98.0, 16, 37.0));
        assert_eq!(status, TriageStatusKind::Normal);
    }

    #[test]
    fn spo2_boundaries() {
        assert_eq!(classify(&metrics(70, 90.9, 16, 37.0)).0, TriageStatusKind::Emergency);
        assert_eq!(classify(&metrics(70, 91.0, 16, 37.0)).0, TriageStatusKind::Abnormal);
        assert_eq!(classify(&metrics(70, 94.9, 16, 37.0)).0, TriageStatusKind::Abnormal);
        assert_eq!(classify(&metrics(70, 95.0, 16, 37.0)).0, TriageStatusKind::Normal);
    }

    #[test]
    fn heart_rate_boundaries() {
        assert_eq!(classify(&metrics(39, 98.0, 16, 37.0)).0, TriageStatusKind::Emergency);
        assert_eq!(classify(&metrics(40, 98.0, 16, 37.0)).0, TriageStatusKind::Abnormal);
        assert_eq!(classify(&metrics(50, 98.0, 16, 37.0)).0, TriageStatusKind::Normal);
        assert_eq!(classify(&metrics(100, 98.0, 16, 37.0)).0, TriageStatusKind::Normal);
        assert_eq!(classify(&metrics(150, 98.0, 16, 37.0)).0, TriageStatusKind::Abnormal);
        assert_eq!(classify(&metrics(151, 98.0, 16, 37.0)).0, TriageStatusKind::Emergency);
    }

    #[test]
    fn temperature_boundaries() {
        assert_eq!(classify(&metrics(70, 98.0, 16, 34.99)).0, TriageStatusKind::Emergency);
        assert_eq!(classify(&metrics(70, 98.0, 16, 35.0)).0, TriageStatusKind::Abnormal);
        assert_eq!(classify(&metrics(70, 98.0, 16, 36.0)).0, TriageStatusKind::Normal);
        assert_eq!(classify(&metrics(70, 98.0, 16, 37.5)).0, TriageStatusKind::Normal);
        assert_eq!(classify(&metrics(70, 98.0, 16, 39.0)).0, TriageStatusKind::Abnormal);
        assert_eq!(classify(&metrics(70, 98.0, 16, 39.01)).0, TriageStatusKind::Emergency);
    }

    #[test]
    fn respiration_boundaries() {
        assert_eq!(classify(&metrics(70, 98.0, 7, 37.0)).0, TriageStatusKind::Emergency);
        assert_eq!(classify(&metrics(70, 98.0, 8, 37.0)).0, TriageStatusKind::Abnormal);
        assert_eq!(classify(&metrics(70, 98.0, 10, 37.0)).0, TriageStatusKind::Normal);
        assert_eq!(classify(&metrics(70, 98.0, 24, 37.0)).0, TriageStatusKind::Normal);
        assert_eq!(classify(&metrics(70, 98.0, 30, 37.0)).0, TriageStatusKind::Abnormal);
        assert_eq!(classify(&metrics(70, 98.0, 31, 37.0)).0, TriageStatusKind::Emergency);
    }

    #[test]
    fn missing_metrics_classify_as_emergency() {
        let (status, _) = classify(&VitalsMetrics::default());
        assert_eq!(status, TriageStatusKind::Emergency);
    }

    fn reading(patient_id: &str, hr: i32, spo2: f64) -> VitalsReading {
        VitalsReading {
            patient_id: patient_id.to_string(),
            device_id: "dev-1".to_string(),
            device: None,
            location: Location { lat: 1.0, lng: 2.0 },
            timestamp_ms: 0,
            metrics: metrics(hr, spo2, 16, 37.0),
        }
    }

    #[test]
    fn dedups_consecutive_identical_statuses() {
        let ledger = Ledger::new();
        let r = reading("p1", 160, 88.0);
        assert!(ledger.process(&r).is_some(), "first emergency reading must emit");
        assert!(ledger.process(&r).is_none(), "second identical reading must not emit");
        assert!(ledger.process(&r).is_none(), "third identical reading must not emit");
    }

    #[test]
    fn emits_again_after_returning_to_normal_and_back() {
        let ledger = Ledger::new();
        let emergency = reading("p1", 160, 88.0);
        let normal = reading("p1", 70, 98.0);

        assert!(ledger.process(&emergency).is_some());
        assert!(ledger.process(&normal).is_none(), "transition into normal is never emitted");
        assert!(ledger.process(&emergency).is_some(), "re-entering emergency emits again");
    }

    #[test]
    fn different_patients_are_independent() {
        let ledger = Ledger::new();
        let p1 = reading("p1", 160, 88.0);
        let p2 = reading("p2", 160, 88.0);
        assert!(ledger.process(&p1).is_some());
        assert!(ledger.process(&p2).is_some(), "p2's first emergency must also emit");
    }

    #[test]
    fn emitted_event_carries_fresh_incident_id() {
        let ledger = Ledger::new();
        let a = ledger.process(&reading("p1", 160, 88.0)).unwrap();
        let b = ledger.process(&reading("p1", 70, 98.0)); // back to normal, no emit
        assert!(b.is_none());
        let c = ledger.process(&reading("p1", 160, 88.0)).unwrap();
        assert_ne!(a.incident_id, c.incident_id);
    }
}
