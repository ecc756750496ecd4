//! Per-incident dispatch workflow: unit assignment through hospital
//! arrival, with a concurrent vitals-monitoring task (spec §4.4).
//!
//! Each task below is handed its own [`Channel`] — broker client libraries
//! don't multiplex one channel safely across tasks, so the workflow task
//! and the vitals task each dial a fresh one and close it on exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::Connection;

use chrono::Utc;
use incident_broker::{publish_json, Channel};
use incident_proto::{DispatchEvent, DispatchStatus, PatientVitalsUpdate, RoutingKey, VitalsMetrics};
use parking_lot::Mutex;
use rand::Rng;
use tracing::info;
use uuid::Uuid;

const PATIENT_ONBOARD_DELAY: Duration = Duration::from_secs(5);
const TRANSPORT_DURATION: Duration = Duration::from_secs(10);
const VITALS_INTERVAL: Duration = Duration::from_secs(2);

/// One active incident's dispatch state (spec §3 `DispatchRecord`).
pub struct DispatchRecord {
    pub incident_id: Uuid,
    pub patient_id: String,
    pub unit_id: String,
    pub hospital_id: Option<String>,
    stop_monitoring: Arc<AtomicBool>,
}

/// Mutex-protected map of dispatches currently in flight.
#[derive(Default)]
pub struct ActiveDispatches {
    records: Mutex<HashMap<Uuid, DispatchRecord>>,
}

impl ActiveDispatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, dispatch_id: Uuid, record: DispatchRecord) {
        self.records.lock().insert(dispatch_id, record);
    }

    pub fn remove(&self, dispatch_id: Uuid) -> Option<DispatchRecord> {
        self.records.lock().remove(&dispatch_id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn synthetic_vitals() -> VitalsMetrics {
    let mut rng = rand::thread_rng();
    VitalsMetrics {
        heart_rate_bpm: Some(rng.gen_range(60..=140)),
        spo2_pct: Some(rng.gen_range(90..=100) as f64),
        respiration_rate_bpm: Some(rng.gen_range(12..=20)),
        body_temperature_c: Some(rng.gen_range(365..=385) as f64 / 10.0),
        steps_since_last: Some(0),
    }
}

/// Loop publishing synthetic vitals every 2 seconds until `stop_monitoring`
/// flips, or shutdown is signalled. Owns its own channel, closed on exit.
async fn run_vitals_task(
    channel: Channel,
    exchange_name: String,
    app_id: String,
    dispatch_id: Uuid,
    patient_id: String,
    stop_monitoring: Arc<AtomicBool>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(%dispatch_id, "vitals task started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(VITALS_INTERVAL) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if stop_monitoring.load(Ordering::Relaxed) || *shutdown.borrow() {
            break;
        }

        let now = Utc::now();
        let update = PatientVitalsUpdate {
            dispatch_id,
            patient_id: patient_id.clone(),
            vitals: synthetic_vitals(),
            recorded_at: now,
            timestamp: now,
        };
        if let Err(e) = publish_json(
            &channel,
            &exchange_name,
            RoutingKey::DispatchUpdatesPatientVitals,
            &update,
            dispatch_id,
            "PatientVitalsUpdate",
            &app_id,
        )
        .await
        {
            tracing::warn!(error = %e, %dispatch_id, "failed to publish patient vitals, continuing");
        }
    }
    let _ = channel.close(200, "vitals task exiting").await;
    info!(%dispatch_id, "vitals task stopped");
}

/// Drive one incident from unit assignment through hospital arrival. Owns
/// its own channel and spawns the vitals task with a second one.
#[allow(clippy::too_many_arguments)]
pub async fn run_workflow(
    conn: Arc<Connection>,
    active: Arc<ActiveDispatches>,
    exchange_name: String,
    app_id: String,
    incident_id: Uuid,
    patient_id: String,
    hospital_id: Option<String>,
    eta_minutes: u32,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let dispatch_id = Uuid::new_v4();
    let unit_id = format!("amb-{}", &dispatch_id.simple().to_string()[..8]);
    let stop_monitoring = Arc::new(AtomicBool::new(false));

    active.register(
        dispatch_id,
        DispatchRecord {
            incident_id,
            patient_id: patient_id.clone(),
            unit_id: unit_id.clone(),
            hospital_id: hospital_id.clone(),
            stop_monitoring: stop_monitoring.clone(),
        },
    );

    let channel = conn.create_channel().await?;

    publish_dispatch_event(
        &channel,
        &exchange_name,
        &app_id,
        incident_id,
        dispatch_id,
        &patient_id,
        &unit_id,
        hospital_id.clone(),
        DispatchStatus::UnitAssigned,
        Some(eta_minutes),
    )
    .await?;
    publish_dispatch_event(
        &channel,
        &exchange_name,
        &app_id,
        incident_id,
        dispatch_id,
        &patient_id,
        &unit_id,
        hospital_id.clone(),
        DispatchStatus::Enroute,
        Some(eta_minutes),
    )
    .await?;

    if wait_or_shutdown(PATIENT_ONBOARD_DELAY, &mut shutdown).await {
        active.remove(dispatch_id);
        channel.close(200, "workflow cancelled").await.ok();
        return Ok(());
    }

    publish_dispatch_event(
        &channel,
        &exchange_name,
        &app_id,
        incident_id,
        dispatch_id,
        &patient_id,
        &unit_id,
        hospital_id.clone(),
        DispatchStatus::PatientOnboard,
        None,
    )
    .await?;

    let vitals_channel = conn.create_channel().await?;
    let vitals_task = tokio::spawn(run_vitals_task(
        vitals_channel,
        exchange_name.clone(),
        app_id.clone(),
        dispatch_id,
        patient_id.clone(),
        stop_monitoring.clone(),
        shutdown.clone(),
    ));

    let cancelled = wait_or_shutdown(TRANSPORT_DURATION, &mut shutdown).await;
    stop_monitoring.store(true, Ordering::Relaxed);
    let _ = vitals_task.await;

    active.remove(dispatch_id);

    if cancelled {
        channel.close(200, "workflow cancelled").await.ok();
        return Ok(());
    }

    publish_dispatch_event(
        &channel,
        &exchange_name,
        &app_id,
        incident_id,
        dispatch_id,
        &patient_id,
        &unit_id,
        hospital_id,
        DispatchStatus::ArrivedAtHospital,
        None,
    )
    .await?;

    channel.close(200, "workflow complete").await.ok();
    Ok(())
}

/// Sleep for `duration` unless shutdown fires first. Returns `true` if
/// shutdown interrupted the wait.
async fn wait_or_shutdown(duration: Duration, shutdown: &mut tokio::sync::watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn publish_dispatch_event(
    channel: &Channel,
    exchange_name: &str,
    app_id: &str,
    incident_id: Uuid,
    dispatch_id: Uuid,
    patient_id: &str,
    unit_id: &str,
    hospital_id: Option<String>,
    status: DispatchStatus,
    eta_minutes: Option<u32>,
) -> anyhow::Result<()> {
    let event = DispatchEvent {
        incident_id,
        dispatch_id,
        patient_id: patient_id.to_string(),
        unit_id: unit_id.to_string(),
        hospital_id,
        status,
        eta_minutes,
        ts: Utc::now(),
    };
    publish_json(channel, exchange_name, status.routing_key(), &event, incident_id, "DispatchEvent", app_id).await?;
    Ok(())
}
