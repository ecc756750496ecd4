//! `GET /health` for every incident pipeline service.
//!
//! Each binary owns a [`HealthState`], flips its flags as its dependencies
//! come up or drop, and mounts [`router`] alongside its consumer loop —
//! the same "HTTP server running in parallel with the consumer" shape
//! spec §5 describes.

#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::{Map, Value};
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Degraded,
    Unhealthy,
}

/// Shared, mutable health state for one service process.
///
/// `broker_connected` and `extra_dependency` (DB for billing, nothing for
/// everything else) are the "critical dependencies" spec §6 names; any
/// false flips the endpoint to 503.
pub struct HealthState {
    pub service: &'static str,
    broker_connected: std::sync::atomic::AtomicBool,
    extra_dependency: std::sync::atomic::AtomicBool,
    extra_dependency_label: Option<&'static str>,
}

impl HealthState {
    pub fn new(service: &'static str) -> Arc<Self> {
        Arc::new(Self {
            service,
            broker_connected: std::sync::atomic::AtomicBool::new(false),
            extra_dependency: std::sync::atomic::AtomicBool::new(true),
            extra_dependency_label: None,
        })
    }

    /// A service (billing) that also depends on a database.
    pub fn with_extra_dependency(service: &'static str, label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            service,
            broker_connected: std::sync::atomic::AtomicBool::new(false),
            extra_dependency: std::sync::atomic::AtomicBool::new(false),
            extra_dependency_label: Some(label),
        })
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected
            .store(connected, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn set_extra_dependency(&self, healthy: bool) {
        self.extra_dependency
            .store(healthy, std::sync::atomic::Ordering::Relaxed);
    }

    fn status(&self) -> Status {
        let broker_ok = self.broker_connected.load(std::sync::atomic::Ordering::Relaxed);
        let extra_ok = self.extra_dependency.load(std::sync::atomic::Ordering::Relaxed);
        match (broker_ok, extra_ok) {
            (true, true) => Status::Ok,
            (true, false) | (false, true) => Status::Degraded,
            (false, false) => Status::Unhealthy,
        }
    }

    fn body(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("status".to_string(), serde_json::to_value(self.status()).unwrap());
        map.insert("service".to_string(), Value::String(self.service.to_string()));
        map.insert(
            "broker_connected".to_string(),
            Value::Bool(self.broker_connected.load(std::sync::atomic::Ordering::Relaxed)),
        );
        if let Some(label) = self.extra_dependency_label {
            map.insert(
                label.to_string(),
                Value::Bool(self.extra_dependency.load(std::sync::atomic::Ordering::Relaxed)),
            );
        }
        map
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(
    axum::extract::State(state): axum::extract::State<Arc<HealthState>>,
) -> (axum::http::StatusCode, Json<Value>) {
    let code = match state.status() {
        Status::Ok => axum::http::StatusCode::OK,
        Status::Degraded | Status::Unhealthy => axum::http::StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(Value::Object(state.body())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_degrades_when_broker_down() {
        let state = HealthState::new("triage");
        assert_eq!(state.status(), Status::Unhealthy);
        state.set_broker_connected(true);
        assert_eq!(state.status(), Status::Ok);
    }

    #[test]
    fn billing_needs_both_broker_and_db() {
        let state = HealthState::with_extra_dependency("billing", "db_connected");
        assert_eq!(state.status(), Status::Unhealthy);
        state.set_broker_connected(true);
        assert_eq!(state.status(), Status::Degraded);
        state.set_extra_dependency(true);
        assert_eq!(state.status(), Status::Ok);
    }
}
