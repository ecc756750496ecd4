//! Hospital selection: haversine distance, capacity/severity scoring, and
//! the local-table-first, places-API-fallback lookup chain (spec §4.4).

use async_trait::async_trait;
use incident_proto::Location;
use serde::Deserialize;

const EARTH_RADIUS_KM: f64 = 6371.0;
const AMBULANCE_SPEED_KMPH: f64 = 50.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Hospital {
    pub id: String,
    pub name: String,
    pub location: Location,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHospital {
    pub hospital: Hospital,
    pub distance_km: f64,
    pub score: f64,
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: Location, b: Location) -> f64 {
    let (phi1, phi2) = (a.lat.to_radians(), b.lat.to_radians());
    let dphi = (b.lat - a.lat).to_radians();
    let dlambda = (b.lng - a.lng).to_radians();
    let x = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * x.sqrt().atan2((1.0 - x).sqrt())
}

pub fn eta_minutes(distance_km: f64) -> u32 {
    (distance_km / AMBULANCE_SPEED_KMPH * 60.0).ceil().max(1.0) as u32
}

fn score(distance_km: f64, capacity: u32, severity: i32) -> f64 {
    let capacity_penalty = (5_i32.saturating_sub(capacity as i32)).max(0) as f64 * 0.5;
    distance_km + capacity_penalty - severity as f64 * 0.1
}

/// Pick the minimum-score hospital from a non-empty local table. Ties break
/// by iteration order (first minimal element wins, matching `Iterator::min_by`).
pub fn select_from_table(hospitals: &[Hospital], patient: Location, severity: i32) -> Option<ScoredHospital> {
    hospitals
        .iter()
        .map(|h| {
            let distance_km = haversine_km(patient, h.location);
            ScoredHospital {
                hospital: h.clone(),
                distance_km,
                score: score(distance_km, h.capacity, severity),
            }
        })
        .min_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
}

// ─── Local hospital table ──────────────────────────────────────────────────────

#[async_trait]
pub trait HospitalDirectory: Send + Sync {
    async fn list(&self) -> anyhow::Result<Vec<Hospital>>;
}

pub struct PostgresHospitalDirectory {
    pool: sqlx::PgPool,
}

impl PostgresHospitalDirectory {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HospitalDirectory for PostgresHospitalDirectory {
    async fn list(&self) -> anyhow::Result<Vec<Hospital>> {
        let rows = sqlx::query_as::<_, HospitalRow>("SELECT id, name, lat, lng, capacity FROM hospitals")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(HospitalRow::into_hospital).collect())
    }
}

#[derive(sqlx::FromRow)]
struct HospitalRow {
    id: String,
    name: String,
    lat: f64,
    lng: f64,
    capacity: i32,
}

impl HospitalRow {
    fn into_hospital(self) -> Hospital {
        Hospital {
            id: self.id,
            name: self.name,
            location: Location { lat: self.lat, lng: self.lng },
            capacity: self.capacity.max(0) as u32,
        }
    }
}

pub struct InMemoryHospitalDirectory {
    hospitals: Vec<Hospital>,
}

impl InMemoryHospitalDirectory {
    pub fn new(hospitals: Vec<Hospital>) -> Self {
        Self { hospitals }
    }
}

#[async_trait]
impl HospitalDirectory for InMemoryHospitalDirectory {
    async fn list(&self) -> anyhow::Result<Vec<Hospital>> {
        Ok(self.hospitals.clone())
    }
}

// ─── Places API fallback ───────────────────────────────────────────────────────

/// Queried only when the local table is empty (spec §4.4).
#[async_trait]
pub trait PlacesApiFallback: Send + Sync {
    async fn nearest_hospital(&self, patient: Location) -> anyhow::Result<Option<ScoredHospital>>;
}

pub struct GooglePlacesFallback {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GooglePlacesFallback {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlacesResponse {
    status: String,
    #[serde(default)]
    results: Vec<PlacesResult>,
}

#[derive(Debug, Deserialize)]
struct PlacesResult {
    place_id: String,
    name: String,
    geometry: PlacesGeometry,
}

#[derive(Debug, Deserialize)]
struct PlacesGeometry {
    location: PlacesLocation,
}

#[derive(Debug, Deserialize)]
struct PlacesLocation {
    lat: f64,
    lng: f64,
}

#[async_trait]
impl PlacesApiFallback for GooglePlacesFallback {
    async fn nearest_hospital(&self, patient: Location) -> anyhow::Result<Option<ScoredHospital>> {
        let url = format!("{}/nearbysearch/json", self.base_url);
        let response: PlacesResponse = self
            .client
            .get(&url)
            .query(&[
                ("location", format!("{},{}", patient.lat, patient.lng)),
                ("radius", "5000".to_string()),
                ("type", "hospital".to_string()),
                ("key", self.api_key.clone()),
            ])
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?
            .json()
            .await?;

        if response.status != "OK" {
            return Ok(None);
        }

        Ok(response
            .results
            .into_iter()
            .map(|r| {
                let location = Location { lat: r.geometry.location.lat, lng: r.geometry.location.lng };
                let distance_km = haversine_km(patient, location);
                ScoredHospital {
                    hospital: Hospital { id: r.place_id, name: r.name, location, capacity: 0 },
                    distance_km,
                    score: distance_km,
                }
            })
            .min_by(|a, b| a.distance_km.partial_cmp(&b.distance_km).unwrap_or(std::cmp::Ordering::Equal)))
    }
}

/// Resolve a hospital for a patient location: local table first, then the
/// places-API fallback if the table is empty. `None` means the request
/// cannot be fulfilled at all.
pub async fn resolve_hospital(
    directory: &dyn HospitalDirectory,
    fallback: &dyn PlacesApiFallback,
    patient: Location,
    severity: i32,
) -> anyhow::Result<Option<ScoredHospital>> {
    let hospitals = directory.list().await?;
    if !hospitals.is_empty() {
        return Ok(select_from_table(&hospitals, patient, severity));
    }
    fallback.nearest_hospital(patient).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(lat: f64, lng: f64) -> Location {
        Location { lat, lng }
    }

    #[test]
    fn haversine_is_zero_for_identical_points() {
        assert!(haversine_km(loc(51.5, -0.1), loc(51.5, -0.1)) < 1e-9);
    }

    #[test]
    fn haversine_matches_known_distance() {
        // London to Paris is roughly 344 km.
        let london = loc(51.5074, -0.1278);
        let paris = loc(48.8566, 2.3522);
        let distance = haversine_km(london, paris);
        assert!((300.0..400.0).contains(&distance), "distance was {distance}");
    }

    #[test]
    fn eta_rounds_up_and_floors_at_one_minute() {
        assert_eq!(eta_minutes(0.01), 1);
        assert_eq!(eta_minutes(50.0), 60);
    }

    fn hospital(id: &str, lat: f64, lng: f64, capacity: u32) -> Hospital {
        Hospital { id: id.to_string(), name: id.to_string(), location: loc(lat, lng), capacity }
    }

    #[test]
    fn prefers_closer_hospital_all_else_equal() {
        let patient = loc(0.0, 0.0);
        let hospitals = vec![hospital("far", 1.0, 1.0, 5), hospital("near", 0.01, 0.01, 5)];
        let picked = select_from_table(&hospitals, patient, 1).unwrap();
        assert_eq!(picked.hospital.id, "near");
    }

    #[test]
    fn low_capacity_penalty_can_flip_the_choice() {
        let patient = loc(0.0, 0.0);
        // "near" is closer but has zero capacity (penalty 2.5); "far" has
        // full capacity (penalty 0) and is only slightly further away.
        let hospitals = vec![
            hospital("near", 0.005, 0.005, 0),
            hospital("far", 0.02, 0.02, 5),
        ];
        let picked = select_from_table(&hospitals, patient, 1).unwrap();
        assert_eq!(picked.hospital.id, "far");
    }

    #[test]
    fn ties_break_by_iteration_order() {
        let patient = loc(0.0, 0.0);
        let hospitals = vec![hospital("first", 0.01, 0.0, 5), hospital("second", 0.01, 0.0, 5)];
        let picked = select_from_table(&hospitals, patient, 1).unwrap();
        assert_eq!(picked.hospital.id, "first");
    }

    #[test]
    fn empty_table_returns_none() {
        assert!(select_from_table(&[], loc(0.0, 0.0), 1).is_none());
    }
}
