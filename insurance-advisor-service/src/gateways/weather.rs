//! AEMET (Spanish state meteorological agency) open-data gateway.
//!
//! Every AEMET endpoint answers in two steps: the first request returns a small
//! envelope whose `datos` field points at the real payload, which is then
//! fetched with a second GET. [`WeatherGateway`] sits on top and never fails:
//! when a lookup goes wrong its fields carry the [`NO_DATA`] sentinel and the
//! reason is logged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use prompt_flow::Coordinates;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_AEMET_BASE_URL: &str = "https://opendata.aemet.es/opendata/api";

/// Substituted for any weather value that could not be obtained.
pub const NO_DATA: &str = "No data";

/// Days of forecast kept in a snapshot.
const FORECAST_DAYS: usize = 3;

#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_AEMET_BASE_URL.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum WeatherError {
    #[error("AEMET_API_KEY environment variable is not set")]
    MissingKey,
    #[error("weather request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },
    #[error("weather API returned {status} for {endpoint}")]
    Status { endpoint: String, status: u16 },
    #[error("weather API response for {0} has no data pointer")]
    MissingPointer(String),
    #[error("weather payload for {endpoint} is not valid JSON: {reason}")]
    Payload { endpoint: String, reason: String },
}

/// Raw AEMET lookups.
#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// Latest conventional observations from every station.
    async fn observations(&self) -> Result<Value, WeatherError>;
    /// Daily forecast for an INE municipality code, e.g. `28079` for Madrid.
    async fn forecast(&self, municipality: &str) -> Result<Value, WeatherError>;
    /// Daily climatological values for one IDEMA station.
    async fn climatology(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        station: &str,
    ) -> Result<Value, WeatherError>;
}

#[derive(Deserialize)]
struct DataPointer {
    estado: Option<u16>,
    datos: Option<String>,
}

pub struct AemetClient {
    http: reqwest::Client,
    config: WeatherConfig,
}

impl AemetClient {
    pub fn new(config: WeatherConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn fetch(&self, endpoint: &str) -> Result<Value, WeatherError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(WeatherError::MissingKey)?;
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let request_error = |e: reqwest::Error| WeatherError::Request {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        };

        let response = self
            .http
            .get(&url)
            .header("api_key", api_key)
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(WeatherError::Status {
                endpoint: endpoint.to_string(),
                status: response.status().as_u16(),
            });
        }

        let pointer: DataPointer = response.json().await.map_err(request_error)?;
        if let Some(status) = pointer.estado.filter(|s| *s != 200) {
            return Err(WeatherError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }
        let data_url = pointer
            .datos
            .ok_or_else(|| WeatherError::MissingPointer(endpoint.to_string()))?;

        let payload = self
            .http
            .get(&data_url)
            .send()
            .await
            .map_err(request_error)?;
        if !payload.status().is_success() {
            return Err(WeatherError::Status {
                endpoint: endpoint.to_string(),
                status: payload.status().as_u16(),
            });
        }
        let body = payload.bytes().await.map_err(request_error)?;
        decode_payload(&body).map_err(|e| WeatherError::Payload {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }
}

/// AEMET payloads are often ISO-8859-15 rather than UTF-8.
fn decode_payload(body: &[u8]) -> serde_json::Result<Value> {
    match std::str::from_utf8(body) {
        Ok(text) => serde_json::from_str(text),
        Err(_) => {
            let (text, _) = encoding_rs::ISO_8859_15.decode_without_bom_handling(body);
            serde_json::from_str(&text)
        }
    }
}

#[async_trait]
impl WeatherSource for AemetClient {
    async fn observations(&self) -> Result<Value, WeatherError> {
        self.fetch("observacion/convencional/todas").await
    }

    async fn forecast(&self, municipality: &str) -> Result<Value, WeatherError> {
        let endpoint = format!(
            "prediccion/especifica/municipio/diaria/{}",
            urlencoding::encode(municipality)
        );
        self.fetch(&endpoint).await
    }

    async fn climatology(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        station: &str,
    ) -> Result<Value, WeatherError> {
        let endpoint = format!(
            "valores/climatologicos/diarios/datos/fechaini/{}/fechafin/{}/estacion/{}",
            start.format("%Y-%m-%dT00:00:00UTC"),
            end.format("%Y-%m-%dT23:59:59UTC"),
            urlencoding::encode(station)
        );
        self.fetch(&endpoint).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireRisk {
    Low,
    Moderate,
    High,
    Extreme,
}

impl FireRisk {
    /// Score temperature (°C), relative humidity (%) and wind (m/s); rain damps it.
    pub fn assess(temperature_c: f64, humidity_pct: f64, wind_ms: f64, rain_mm: f64) -> Self {
        let mut score = 0i32;
        score += match temperature_c {
            t if t >= 35.0 => 3,
            t if t >= 30.0 => 2,
            t if t >= 25.0 => 1,
            _ => 0,
        };
        score += match humidity_pct {
            h if h <= 20.0 => 3,
            h if h <= 30.0 => 2,
            h if h <= 45.0 => 1,
            _ => 0,
        };
        score += match wind_ms {
            w if w >= 10.0 => 2,
            w if w >= 6.0 => 1,
            _ => 0,
        };
        if rain_mm > 0.0 {
            score -= 2;
        }

        match score {
            s if s <= 1 => FireRisk::Low,
            s if s <= 3 => FireRisk::Moderate,
            s if s <= 5 => FireRisk::High,
            _ => FireRisk::Extreme,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FireRisk::Low => "low",
            FireRisk::Moderate => "moderate",
            FireRisk::High => "high",
            FireRisk::Extreme => "extreme",
        }
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

fn station_coordinates(observation: &Value) -> Option<Coordinates> {
    Some(Coordinates {
        lat: observation.get("lat")?.as_f64()?,
        lon: observation.get("lon")?.as_f64()?,
    })
}

/// The observation closest to `target`; the latest reading wins among equals.
fn nearest_observation(observations: &Value, target: Coordinates) -> Option<(&Value, f64)> {
    let mut best: Option<(&Value, f64)> = None;
    for observation in observations.as_array()? {
        let Some(position) = station_coordinates(observation) else {
            continue;
        };
        let distance = haversine_km(target, position);
        let better = match best {
            None => true,
            Some((current, current_distance)) => {
                distance < current_distance
                    || (distance == current_distance
                        && observation["fint"].as_str() > current["fint"].as_str())
            }
        };
        if better {
            best = Some((observation, distance));
        }
    }
    best
}

fn field_or_sentinel(observation: &Value, key: &str) -> Value {
    match observation.get(key) {
        Some(value) if !value.is_null() => value.clone(),
        _ => json!(NO_DATA),
    }
}

/// First few forecast days, or the whole payload when its shape is unexpected.
fn condense_forecast(payload: Value) -> Value {
    let days = payload
        .get(0)
        .and_then(|entry| entry.pointer("/prediccion/dia"))
        .and_then(Value::as_array)
        .map(|days| days.iter().take(FORECAST_DAYS).cloned().collect::<Vec<_>>());
    match days {
        Some(days) => Value::Array(days),
        None => payload,
    }
}

/// Semantic weather view consumed by the prompt pipeline.
#[derive(Clone)]
pub struct WeatherGateway {
    source: Arc<dyn WeatherSource>,
}

impl WeatherGateway {
    pub fn new(source: Arc<dyn WeatherSource>) -> Self {
        Self { source }
    }

    /// Weather around `location`. Never fails; unavailable values read [`NO_DATA`].
    pub async fn snapshot(
        &self,
        location: Coordinates,
        municipality: Option<&str>,
    ) -> Map<String, Value> {
        let mut snapshot = Map::new();

        match self.source.observations().await {
            Ok(observations) => match nearest_observation(&observations, location) {
                Some((observation, distance)) => {
                    info!(
                        station = ?observation.get("idema"),
                        distance_km = distance,
                        "Nearest weather station selected"
                    );
                    snapshot.insert("region".into(), field_or_sentinel(observation, "ubi"));
                    snapshot.insert("station".into(), field_or_sentinel(observation, "idema"));
                    snapshot.insert("distance_km".into(), json!((distance * 10.0).round() / 10.0));
                    snapshot.insert("observed_at".into(), field_or_sentinel(observation, "fint"));
                    snapshot.insert("rain_mm".into(), field_or_sentinel(observation, "prec"));
                    snapshot.insert("temperature_c".into(), field_or_sentinel(observation, "ta"));
                    snapshot.insert("humidity_pct".into(), field_or_sentinel(observation, "hr"));
                    snapshot.insert("wind_speed_ms".into(), field_or_sentinel(observation, "vv"));
                    let fire_risk = match (
                        observation["ta"].as_f64(),
                        observation["hr"].as_f64(),
                        observation["vv"].as_f64(),
                    ) {
                        (Some(t), Some(h), Some(w)) => {
                            let rain = observation["prec"].as_f64().unwrap_or(0.0);
                            json!(FireRisk::assess(t, h, w, rain).as_str())
                        }
                        _ => json!(NO_DATA),
                    };
                    snapshot.insert("fire_risk".into(), fire_risk);
                }
                None => {
                    warn!("No weather station with coordinates in observations");
                    insert_observation_sentinels(&mut snapshot);
                    snapshot.insert(
                        "observation_error".into(),
                        json!("No station observations available"),
                    );
                }
            },
            Err(e) => {
                warn!(error = %e, "Weather observations unavailable");
                insert_observation_sentinels(&mut snapshot);
                snapshot.insert("observation_error".into(), json!(e.to_string()));
            }
        }

        let forecast = match municipality {
            Some(code) => match self.source.forecast(code).await {
                Ok(payload) => condense_forecast(payload),
                Err(e) => {
                    warn!(municipality = %code, error = %e, "Weather forecast unavailable");
                    snapshot.insert("forecast_error".into(), json!(e.to_string()));
                    json!(NO_DATA)
                }
            },
            None => json!(NO_DATA),
        };
        snapshot.insert("forecast".into(), forecast);

        snapshot
    }

    /// Climatological series for a station, or the sentinel plus the failure reason.
    pub async fn climatology(&self, start: NaiveDate, end: NaiveDate, station: &str) -> Value {
        match self.source.climatology(start, end, station).await {
            Ok(data) => data,
            Err(e) => {
                warn!(station = %station, error = %e, "Climatological data unavailable");
                json!({ "data": NO_DATA, "error": e.to_string() })
            }
        }
    }
}

fn insert_observation_sentinels(snapshot: &mut Map<String, Value>) {
    for key in [
        "region",
        "station",
        "observed_at",
        "rain_mm",
        "temperature_c",
        "humidity_pct",
        "wind_speed_ms",
        "fire_risk",
    ] {
        snapshot.insert(key.into(), json!(NO_DATA));
    }
}
