//! Delivery routing helpers: polyline geometry, distance and ETA
//! arithmetic, and the Mapbox Directions lookup used by delivery tracking.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::api::{friendly_error, http_error, normalize_base_url};
use crate::config::ClientConfig;
use crate::error::ApiError;

pub const MAPBOX_BASE_URL: &str = "https://api.mapbox.com";
/// Precision of the `polyline6` geometry requested from Mapbox.
pub const MAPBOX_PRECISION: u32 = 6;
const EARTH_RADIUS_M: f64 = 6_371_008.8;
const DIRECTIONS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolylineError {
    #[error("unsupported polyline precision {0}")]
    Precision(u32),
    #[error("invalid polyline character {found:?} at byte {at}")]
    InvalidChar { found: char, at: usize },
    #[error("polyline ends in the middle of a coordinate")]
    Truncated,
    #[error("polyline coordinate out of range")]
    Overflow,
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

fn next_value(bytes: &[u8], pos: &mut usize) -> Result<i64, PolylineError> {
    let mut result: i64 = 0;
    let mut shift = 0;
    loop {
        let Some(&byte) = bytes.get(*pos) else {
            return Err(PolylineError::Truncated);
        };
        if !(63..=126).contains(&byte) || shift > 60 {
            return Err(PolylineError::InvalidChar {
                found: byte as char,
                at: *pos,
            });
        }
        *pos += 1;
        let chunk = i64::from(byte - 63);
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
    }
    Ok(if result & 1 == 1 {
        !(result >> 1)
    } else {
        result >> 1
    })
}

/// Decode an encoded polyline at precision 5 (Google) or 6 (Mapbox
/// `polyline6`).
pub fn decode_polyline(encoded: &str, precision: u32) -> Result<Vec<Coordinate>, PolylineError> {
    if !(5..=6).contains(&precision) {
        return Err(PolylineError::Precision(precision));
    }
    let factor = 10f64.powi(precision as i32);
    let bytes = encoded.as_bytes();
    let mut pos = 0;
    let (mut lat, mut lng) = (0i64, 0i64);
    let mut points = Vec::new();

    while pos < bytes.len() {
        lat = lat
            .checked_add(next_value(bytes, &mut pos)?)
            .ok_or(PolylineError::Overflow)?;
        lng = lng
            .checked_add(next_value(bytes, &mut pos)?)
            .ok_or(PolylineError::Overflow)?;
        points.push(Coordinate::new(lat as f64 / factor, lng as f64 / factor));
    }
    Ok(points)
}

/// Great-circle distance in metres.
pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

pub fn path_length_m(path: &[Coordinate]) -> f64 {
    path.windows(2).map(|w| haversine_m(w[0], w[1])).sum()
}

// ---------------------------------------------------------------------------
// Routes and ETA
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub geometry: Vec<Coordinate>,
    pub distance_m: f64,
    pub duration_s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Remaining {
    pub distance_m: f64,
    pub duration_s: f64,
}

/// What is left of `route` for a driver at `position`.
///
/// The driver is snapped to the nearest geometry vertex; the route's own
/// distance and duration are scaled by the share of geometry still ahead.
pub fn remaining_on_route(route: &Route, position: Coordinate) -> Remaining {
    let Some((nearest, _)) = route
        .geometry
        .iter()
        .enumerate()
        .map(|(i, p)| (i, haversine_m(position, *p)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
    else {
        return Remaining {
            distance_m: route.distance_m,
            duration_s: route.duration_s,
        };
    };

    let total = path_length_m(&route.geometry);
    if total <= 0.0 {
        return Remaining {
            distance_m: 0.0,
            duration_s: 0.0,
        };
    }
    let share = path_length_m(&route.geometry[nearest..]) / total;
    Remaining {
        distance_m: route.distance_m * share,
        duration_s: route.duration_s * share,
    }
}

pub fn estimate_arrival(route: &Route, position: Coordinate, now: DateTime<Utc>) -> DateTime<Utc> {
    let remaining = remaining_on_route(route, position);
    now + ChronoDuration::milliseconds((remaining.duration_s * 1000.0).round() as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RouteComparison {
    KeepCurrent,
    Switch { saved_s: f64 },
}

/// Suggest a reroute only when it saves at least `min_saving_s`.
pub fn compare_routes(current: &Route, candidate: &Route, min_saving_s: f64) -> RouteComparison {
    let saved_s = current.duration_s - candidate.duration_s;
    if saved_s >= min_saving_s && saved_s > 0.0 {
        RouteComparison::Switch { saved_s }
    } else {
        RouteComparison::KeepCurrent
    }
}

// ---------------------------------------------------------------------------
// Mapbox Directions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    geometry: String,
    distance: f64,
    duration: f64,
}

pub struct DirectionsClient {
    client: Client,
    base_url: String,
    access_token: String,
}

impl DirectionsClient {
    pub fn new(access_token: &str, base_url: &str) -> Result<Self, ApiError> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(ApiError::Config("maps access token is not configured".into()));
        }
        let client = Client::builder()
            .timeout(DIRECTIONS_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            access_token: access_token.to_string(),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        let token = config.maps_access_token.as_deref().unwrap_or_default();
        Self::new(token, MAPBOX_BASE_URL)
    }

    /// Fastest driving route from `from` to `to`.
    pub async fn driving_route(&self, from: Coordinate, to: Coordinate) -> Result<Route, ApiError> {
        let url = format!(
            "{}/directions/v5/mapbox/driving/{:.6},{:.6};{:.6},{:.6}",
            self.base_url, from.lng, from.lat, to.lng, to.lat
        );
        debug!(url = %url, "directions request");

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("access_token", self.access_token.as_str()),
                ("geometries", "polyline6"),
                ("overview", "full"),
            ])
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        if !status.is_success() {
            return Err(http_error(status, &body));
        }

        let parsed: DirectionsResponse = serde_json::from_str(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("Invalid directions response: {e}")))?;
        if parsed.code != "Ok" {
            return Err(ApiError::InvalidResponse(format!(
                "directions lookup failed: {}",
                parsed.message.unwrap_or(parsed.code)
            )));
        }
        let Some(best) = parsed.routes.into_iter().next() else {
            return Err(ApiError::InvalidResponse("no route found".into()));
        };
        let geometry = decode_polyline(&best.geometry, MAPBOX_PRECISION)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(Route {
            geometry,
            distance_m: best.distance,
            duration_s: best.duration,
        })
    }
}
