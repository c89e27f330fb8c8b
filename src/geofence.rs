//! Geofence evaluation for electronic visit verification.
//!
//! Great-circle distance on a spherical Earth. Pure and total over finite
//! coordinates; no I/O.

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Accepted EVV tolerance between the caregiver and the visit site.
pub const DEFAULT_RADIUS_METERS: f64 = 150.0;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        distance_meters(self.lat, self.lon, other.lat, other.lon)
    }
}

/// Haversine distance in meters between two coordinates.
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push `a` a hair past 1.0 for antipodal points.
    let c = 2.0 * a.sqrt().min(1.0).asin();

    EARTH_RADIUS_METERS * c
}

/// True iff the user is within `radius_meters` of the target (inclusive).
pub fn within_radius(
    user_lat: f64,
    user_lon: f64,
    target_lat: f64,
    target_lon: f64,
    radius_meters: f64,
) -> bool {
    distance_meters(user_lat, user_lon, target_lat, target_lon) <= radius_meters
}
