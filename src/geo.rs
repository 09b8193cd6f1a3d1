// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Geographic primitives: validated coordinates and great-circle math.

use crate::error::Error;

use serde::{Deserialize, Serialize};

use std::fmt;

/// A coordinate component in degrees.
pub type GpsCoordinate = f64;

/// A great-circle distance in kilometers.
pub type Distance = f64;

/// Mean Earth radius used for all distance calculations.
pub(crate) const EARTH_RADIUS_KM: f64 = 6371.0;

/// A validated geographic position.
///
/// Latitude is bounded to `[-90, 90]`, longitude to `[-180, 180]`;
/// construction with anything else fails.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGpsLocation", into = "RawGpsLocation")]
pub struct GpsLocation {
    latitude: GpsCoordinate,
    longitude: GpsCoordinate,
}

#[derive(Serialize, Deserialize)]
struct RawGpsLocation {
    latitude: f64,
    longitude: f64,
}

impl GpsLocation {
    /// Creates a new location, validating the coordinate ranges.
    pub fn new(latitude: GpsCoordinate, longitude: GpsCoordinate) -> Result<Self, Error> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::InvalidValue(format!("latitude out of range: {}", latitude)));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::InvalidValue(format!("longitude out of range: {}", longitude)));
        }

        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> GpsCoordinate {
        self.latitude
    }

    pub fn longitude(&self) -> GpsCoordinate {
        self.longitude
    }
}

impl TryFrom<RawGpsLocation> for GpsLocation {
    type Error = Error;

    fn try_from(raw: RawGpsLocation) -> Result<Self, Self::Error> {
        GpsLocation::new(raw.latitude, raw.longitude)
    }
}

impl From<GpsLocation> for RawGpsLocation {
    fn from(loc: GpsLocation) -> Self {
        Self {
            latitude: loc.latitude,
            longitude: loc.longitude,
        }
    }
}

impl fmt::Display for GpsLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// Great-circle distance between two locations (haversine formula).
pub fn distance_km(a: &GpsLocation, b: &GpsLocation) -> Distance {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Initial bearing from `from` towards `to`, in degrees `[0, 360)`.
pub(crate) fn bearing_deg(from: &GpsLocation, to: &GpsLocation) -> f64 {
    let lat_a = from.latitude.to_radians();
    let lat_b = to.latitude.to_radians();
    let d_lon = (to.longitude - from.longitude).to_radians();

    let y = d_lon.sin() * lat_b.cos();
    let x = lat_a.cos() * lat_b.sin() - lat_a.sin() * lat_b.cos() * d_lon.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// The point reached by travelling `distance` km from `origin` along the
/// given initial bearing. Used to aim discovery probes at uncovered areas.
pub(crate) fn destination(origin: &GpsLocation, bearing: f64, distance: Distance) -> GpsLocation {
    let delta = distance / EARTH_RADIUS_KM;
    let theta = bearing.to_radians();
    let lat = origin.latitude.to_radians();
    let lon = origin.longitude.to_radians();

    let dst_lat = (lat.sin() * delta.cos() + lat.cos() * delta.sin() * theta.cos()).asin();
    let dst_lon = lon
        + (theta.sin() * delta.sin() * lat.cos())
            .atan2(delta.cos() - lat.sin() * dst_lat.sin());

    // Normalize the longitude to [-180, 180].
    let dst_lon_deg = (dst_lon.to_degrees() + 540.0) % 360.0 - 180.0;
    let dst_lat_deg = dst_lat.to_degrees().clamp(-90.0, 90.0);

    // PANIC: both components were normalized into their valid ranges.
    GpsLocation::new(dst_lat_deg, dst_lon_deg).unwrap()
}
