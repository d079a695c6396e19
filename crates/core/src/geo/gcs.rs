//! Geographic coordinate system definitions and the reprojection seam.
//!
//! Full geodetic math lives behind the [`Reprojection`] trait. The bundled
//! [`TangentPlaneReprojection`] models each coordinate system as a local
//! tangent plane anchored at a geographic origin, which is accurate over the
//! extent of a typical project and deterministic across runs.

use serde::{Deserialize, Serialize};

use super::transform::Point3d;
use crate::errors::GeoError;

/// Mean equatorial radius used by the tangent-plane approximation, in meters.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// A geographic position in degrees and meters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
}

/// A coordinate system attached to a source document or target repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gcs {
    /// Display name (e.g. `"EPSG:2263"` or a custom label).
    pub name: String,
    /// Datum the geographic origin is expressed in.
    #[serde(default = "default_datum")]
    pub datum: String,
    /// Geographic position of `false_origin`.
    pub origin: GeoPoint,
    /// Clockwise angle from true north to the local +Y axis, in degrees.
    #[serde(default)]
    pub azimuth_deg: f64,
    /// Length of one storage unit in meters.
    #[serde(default = "default_meters_per_unit")]
    pub meters_per_unit: f64,
    /// Local coordinates of the geographic origin, in storage units.
    #[serde(default)]
    pub false_origin: Point3d,
}

fn default_datum() -> String {
    "WGS84".into()
}
fn default_meters_per_unit() -> f64 {
    1.0
}

impl Gcs {
    pub fn validate(&self) -> Result<(), GeoError> {
        if !(self.meters_per_unit.is_finite() && self.meters_per_unit > 0.0) {
            return Err(GeoError::InvalidGcs {
                name: self.name.clone(),
                detail: format!("meters_per_unit must be > 0, got {}", self.meters_per_unit),
            });
        }
        if self.origin.latitude.abs() >= 90.0 {
            return Err(GeoError::InvalidGcs {
                name: self.name.clone(),
                detail: "origin latitude must be strictly between -90 and 90".into(),
            });
        }
        Ok(())
    }
}

/// Explicit placement used when a source document carries no coordinate
/// system of its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputGcsDefinition {
    /// Local point (storage units) that sits at the geographic position.
    #[serde(default)]
    pub origin: Point3d,
    #[serde(default)]
    pub azimuth_deg: f64,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation: f64,
    #[serde(default = "default_datum")]
    pub datum: String,
    #[serde(default = "default_meters_per_unit")]
    pub meters_per_unit: f64,
}

impl InputGcsDefinition {
    pub fn to_gcs(&self) -> Gcs {
        Gcs {
            name: "input-definition".into(),
            datum: self.datum.clone(),
            origin: GeoPoint {
                latitude: self.latitude,
                longitude: self.longitude,
                elevation: self.elevation,
            },
            azimuth_deg: self.azimuth_deg,
            meters_per_unit: self.meters_per_unit,
            false_origin: self.origin,
        }
    }
}

/// Converts between local coordinates of a [`Gcs`] and WGS84 geographic
/// positions.
pub trait Reprojection: Send + Sync {
    /// Local storage-unit coordinates to WGS84.
    fn to_geographic(&self, gcs: &Gcs, local: &Point3d) -> Result<GeoPoint, GeoError>;

    /// WGS84 to local storage-unit coordinates.
    fn from_geographic(&self, gcs: &Gcs, geo: &GeoPoint) -> Result<Point3d, GeoError>;
}

/// Local tangent-plane reprojection with a small table of datum offsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TangentPlaneReprojection;

impl TangentPlaneReprojection {
    /// Offset (degrees latitude, degrees longitude, meters) that converts a
    /// position in `datum` to WGS84.
    fn datum_shift(datum: &str) -> Result<(f64, f64, f64), GeoError> {
        match datum.to_ascii_uppercase().as_str() {
            "WGS84" | "WGS-84" | "NAD83" | "ETRS89" | "GRS80" => Ok((0.0, 0.0, 0.0)),
            "NAD27" => Ok((0.000_09, -0.000_41, -0.8)),
            "OSGB36" => Ok((0.000_45, -0.001_05, 46.0)),
            "ED50" => Ok((-0.000_85, -0.000_95, 2.5)),
            other => Err(GeoError::InvalidGcs {
                name: other.to_string(),
                detail: "unknown datum".into(),
            }),
        }
    }
}

impl Reprojection for TangentPlaneReprojection {
    fn to_geographic(&self, gcs: &Gcs, local: &Point3d) -> Result<GeoPoint, GeoError> {
        gcs.validate()?;
        let meters = local.sub(&gcs.false_origin).scale(gcs.meters_per_unit);
        let (s, c) = gcs.azimuth_deg.to_radians().sin_cos();
        let east = meters.x * c + meters.y * s;
        let north = -meters.x * s + meters.y * c;

        let lat0 = gcs.origin.latitude.to_radians();
        let latitude = gcs.origin.latitude + (north / EARTH_RADIUS_M).to_degrees();
        let longitude = gcs.origin.longitude + (east / (EARTH_RADIUS_M * lat0.cos())).to_degrees();
        let elevation = gcs.origin.elevation + meters.z;

        let (dlat, dlon, dh) = Self::datum_shift(&gcs.datum)?;
        Ok(GeoPoint {
            latitude: latitude + dlat,
            longitude: longitude + dlon,
            elevation: elevation + dh,
        })
    }

    fn from_geographic(&self, gcs: &Gcs, geo: &GeoPoint) -> Result<Point3d, GeoError> {
        gcs.validate()?;
        let (dlat, dlon, dh) = Self::datum_shift(&gcs.datum)?;
        let latitude = geo.latitude - dlat;
        let longitude = geo.longitude - dlon;
        let elevation = geo.elevation - dh;

        let lat0 = gcs.origin.latitude.to_radians();
        let north = (latitude - gcs.origin.latitude).to_radians() * EARTH_RADIUS_M;
        let east = (longitude - gcs.origin.longitude).to_radians() * EARTH_RADIUS_M * lat0.cos();
        let up = elevation - gcs.origin.elevation;

        let (s, c) = gcs.azimuth_deg.to_radians().sin_cos();
        let x = east * c - north * s;
        let y = east * s + north * c;
        if !(x.is_finite() && y.is_finite() && up.is_finite()) {
            return Err(GeoError::Reprojection(format!(
                "non-finite result projecting into '{}'",
                gcs.name
            )));
        }
        Ok(Point3d::new(x, y, up)
            .scale(1.0 / gcs.meters_per_unit)
            .add(&gcs.false_origin))
    }
}
