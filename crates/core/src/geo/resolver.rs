//! Resolution of the affine transform that carries source coordinates into
//! the target repository's coordinate system.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::gcs::{Gcs, InputGcsDefinition, Reprojection, TangentPlaneReprojection};
use super::transform::{AffineTransform, Point3d};
use crate::errors::GeoError;

/// Determinants below this are treated as a collapsed transform.
const DEGENERATE_EPSILON: f64 = 1e-12;

/// Strategy used to turn two coordinate systems into one affine transform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TransformMethod {
    /// Sample the reprojection at the source origin and fit an affine to it.
    #[serde(rename = "reprojection")]
    UseReprojection,
    /// Rigid rotation plus translation; scale is ignored.
    #[serde(rename = "gcs_transform")]
    UseGcsTransform,
    /// Rotation plus translation plus uniform scale.
    #[default]
    #[serde(rename = "gcs_transform_with_scaling")]
    UseGcsTransformWithScaling,
}

impl std::fmt::Display for TransformMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UseReprojection => write!(f, "reprojection"),
            Self::UseGcsTransform => write!(f, "gcs_transform"),
            Self::UseGcsTransformWithScaling => write!(f, "gcs_transform_with_scaling"),
        }
    }
}

/// Computes source-to-target transforms. Holds the reprojection backend.
#[derive(Clone)]
pub struct GeoTransformResolver {
    reprojection: Arc<dyn Reprojection>,
}

impl Default for GeoTransformResolver {
    fn default() -> Self {
        Self::new(Arc::new(TangentPlaneReprojection))
    }
}

impl std::fmt::Debug for GeoTransformResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoTransformResolver").finish_non_exhaustive()
    }
}

impl GeoTransformResolver {
    pub fn new(reprojection: Arc<dyn Reprojection>) -> Self {
        Self { reprojection }
    }

    /// The coordinate system a document is treated as having: its own, or
    /// the supplied input definition.
    pub fn effective_source_gcs(
        source: Option<&Gcs>,
        input: Option<&InputGcsDefinition>,
    ) -> Option<Gcs> {
        source.cloned().or_else(|| input.map(InputGcsDefinition::to_gcs))
    }

    /// Resolve the transform from a document's coordinates to the target's.
    ///
    /// Returns identity when either side has no coordinate system or both
    /// sides are the same system. Results are deterministic for equal inputs.
    pub fn resolve_transform(
        &self,
        source: Option<&Gcs>,
        input: Option<&InputGcsDefinition>,
        target: Option<&Gcs>,
        method: TransformMethod,
    ) -> Result<AffineTransform, GeoError> {
        let (Some(source), Some(target)) = (Self::effective_source_gcs(source, input), target)
        else {
            return Ok(AffineTransform::identity());
        };
        if &source == target {
            return Ok(AffineTransform::identity());
        }

        let origin = Point3d::ORIGIN;
        let unit_x = Point3d::new(1.0, 0.0, 0.0);
        let unit_y = Point3d::new(0.0, 1.0, 0.0);
        let unit_z = Point3d::new(0.0, 0.0, 1.0);

        let image = |p: &Point3d| -> Result<Point3d, GeoError> {
            let geo = self.reprojection.to_geographic(&source, p)?;
            self.reprojection.from_geographic(target, &geo)
        };

        let o = image(&origin)?;
        let x = image(&unit_x)?;

        let transform = match method {
            TransformMethod::UseReprojection => {
                let y = image(&unit_y)?;
                let z = image(&unit_z)?;
                AffineTransform::from_axis_images(o, x, y, z)
            }
            TransformMethod::UseGcsTransform | TransformMethod::UseGcsTransformWithScaling => {
                let axis = x.sub(&o);
                let angle = axis.y.atan2(axis.x);
                let scale = if method == TransformMethod::UseGcsTransform {
                    1.0
                } else {
                    (axis.x * axis.x + axis.y * axis.y).sqrt()
                };
                AffineTransform::rotation_z_scaled(angle, scale, o)
            }
        };

        let det = transform.determinant();
        if !det.is_finite() || det.abs() < DEGENERATE_EPSILON {
            return Err(GeoError::DegenerateTransform {
                from: source.name.clone(),
                to: target.name.clone(),
            });
        }

        debug!(
            from = %source.name,
            to = %target.name,
            %method,
            scale = transform.xy_scale(),
            rotation = transform.xy_rotation(),
            "resolved geographic transform"
        );
        Ok(transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::gcs::GeoPoint;

    fn gcs(name: &str, lat: f64, lon: f64, azimuth: f64, mpu: f64) -> Gcs {
        Gcs {
            name: name.into(),
            datum: "WGS84".into(),
            origin: GeoPoint {
                latitude: lat,
                longitude: lon,
                elevation: 0.0,
            },
            azimuth_deg: azimuth,
            meters_per_unit: mpu,
            false_origin: Point3d::ORIGIN,
        }
    }

    #[test]
    fn test_missing_gcs_is_identity() {
        let resolver = GeoTransformResolver::default();
        let target = gcs("target", 40.0, -75.0, 0.0, 1.0);
        let t = resolver
            .resolve_transform(None, None, Some(&target), TransformMethod::default())
            .unwrap();
        assert!(t.is_identity(0.0));

        let t = resolver
            .resolve_transform(Some(&target), None, None, TransformMethod::default())
            .unwrap();
        assert!(t.is_identity(0.0));
    }

    #[test]
    fn test_same_gcs_is_identity() {
        let resolver = GeoTransformResolver::default();
        let g = gcs("same", 40.0, -75.0, 10.0, 0.3048);
        let t = resolver
            .resolve_transform(Some(&g), None, Some(&g), TransformMethod::UseReprojection)
            .unwrap();
        assert!(t.is_identity(0.0));
    }

    #[test]
    fn test_scaling_method_carries_unit_ratio() {
        let resolver = GeoTransformResolver::default();
        let feet = gcs("feet", 40.0, -75.0, 0.0, 0.3048);
        let meters = gcs("meters", 40.0, -75.0, 0.0, 1.0);

        let scaled = resolver
            .resolve_transform(
                Some(&feet),
                None,
                Some(&meters),
                TransformMethod::UseGcsTransformWithScaling,
            )
            .unwrap();
        assert!((scaled.xy_scale() - 0.3048).abs() < 1e-6);

        let rigid = resolver
            .resolve_transform(Some(&feet), None, Some(&meters), TransformMethod::UseGcsTransform)
            .unwrap();
        assert!((rigid.xy_scale() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rotation_from_azimuth() {
        let resolver = GeoTransformResolver::default();
        let rotated = gcs("rotated", 40.0, -75.0, 90.0, 1.0);
        let north_up = gcs("north", 40.0, -75.0, 0.0, 1.0);
        let t = resolver
            .resolve_transform(
                Some(&rotated),
                None,
                Some(&north_up),
                TransformMethod::UseGcsTransform,
            )
            .unwrap();
        // local +Y of `rotated` points east, so local +X points south.
        assert!((t.xy_rotation() + std::f64::consts::FRAC_PI_2).abs() < 1e-6);
    }

    #[test]
    fn test_input_definition_offsets_origin() {
        let resolver = GeoTransformResolver::default();
        let target = gcs("target", 40.0, -75.0, 0.0, 1.0);
        let input = InputGcsDefinition {
            origin: Point3d::ORIGIN,
            azimuth_deg: 0.0,
            latitude: 40.0 + (100.0 / 6_378_137.0f64).to_degrees(),
            longitude: -75.0,
            elevation: 0.0,
            datum: "WGS84".into(),
            meters_per_unit: 1.0,
        };
        let t = resolver
            .resolve_transform(None, Some(&input), Some(&target), TransformMethod::UseReprojection)
            .unwrap();
        let moved = t.apply(&Point3d::ORIGIN);
        assert!((moved.y - 100.0).abs() < 1e-6);
        assert!(moved.x.abs() < 1e-6);
    }

    #[test]
    fn test_reproducible() {
        let resolver = GeoTransformResolver::default();
        let a = gcs("a", 51.5, -0.1, 3.0, 1.0);
        let b = gcs("b", 51.6, -0.2, 0.0, 1.0);
        let t1 = resolver
            .resolve_transform(Some(&a), None, Some(&b), TransformMethod::UseReprojection)
            .unwrap();
        let t2 = resolver
            .resolve_transform(Some(&a), None, Some(&b), TransformMethod::UseReprojection)
            .unwrap();
        assert!(t1.approx_eq(&t2, 1e-12));
    }
}
