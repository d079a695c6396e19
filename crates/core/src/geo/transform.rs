//! Points and affine transforms.

use serde::{Deserialize, Serialize};

/// A point or vector in three dimensions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Point3d {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3d {
    pub const ORIGIN: Point3d = Point3d {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn add(&self, other: &Point3d) -> Point3d {
        Point3d::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn sub(&self, other: &Point3d) -> Point3d {
        Point3d::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn scale(&self, factor: f64) -> Point3d {
        Point3d::new(self.x * factor, self.y * factor, self.z * factor)
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn distance(&self, other: &Point3d) -> f64 {
        self.sub(other).magnitude()
    }
}

/// A linear map plus translation: `p' = matrix * p + translation`.
///
/// `matrix` is row-major.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AffineTransform {
    pub matrix: [[f64; 3]; 3],
    pub translation: Point3d,
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform {
    pub fn identity() -> Self {
        Self {
            matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: Point3d::ORIGIN,
        }
    }

    pub fn translation(offset: Point3d) -> Self {
        Self {
            translation: offset,
            ..Self::identity()
        }
    }

    /// Rotation about Z by `angle_rad`, uniform `scale`, then `offset`.
    pub fn rotation_z_scaled(angle_rad: f64, scale: f64, offset: Point3d) -> Self {
        let (s, c) = angle_rad.sin_cos();
        Self {
            matrix: [
                [c * scale, -s * scale, 0.0],
                [s * scale, c * scale, 0.0],
                [0.0, 0.0, scale],
            ],
            translation: offset,
        }
    }

    /// Build a transform from the images of the origin and the three unit
    /// axes.
    pub fn from_axis_images(origin: Point3d, x: Point3d, y: Point3d, z: Point3d) -> Self {
        let cx = x.sub(&origin);
        let cy = y.sub(&origin);
        let cz = z.sub(&origin);
        Self {
            matrix: [[cx.x, cy.x, cz.x], [cx.y, cy.y, cz.y], [cx.z, cy.z, cz.z]],
            translation: origin,
        }
    }

    pub fn apply(&self, p: &Point3d) -> Point3d {
        self.apply_vector(p).add(&self.translation)
    }

    pub fn apply_vector(&self, v: &Point3d) -> Point3d {
        let m = &self.matrix;
        Point3d::new(
            m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z,
            m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z,
            m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z,
        )
    }

    /// `self ∘ inner`: apply `inner` first, then `self`.
    pub fn compose(&self, inner: &AffineTransform) -> AffineTransform {
        let a = &self.matrix;
        let b = &inner.matrix;
        let mut matrix = [[0.0; 3]; 3];
        for (i, row) in matrix.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| a[i][k] * b[k][j]).sum();
            }
        }
        AffineTransform {
            matrix,
            translation: self.apply(&inner.translation),
        }
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.matrix;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Length of the image of the X axis in the XY plane.
    pub fn xy_scale(&self) -> f64 {
        let m = &self.matrix;
        (m[0][0] * m[0][0] + m[1][0] * m[1][0]).sqrt()
    }

    /// Angle of the image of the X axis in the XY plane.
    pub fn xy_rotation(&self) -> f64 {
        self.matrix[1][0].atan2(self.matrix[0][0])
    }

    pub fn is_identity(&self, tolerance: f64) -> bool {
        self.approx_eq(&Self::identity(), tolerance)
    }

    pub fn approx_eq(&self, other: &AffineTransform, tolerance: f64) -> bool {
        let matrix_ok = self
            .matrix
            .iter()
            .flatten()
            .zip(other.matrix.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= tolerance);
        matrix_ok && self.translation.distance(&other.translation) <= tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_apply() {
        let p = Point3d::new(1.0, 2.0, 3.0);
        assert_eq!(AffineTransform::identity().apply(&p), p);
    }

    #[test]
    fn test_rotation_and_translation() {
        let t = AffineTransform::rotation_z_scaled(
            std::f64::consts::FRAC_PI_2,
            2.0,
            Point3d::new(10.0, 0.0, 0.0),
        );
        let p = t.apply(&Point3d::new(1.0, 0.0, 0.0));
        assert!((p.x - 10.0).abs() < 1e-12);
        assert!((p.y - 2.0).abs() < 1e-12);
        assert!((t.xy_scale() - 2.0).abs() < 1e-12);
        assert!((t.xy_rotation() - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn test_compose_order() {
        let move_x = AffineTransform::translation(Point3d::new(5.0, 0.0, 0.0));
        let double = AffineTransform::rotation_z_scaled(0.0, 2.0, Point3d::ORIGIN);
        // double first, then move
        let t = move_x.compose(&double);
        let p = t.apply(&Point3d::new(1.0, 1.0, 1.0));
        assert_eq!(p, Point3d::new(7.0, 2.0, 2.0));
    }

    #[test]
    fn test_from_axis_images_round_trip() {
        let t = AffineTransform::rotation_z_scaled(0.3, 1.5, Point3d::new(1.0, 2.0, 3.0));
        let rebuilt = AffineTransform::from_axis_images(
            t.apply(&Point3d::ORIGIN),
            t.apply(&Point3d::new(1.0, 0.0, 0.0)),
            t.apply(&Point3d::new(0.0, 1.0, 0.0)),
            t.apply(&Point3d::new(0.0, 0.0, 1.0)),
        );
        assert!(rebuilt.approx_eq(&t, 1e-12));
    }
}
