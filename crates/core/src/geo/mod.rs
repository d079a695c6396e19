//! Coordinate systems, transforms and project extents.

pub mod extents;
pub mod gcs;
pub mod resolver;
pub mod transform;

pub use extents::{ExtentsTracker, Range3d};
pub use gcs::{Gcs, GeoPoint, InputGcsDefinition, Reprojection, TangentPlaneReprojection};
pub use resolver::{GeoTransformResolver, TransformMethod};
pub use transform::{AffineTransform, Point3d};
