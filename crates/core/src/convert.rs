//! Element conversion.
//!
//! Converters turn one source element into target element content. They
//! are selected by the element's `element_type`; anything without a
//! registered converter goes through [`GeometryConverter`]. A converter
//! error never aborts the run: the element is discarded and remembered.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::errors::ConversionError;
use crate::geo::{AffineTransform, Point3d, Range3d};
use crate::models::TargetId;
use crate::source::{Geometry, SourceElement};
use crate::target::{Placement, TargetElement};

/// Everything a converter needs besides the element itself. Definitions are
/// already mapped to target ids.
#[derive(Debug, Clone)]
pub struct ConversionContext<'a> {
    pub document_path: &'a str,
    /// Source-to-target transform of the element's model.
    pub transform: &'a AffineTransform,
    pub category_id: TargetId,
    pub line_style_id: Option<TargetId>,
    pub geom_part_id: Option<TargetId>,
    /// Instance values renamed to target property names.
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
}

pub trait ElementConverter: Send + Sync {
    fn convert(
        &self,
        element: &SourceElement,
        ctx: &ConversionContext<'_>,
    ) -> Result<TargetElement, ConversionError>;
}

/// Converts any decodable geometry into a generic target element.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryConverter;

impl GeometryConverter {
    fn check(element: &SourceElement) -> Result<(), ConversionError> {
        let invalid = |detail: &str| ConversionError::InvalidGeometry {
            element_id: element.id,
            detail: detail.to_string(),
        };
        let geometry = &element.geometry;
        if let Geometry::Opaque { .. } = geometry {
            return Err(ConversionError::Unsupported {
                element_id: element.id,
                kind: element.element_type.clone(),
            });
        }
        if !geometry.key_points().iter().all(is_finite) {
            return Err(invalid("non-finite coordinate"));
        }
        match geometry {
            Geometry::LineString { points } if points.len() < 2 => {
                Err(invalid("line string needs at least 2 points"))
            }
            Geometry::Shape { points } if points.len() < 3 => {
                Err(invalid("shape needs at least 3 points"))
            }
            Geometry::Arc { radius, .. } if !(radius.is_finite() && *radius > 0.0) => {
                Err(invalid("arc radius must be positive"))
            }
            Geometry::Text { height, .. } if !(height.is_finite() && *height > 0.0) => {
                Err(invalid("text height must be positive"))
            }
            Geometry::CellInstance { scale, .. } if !(scale.is_finite() && *scale != 0.0) => {
                Err(invalid("cell scale must be non-zero"))
            }
            _ => Ok(()),
        }
    }
}

fn is_finite(p: &Point3d) -> bool {
    p.x.is_finite() && p.y.is_finite() && p.z.is_finite()
}

impl ElementConverter for GeometryConverter {
    fn convert(
        &self,
        element: &SourceElement,
        ctx: &ConversionContext<'_>,
    ) -> Result<TargetElement, ConversionError> {
        Self::check(element)?;
        let geometry = element.geometry.transformed(ctx.transform);
        let points = geometry.key_points();
        let origin = points.first().copied().unwrap_or(Point3d::ORIGIN);
        let class_name = match &element.properties {
            Some(data) => format!("{}:{}", data.schema, data.class),
            None => format!("Generic:{}", element.geometry.kind_name()),
        };
        Ok(TargetElement {
            class_name,
            category_id: Some(ctx.category_id),
            line_style_id: ctx.line_style_id,
            code: element.code.clone(),
            placement: Placement {
                origin,
                bbox: Range3d::from_points(points.iter()),
            },
            geom_part_id: ctx.geom_part_id,
            geometry,
            properties: ctx.properties.clone(),
        })
    }
}

/// Converters keyed by element type, with a fallback.
#[derive(Clone)]
pub struct ConverterRegistry {
    converters: HashMap<String, Arc<dyn ElementConverter>>,
    fallback: Arc<dyn ElementConverter>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self {
            converters: HashMap::new(),
            fallback: Arc::new(GeometryConverter),
        }
    }
}

impl std::fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.converters.keys().collect();
        keys.sort();
        f.debug_struct("ConverterRegistry")
            .field("element_types", &keys)
            .finish_non_exhaustive()
    }
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `converter` for elements of `element_type`, replacing any
    /// previous registration.
    pub fn register(&mut self, element_type: &str, converter: Arc<dyn ElementConverter>) {
        debug!(element_type, "registered element converter");
        self.converters.insert(element_type.to_string(), converter);
    }

    pub fn convert(
        &self,
        element: &SourceElement,
        ctx: &ConversionContext<'_>,
    ) -> Result<TargetElement, ConversionError> {
        self.converters
            .get(&element.element_type)
            .unwrap_or(&self.fallback)
            .convert(element, ctx)
    }
}
