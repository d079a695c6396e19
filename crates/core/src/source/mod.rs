//! Source document model and the reader seam.
//!
//! A [`SourceReader`] yields fully-read [`SourceDocument`] snapshots. The
//! engine never reads an element twice within one model pass: each model is
//! converted from the snapshot it was read into.

pub mod json;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::SourceError;
use crate::geo::{AffineTransform, Gcs, Point3d, Range3d};
use crate::models::{Dimensionality, ModelKind};
use crate::schema::SourceSchema;

pub use json::JsonSourceReader;
pub use memory::MemorySourceReader;

/// Reads source documents by path.
pub trait SourceReader: Send + Sync {
    /// Read a complete snapshot of the document at `path`.
    fn read_document(&self, path: &str) -> Result<Arc<SourceDocument>, SourceError>;

    /// `true` if a document exists at `path`. Used to tell a deleted file
    /// from one that is merely no longer referenced.
    fn exists(&self, path: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SourceDocument {
    /// Path as understood by the reader. Filled from the request when empty.
    #[serde(default)]
    pub path: String,
    /// Embedded document GUID, if the format carries one.
    #[serde(default)]
    pub guid: Option<String>,
    /// Reference-only documents may be attached but never converted as root.
    #[serde(default)]
    pub reference_only: bool,
    #[serde(default)]
    pub last_save_time: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub gcs: Option<Gcs>,
    #[serde(default)]
    pub default_model_id: Option<i64>,
    #[serde(default)]
    pub models: Vec<SourceModel>,
    #[serde(default)]
    pub levels: Vec<SourceLevel>,
    #[serde(default)]
    pub line_styles: Vec<SourceLineStyle>,
    #[serde(default)]
    pub schemas: Vec<SourceSchema>,
    /// Fonts declared by the document's font table.
    #[serde(default)]
    pub fonts: Vec<String>,
    #[serde(default)]
    pub shared_cells: Vec<SharedCellDefinition>,
}

impl SourceDocument {
    pub fn basename(&self) -> String {
        crate::identity::recipe::basename(&self.path)
    }

    pub fn model(&self, id: i64) -> Option<&SourceModel> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Case-insensitive lookup by model name.
    pub fn model_by_name(&self, name: &str) -> Option<&SourceModel> {
        self.models.iter().find(|m| m.name.eq_ignore_ascii_case(name))
    }

    pub fn default_model(&self) -> Option<&SourceModel> {
        self.default_model_id.and_then(|id| self.model(id))
    }

    pub fn level(&self, id: i64) -> Option<&SourceLevel> {
        self.levels.iter().find(|l| l.id == id)
    }

    pub fn line_style(&self, id: i64) -> Option<&SourceLineStyle> {
        self.line_styles.iter().find(|s| s.id == id)
    }

    pub fn shared_cell(&self, id: i64) -> Option<&SharedCellDefinition> {
        self.shared_cells.iter().find(|c| c.id == id)
    }

    pub fn schema(&self, name: &str) -> Option<&SourceSchema> {
        self.schemas.iter().find(|s| s.name == name)
    }

    /// `true` if any element in any model carries instance data of `schema`.
    pub fn uses_schema(&self, schema: &str) -> bool {
        self.models
            .iter()
            .flat_map(|m| m.elements.iter())
            .filter_map(|e| e.properties.as_ref())
            .any(|p| p.schema == schema)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceModel {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub dimensionality: Dimensionality,
    #[serde(default)]
    pub kind: ModelKind,
    #[serde(default)]
    pub elements: Vec<SourceElement>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A reference from one model to a model of another (or the same) document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub id: i64,
    /// Path of the attached document.
    pub document: String,
    /// Attached model; the document's default model when absent.
    #[serde(default)]
    pub model_name: Option<String>,
    /// Placement of the attached model in the parent model.
    #[serde(default)]
    pub transform: AffineTransform,
    #[serde(default = "default_true")]
    pub display: bool,
    #[serde(default)]
    pub clip: Option<Vec<Point3d>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LevelAppearance {
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub style: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceLevel {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub appearance: LevelAppearance,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceLineStyle {
    pub id: i64,
    pub name: String,
    /// Alternating dash and gap lengths.
    #[serde(default)]
    pub pattern: Vec<f64>,
}

/// A reusable geometry definition (shared cell).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedCellDefinition {
    pub id: i64,
    pub name: String,
    pub geometry: Vec<Geometry>,
}

// ---------------------------------------------------------------------------
// Elements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceElement {
    pub id: i64,
    /// Key used to select an element converter.
    pub element_type: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub symbology: Symbology,
    #[serde(default)]
    pub properties: Option<InstanceData>,
    #[serde(default)]
    pub code: Option<String>,
    /// Incidental metadata; never part of the fingerprint.
    #[serde(default)]
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Symbology {
    #[serde(default)]
    pub level_id: i64,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub line_style_id: Option<i64>,
    #[serde(default)]
    pub font: Option<String>,
}

/// Schema-instance payload attached to an element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InstanceData {
    pub schema: String,
    pub class: String,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    Line {
        start: Point3d,
        end: Point3d,
    },
    LineString {
        points: Vec<Point3d>,
    },
    Shape {
        points: Vec<Point3d>,
    },
    Arc {
        center: Point3d,
        radius: f64,
        #[serde(default)]
        start_angle: f64,
        #[serde(default = "full_sweep")]
        sweep_angle: f64,
    },
    Text {
        origin: Point3d,
        text: String,
        #[serde(default = "default_text_height")]
        height: f64,
    },
    CellInstance {
        definition_id: i64,
        origin: Point3d,
        #[serde(default = "default_scale")]
        scale: f64,
        #[serde(default)]
        rotation: f64,
    },
    /// Geometry the reader could not decode.
    Opaque {
        #[serde(default)]
        payload: String,
    },
}

fn full_sweep() -> f64 {
    std::f64::consts::TAU
}
fn default_text_height() -> f64 {
    1.0
}
fn default_scale() -> f64 {
    1.0
}

impl Geometry {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Line { .. } => "line",
            Self::LineString { .. } => "line_string",
            Self::Shape { .. } => "shape",
            Self::Arc { .. } => "arc",
            Self::Text { .. } => "text",
            Self::CellInstance { .. } => "cell_instance",
            Self::Opaque { .. } => "opaque",
        }
    }

    /// Defining points, used for placement and range.
    pub fn key_points(&self) -> Vec<Point3d> {
        match self {
            Self::Line { start, end } => vec![*start, *end],
            Self::LineString { points } | Self::Shape { points } => points.clone(),
            Self::Arc { center, radius, .. } => vec![
                center.add(&Point3d::new(-radius, -radius, 0.0)),
                center.add(&Point3d::new(*radius, *radius, 0.0)),
            ],
            Self::Text {
                origin,
                text,
                height,
            } => {
                let width = height * text.chars().count() as f64;
                vec![*origin, origin.add(&Point3d::new(width, *height, 0.0))]
            }
            Self::CellInstance { origin, .. } => vec![*origin],
            Self::Opaque { .. } => Vec::new(),
        }
    }

    pub fn range(&self) -> Option<Range3d> {
        Range3d::from_points(self.key_points().iter())
    }

    /// Apply `t` to this geometry. Arc radii, text heights and cell scales
    /// take the transform's XY scale; angles take its XY rotation.
    pub fn transformed(&self, t: &AffineTransform) -> Geometry {
        let scale = t.xy_scale();
        let rotation = t.xy_rotation();
        match self {
            Self::Line { start, end } => Self::Line {
                start: t.apply(start),
                end: t.apply(end),
            },
            Self::LineString { points } => Self::LineString {
                points: points.iter().map(|p| t.apply(p)).collect(),
            },
            Self::Shape { points } => Self::Shape {
                points: points.iter().map(|p| t.apply(p)).collect(),
            },
            Self::Arc {
                center,
                radius,
                start_angle,
                sweep_angle,
            } => Self::Arc {
                center: t.apply(center),
                radius: radius * scale,
                start_angle: start_angle + rotation,
                sweep_angle: *sweep_angle,
            },
            Self::Text {
                origin,
                text,
                height,
            } => Self::Text {
                origin: t.apply(origin),
                text: text.clone(),
                height: height * scale,
            },
            Self::CellInstance {
                definition_id,
                origin,
                scale: s,
                rotation: r,
            } => Self::CellInstance {
                definition_id: *definition_id,
                origin: t.apply(origin),
                scale: s * scale,
                rotation: r + rotation,
            },
            Self::Opaque { payload } => Self::Opaque {
                payload: payload.clone(),
            },
        }
    }
}
