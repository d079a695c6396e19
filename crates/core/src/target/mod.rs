//! The target element graph.
//!
//! Everything the engine writes goes through [`TargetWriter`]. The bundled
//! [`SqliteTarget`] keeps the graph in the same SQLite database as the
//! identity store so both share one transaction boundary.

pub mod sqlite;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::TargetError;
use crate::geo::{Gcs, Point3d, Range3d};
use crate::models::{Dimensionality, ModelKind, TargetId};
use crate::schema::TargetSchema;
use crate::source::Geometry;

pub use sqlite::SqliteTarget;

/// Kinds of definition element kept in a definition model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    Category,
    LineStyle,
}

impl DefinitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::LineStyle => "line_style",
        }
    }
}

impl std::fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A category or line style in the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetDefinition {
    pub id: TargetId,
    pub model_id: TargetId,
    pub kind: DefinitionKind,
    pub name: String,
    /// Kind-specific appearance (level symbology, dash pattern).
    pub appearance: Option<serde_json::Value>,
}

/// Where an element sits in its model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub origin: Point3d,
    pub bbox: Option<Range3d>,
}

/// Content of one target element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetElement {
    pub class_name: String,
    pub category_id: Option<TargetId>,
    pub line_style_id: Option<TargetId>,
    pub code: Option<String>,
    pub placement: Placement,
    pub geom_part_id: Option<TargetId>,
    /// Geometry in target coordinates.
    pub geometry: Geometry,
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
}

/// Write access to the target repository.
///
/// Every mutating call counts towards [`TargetWriter::write_count`], which
/// callers use to prove that an unchanged source produced no writes.
pub trait TargetWriter: Send + Sync {
    // -- subjects and models --

    fn insert_subject(&self, name: &str) -> Result<TargetId, TargetError>;

    fn insert_model(
        &self,
        subject_id: Option<TargetId>,
        name: &str,
        kind: ModelKind,
        dimensionality: Dimensionality,
    ) -> Result<TargetId, TargetError>;

    fn rename_model(&self, model_id: TargetId, name: &str) -> Result<(), TargetError>;

    fn model_name(&self, model_id: TargetId) -> Result<Option<String>, TargetError>;

    /// Delete a model and every element in it.
    fn delete_model(&self, model_id: TargetId) -> Result<(), TargetError>;

    // -- elements --

    fn insert_element(
        &self,
        model_id: TargetId,
        element: &TargetElement,
    ) -> Result<TargetId, TargetError>;

    fn update_element(&self, element_id: TargetId, element: &TargetElement)
        -> Result<(), TargetError>;

    fn delete_element(&self, element_id: TargetId) -> Result<(), TargetError>;

    fn get_element(&self, element_id: TargetId) -> Result<Option<TargetElement>, TargetError>;

    fn find_element_by_code(
        &self,
        model_id: TargetId,
        code: &str,
    ) -> Result<Option<TargetId>, TargetError>;

    // -- definitions --

    fn find_definition(
        &self,
        model_id: TargetId,
        kind: DefinitionKind,
        name: &str,
    ) -> Result<Option<TargetDefinition>, TargetError>;

    fn insert_definition(
        &self,
        model_id: TargetId,
        kind: DefinitionKind,
        name: &str,
        appearance: Option<&serde_json::Value>,
    ) -> Result<TargetId, TargetError>;

    fn insert_geom_part(&self, name: &str, geometry: &[Geometry]) -> Result<TargetId, TargetError>;

    /// Delete a geometry part no element refers to. Returns `false` and
    /// keeps the part while any element still uses it.
    fn delete_geom_part(&self, part_id: TargetId) -> Result<bool, TargetError>;

    // -- schemas --

    fn find_schema(&self, name: &str) -> Result<Option<TargetSchema>, TargetError>;

    /// Insert or replace a schema in the catalog.
    fn import_schema(&self, schema: &TargetSchema) -> Result<(), TargetError>;

    // -- repository properties --

    fn gcs(&self) -> Result<Option<Gcs>, TargetError>;

    fn set_gcs(&self, gcs: &Gcs) -> Result<(), TargetError>;

    fn project_extents(&self) -> Result<Option<Range3d>, TargetError>;

    fn set_project_extents(&self, extents: &Range3d) -> Result<(), TargetError>;

    fn has_font(&self, name: &str) -> Result<bool, TargetError>;

    fn embed_font(&self, name: &str) -> Result<(), TargetError>;

    /// Ask the repository to regenerate view thumbnails for `model_ids`.
    fn request_thumbnails(&self, model_ids: &[TargetId]) -> Result<(), TargetError>;

    // -- transactions --

    fn save_changes(&self) -> Result<(), TargetError>;

    fn abandon_changes(&self) -> Result<(), TargetError>;

    /// Number of mutating calls made through this writer.
    fn write_count(&self) -> u64;
}
