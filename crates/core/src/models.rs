//! Domain model types used throughout dgnsync.
//!
//! These are the persistent identity records owned by the
//! [`IdentityStore`](crate::identity::IdentityStore), plus the small enums
//! they carry. Target-side handles are plain integer ids.

use serde::{Deserialize, Serialize};

use crate::geo::AffineTransform;

/// Id of an entity in the target graph (model, element, category, ...).
pub type TargetId = i64;

/// Monotonically increasing integer identifying one run.
pub type RunToken = i64;

// ---------------------------------------------------------------------------
// Model classification
// ---------------------------------------------------------------------------

/// Whether a model holds 2D or 3D content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Dimensionality {
    #[serde(rename = "2d")]
    TwoD,
    #[default]
    #[serde(rename = "3d")]
    ThreeD,
}

impl Dimensionality {
    /// Parse a stored value. Unknown values are treated as 3D.
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "2d" => Self::TwoD,
            _ => Self::ThreeD,
        }
    }
}

impl std::fmt::Display for Dimensionality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TwoD => write!(f, "2d"),
            Self::ThreeD => write!(f, "3d"),
        }
    }
}

/// What a model represents in the source document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Normal,
    Drawing,
    Sheet,
}

impl ModelKind {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "drawing" => Self::Drawing,
            "sheet" => Self::Sheet,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Drawing => write!(f, "drawing"),
            Self::Sheet => write!(f, "sheet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity records
// ---------------------------------------------------------------------------

/// One source document known to the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub id: i64,
    pub source_path: String,
    pub source_guid: Option<String>,
    /// Basename after recipe normalization; used for basename matching.
    pub normalized_name: String,
    pub created_at: String,
}

/// Mapping of one source model onto one target model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelRecord {
    pub id: i64,
    pub document_id: i64,
    pub source_model_id: i64,
    pub source_model_name: String,
    pub target_model_id: TargetId,
    pub is_root: bool,
    pub dimensionality: Dimensionality,
    pub kind: ModelKind,
    /// Job that first converted this model. Other jobs leave it alone.
    pub job_id: Option<i64>,
    /// Effective source-to-target transform used on the last conversion.
    pub transform: Option<AffineTransform>,
    pub last_touched_run: RunToken,
}

impl ModelRecord {
    /// A 3D normal root model maps into a spatial root target model, which
    /// may not receive content from any other source model.
    pub fn is_spatial_root(&self) -> bool {
        self.is_root && self.dimensionality == Dimensionality::ThreeD && self.kind == ModelKind::Normal
    }
}

/// Mapping of one source element onto one target element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElementRecord {
    pub id: i64,
    pub model_id: i64,
    pub source_element_id: i64,
    pub target_element_id: TargetId,
    pub fingerprint: String,
    pub last_touched_run: RunToken,
}

/// An element whose conversion failed, remembered by fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscardRecord {
    pub model_id: i64,
    pub source_element_id: i64,
    pub fingerprint: String,
    pub reason: String,
    pub run_token: RunToken,
}

/// Version and checksum of a schema as last seen in one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaVersionRecord {
    pub id: i64,
    pub schema_name: String,
    pub document_id: i64,
    pub version_major: u32,
    pub version_minor: u32,
    pub checksum: String,
    /// `false` while the schema is only tracked (no instance used it yet).
    pub imported: bool,
}

/// One bridge's conversion of one root document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: i64,
    pub bridge_key: String,
    pub root_document_id: i64,
    pub subject_id: TargetId,
    pub definition_model_id: TargetId,
    pub created_at: String,
}

/// A document converted under a job, with the file stamp it had then.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDocumentRecord {
    pub job_id: i64,
    pub document_id: i64,
    pub last_save_time: Option<String>,
    pub file_size: Option<i64>,
    pub last_seen_run: RunToken,
}

/// A shared definition converted into a reusable geometry part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeomPartRecord {
    pub id: i64,
    pub document_id: i64,
    pub source_definition_id: i64,
    pub target_geom_part_id: TargetId,
    pub fingerprint: String,
}

// ---------------------------------------------------------------------------
// Run registry
// ---------------------------------------------------------------------------

/// A row from the `runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub token: RunToken,
    pub label: String,
    pub bridge_key: String,
    pub root_path: String,
    pub state: String,
    pub had_changes: bool,
    pub summary: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// A row from the append-only `run_log` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: i64,
    pub run_token: RunToken,
    pub table_name: String,
    pub record_id: i64,
    pub action: String,
    pub created_at: String,
}
