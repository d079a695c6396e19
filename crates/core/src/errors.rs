//! Error types for the dgnsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored JSON column could not be encoded or decoded.
    #[error("database column encoding error: {0}")]
    EncodingError(#[from] serde_json::Error),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Identity store errors
// ---------------------------------------------------------------------------

/// Errors from the identity store (the persistent mapping tables).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A mapping table is missing or corrupted. Fatal for the run.
    #[error("identity store unavailable: {0}")]
    StoreUnavailable(String),

    /// A source model is already mapped, or a spatial root target model
    /// already has a different source model mapped into it.
    #[error(
        "duplicate model mapping: document {document_id} model {source_model_id} -> target model {target_model_id} ({detail})"
    )]
    DuplicateModelMapping {
        document_id: i64,
        source_model_id: i64,
        target_model_id: i64,
        detail: String,
    },

    /// Two identity rules resolved the same document to different records.
    #[error("conflicting document identity for '{path}': matched records {first} and {second}")]
    DuplicateIdentity { path: String, first: i64, second: i64 },

    /// An operation that requires an active run was called outside one.
    #[error("no run is active on the identity store")]
    NoActiveRun,

    /// A run was started while a write transaction was still open.
    #[error("a write transaction is already open; commit or roll it back before starting a run")]
    TransactionOpen,

    /// Any other database failure.
    #[error("identity store database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for StoreError {
    /// Missing tables and corrupted files become `StoreUnavailable`; other
    /// failures are passed through.
    fn from(err: DatabaseError) -> Self {
        if let DatabaseError::SqliteError(ref inner) = err {
            if is_unavailable(inner) {
                return StoreError::StoreUnavailable(inner.to_string());
            }
        }
        StoreError::Database(err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::from(DatabaseError::from(err))
    }
}

fn is_unavailable(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseCorrupt
                    | rusqlite::ErrorCode::NotADatabase
                    | rusqlite::ErrorCode::CannotOpen
            ) || message
                .as_deref()
                .map(|m| m.contains("no such table") || m.contains("no such column"))
                .unwrap_or(false)
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Source reader errors
// ---------------------------------------------------------------------------

/// Errors from reading source documents.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The document does not exist in the source universe.
    #[error("source document not found: {0}")]
    NotFound(String),

    /// The document exists but could not be decoded.
    #[error("failed to parse source document '{path}': {detail}")]
    Parse { path: String, detail: String },

    /// Generic I/O wrapper.
    #[error("source I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Reference resolution errors
// ---------------------------------------------------------------------------

/// Errors from reference-graph resolution.
#[derive(Debug, Error)]
pub enum ReferenceError {
    /// The document cannot act as the root of a conversion.
    #[error("'{path}' is not a root document: {detail}")]
    NotARootDocument { path: String, detail: String },

    /// The root document does not exist in the source universe.
    #[error("root document not found: {0}")]
    DocumentNotFound(String),

    /// Reading the root document failed.
    #[error("reference source error: {0}")]
    Source(#[from] SourceError),

    /// Identity lookups failed.
    #[error("reference identity error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Schema errors
// ---------------------------------------------------------------------------

/// Errors from schema reconciliation.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Same schema name and version number, different content.
    #[error("schema '{name}' version {major}.{minor} changed content without a version bump")]
    VersionConflict { name: String, major: u32, minor: u32 },

    /// The schema itself is malformed (e.g. a class derives from itself).
    #[error("invalid schema '{name}': {detail}")]
    Invalid { name: String, detail: String },

    /// Identity store failure while recording schema versions.
    #[error("schema store error: {0}")]
    Store(#[from] StoreError),

    /// Target catalog failure.
    #[error("schema target error: {0}")]
    Target(#[from] TargetError),
}

// ---------------------------------------------------------------------------
// Geo errors
// ---------------------------------------------------------------------------

/// Errors from geographic transform resolution.
#[derive(Debug, Error)]
pub enum GeoError {
    /// The computed transform collapsed (zero scale or non-invertible).
    #[error("degenerate transform between '{from}' and '{to}'")]
    DegenerateTransform { from: String, to: String },

    /// A coordinate system definition is unusable.
    #[error("invalid coordinate system '{name}': {detail}")]
    InvalidGcs { name: String, detail: String },

    /// The reprojection routine failed for a point.
    #[error("reprojection failed: {0}")]
    Reprojection(String),
}

// ---------------------------------------------------------------------------
// Element conversion errors
// ---------------------------------------------------------------------------

/// Errors converting a single element. Always recoverable: the element is
/// skipped and the run continues.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// No converter can handle this geometry.
    #[error("unsupported geometry '{kind}' on element {element_id}")]
    Unsupported { element_id: i64, kind: String },

    /// The geometry is present but unusable.
    #[error("invalid geometry on element {element_id}: {detail}")]
    InvalidGeometry { element_id: i64, detail: String },

    /// The element's content could not be serialized for hashing.
    #[error("cannot fingerprint element {element_id}: {detail}")]
    Fingerprint { element_id: i64, detail: String },

    /// The target writer rejected the element.
    #[error("target rejected element {element_id}: {detail}")]
    Rejected { element_id: i64, detail: String },
}

// ---------------------------------------------------------------------------
// Target writer errors
// ---------------------------------------------------------------------------

/// Errors from the target graph writer.
#[derive(Debug, Error)]
pub enum TargetError {
    /// A referenced target entity does not exist.
    #[error("target {entity} not found: {id}")]
    NotFound { entity: String, id: i64 },

    /// A uniqueness rule in the target graph was violated.
    #[error("target constraint violated: {0}")]
    Constraint(String),

    /// Underlying storage failure.
    #[error("target database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<rusqlite::Error> for TargetError {
    fn from(err: rusqlite::Error) -> Self {
        TargetError::Database(DatabaseError::from(err))
    }
}

impl From<serde_json::Error> for TargetError {
    fn from(err: serde_json::Error) -> Self {
        TargetError::Database(DatabaseError::from(err))
    }
}

// ---------------------------------------------------------------------------
// Job coordinator errors
// ---------------------------------------------------------------------------

/// Errors from the job coordinator. Every variant except `InvalidStateTransition`
/// moves the run to `Aborted`.
#[derive(Debug, Error)]
pub enum JobError {
    /// A state-machine transition was invalid.
    #[error("invalid run state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// An operation was attempted after the run aborted.
    #[error("run was aborted: {0}")]
    Aborted(String),

    /// Another run holds the host.
    #[error("another run is already active on this host")]
    RunInProgress,

    /// The job record expected by `find_job` does not exist.
    #[error("no job for bridge '{bridge_key}' on root document {root_document_id}")]
    JobNotFound {
        bridge_key: String,
        root_document_id: i64,
    },

    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("job reference error: {0}")]
    Reference(#[from] ReferenceError),

    #[error("job schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("job geo error: {0}")]
    Geo(#[from] GeoError),

    #[error("job target error: {0}")]
    Target(#[from] TargetError),

    #[error("job source error: {0}")]
    Source(#[from] SourceError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = StoreError::DuplicateModelMapping {
            document_id: 1,
            source_model_id: 2,
            target_model_id: 3,
            detail: "already mapped".into(),
        };
        assert!(err.to_string().contains("duplicate model mapping"));

        let err = ReferenceError::NotARootDocument {
            path: "ref.dgn".into(),
            detail: "reference-only".into(),
        };
        assert_eq!(
            err.to_string(),
            "'ref.dgn' is not a root document: reference-only"
        );

        let err = SchemaError::VersionConflict {
            name: "Plant".into(),
            major: 1,
            minor: 0,
        };
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_missing_table_maps_to_store_unavailable() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT id FROM documents", [], |row| row.get::<_, i64>(0))
            .unwrap_err();
        let store_err: StoreError = err.into();
        assert!(matches!(store_err, StoreError::StoreUnavailable(_)));
    }

    #[test]
    fn test_other_database_errors_pass_through() {
        let db_err = DatabaseError::NotFound {
            entity: "model".into(),
            id: "7".into(),
        };
        let store_err: StoreError = db_err.into();
        assert!(matches!(store_err, StoreError::Database(_)));

        let core_err: CoreError = store_err.into();
        assert!(matches!(core_err, CoreError::Store(_)));
    }
}
