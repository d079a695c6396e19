//! Typed query helpers for every identity table in the dgnsync database.

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;
use crate::geo::AffineTransform;
use crate::models::{
    Dimensionality, DiscardRecord, DocumentRecord, ElementRecord, GeomPartRecord,
    JobDocumentRecord, JobRecord, ModelKind, ModelRecord, RunLogEntry, RunRecord, RunToken,
    SchemaVersionRecord, TargetId,
};

// ---------------------------------------------------------------------------
// Insert parameters
// ---------------------------------------------------------------------------

/// Column values for a new `models` row.
#[derive(Debug, Clone)]
pub struct NewModel<'a> {
    pub document_id: i64,
    pub source_model_id: i64,
    pub source_model_name: &'a str,
    pub target_model_id: TargetId,
    pub is_root: bool,
    pub dimensionality: Dimensionality,
    pub kind: ModelKind,
    pub job_id: Option<i64>,
    pub transform: Option<&'a AffineTransform>,
    pub run_token: RunToken,
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

const DOCUMENT_COLUMNS: &str = "id, source_path, source_guid, normalized_name, created_at";

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    Ok(DocumentRecord {
        id: row.get(0)?,
        source_path: row.get(1)?,
        source_guid: row.get(2)?,
        normalized_name: row.get(3)?,
        created_at: row.get(4)?,
    })
}

const MODEL_COLUMNS: &str = "id, document_id, source_model_id, source_model_name, target_model_id, \
     is_root, dimensionality, kind, job_id, transform, last_touched_run";

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    let dimensionality: String = row.get(6)?;
    let kind: String = row.get(7)?;
    let transform: Option<String> = row.get(9)?;
    let transform = transform
        .map(|json| serde_json::from_str::<AffineTransform>(&json))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;
    Ok(ModelRecord {
        id: row.get(0)?,
        document_id: row.get(1)?,
        source_model_id: row.get(2)?,
        source_model_name: row.get(3)?,
        target_model_id: row.get(4)?,
        is_root: row.get(5)?,
        dimensionality: Dimensionality::from_str_val(&dimensionality),
        kind: ModelKind::from_str_val(&kind),
        job_id: row.get(8)?,
        transform,
        last_touched_run: row.get(10)?,
    })
}

const ELEMENT_COLUMNS: &str =
    "id, model_id, source_element_id, target_element_id, fingerprint, last_touched_run";

fn element_from_row(row: &Row<'_>) -> rusqlite::Result<ElementRecord> {
    Ok(ElementRecord {
        id: row.get(0)?,
        model_id: row.get(1)?,
        source_element_id: row.get(2)?,
        target_element_id: row.get(3)?,
        fingerprint: row.get(4)?,
        last_touched_run: row.get(5)?,
    })
}

const SCHEMA_VERSION_COLUMNS: &str =
    "id, schema_name, document_id, version_major, version_minor, checksum, imported";

fn schema_version_from_row(row: &Row<'_>) -> rusqlite::Result<SchemaVersionRecord> {
    Ok(SchemaVersionRecord {
        id: row.get(0)?,
        schema_name: row.get(1)?,
        document_id: row.get(2)?,
        version_major: row.get(3)?,
        version_minor: row.get(4)?,
        checksum: row.get(5)?,
        imported: row.get(6)?,
    })
}

const JOB_COLUMNS: &str =
    "id, bridge_key, root_document_id, subject_id, definition_model_id, created_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        bridge_key: row.get(1)?,
        root_document_id: row.get(2)?,
        subject_id: row.get(3)?,
        definition_model_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        token: row.get(0)?,
        label: row.get(1)?,
        bridge_key: row.get(2)?,
        root_path: row.get(3)?,
        state: row.get(4)?,
        had_changes: row.get(5)?,
        summary: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

const RUN_COLUMNS: &str =
    "token, label, bridge_key, root_path, state, had_changes, summary, started_at, completed_at";

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- kv_state -----------------------------------------------------------

    /// Get a value from the key-value state table.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a value in the key-value state table (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }

    // -- runs ---------------------------------------------------------------

    /// Register a new run and return its token.
    pub fn insert_run(
        &self,
        label: &str,
        bridge_key: &str,
        root_path: &str,
        state: &str,
    ) -> Result<RunToken, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO runs (label, bridge_key, root_path, state, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![label, bridge_key, root_path, state, now],
        )?;
        let token = conn.last_insert_rowid();
        debug!(token, label, bridge_key, "inserted run");
        Ok(token)
    }

    /// Record the final state of a run.
    pub fn complete_run(
        &self,
        token: RunToken,
        state: &str,
        had_changes: bool,
        summary: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE runs SET state = ?1, had_changes = ?2, summary = ?3, completed_at = ?4
             WHERE token = ?5",
            params![state, had_changes, summary, now, token],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "run".into(),
                id: token.to_string(),
            });
        }
        debug!(token, state, had_changes, "completed run");
        Ok(())
    }

    pub fn get_run(&self, token: RunToken) -> Result<Option<RunRecord>, DatabaseError> {
        let conn = self.conn();
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE token = ?1"),
                params![token],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY token DESC LIMIT ?1"
        ))?;
        let runs = stmt
            .query_map(params![limit], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    // -- run_log ------------------------------------------------------------

    /// Append one row to the run log.
    pub fn append_run_log(
        &self,
        run_token: RunToken,
        table_name: &str,
        record_id: i64,
        action: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO run_log (run_token, table_name, record_id, action, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_token, table_name, record_id, action, now],
        )?;
        Ok(())
    }

    pub fn list_run_log(&self, run_token: RunToken) -> Result<Vec<RunLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, run_token, table_name, record_id, action, created_at
             FROM run_log WHERE run_token = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![run_token], |row| {
                Ok(RunLogEntry {
                    id: row.get(0)?,
                    run_token: row.get(1)?,
                    table_name: row.get(2)?,
                    record_id: row.get(3)?,
                    action: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- documents ----------------------------------------------------------

    pub fn get_document(&self, id: i64) -> Result<Option<DocumentRecord>, DatabaseError> {
        let conn = self.conn();
        let doc = conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
                params![id],
                document_from_row,
            )
            .optional()?;
        Ok(doc)
    }

    pub fn find_document_by_guid(&self, guid: &str) -> Result<Option<DocumentRecord>, DatabaseError> {
        let conn = self.conn();
        let doc = conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE source_guid = ?1"),
                params![guid],
                document_from_row,
            )
            .optional()?;
        Ok(doc)
    }

    pub fn find_document_by_path(&self, path: &str) -> Result<Option<DocumentRecord>, DatabaseError> {
        let conn = self.conn();
        let doc = conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE source_path = ?1"),
                params![path],
                document_from_row,
            )
            .optional()?;
        Ok(doc)
    }

    /// All documents whose normalized basename equals `name`, oldest first.
    pub fn find_documents_by_normalized_name(
        &self,
        name: &str,
    ) -> Result<Vec<DocumentRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE normalized_name = ?1 ORDER BY id"
        ))?;
        let docs = stmt
            .query_map(params![name], document_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(docs)
    }

    pub fn insert_document(
        &self,
        source_path: &str,
        source_guid: Option<&str>,
        normalized_name: &str,
    ) -> Result<DocumentRecord, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO documents (source_path, source_guid, normalized_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![source_path, source_guid, normalized_name, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, source_path, "inserted document");
        Ok(DocumentRecord {
            id,
            source_path: source_path.to_string(),
            source_guid: source_guid.map(str::to_string),
            normalized_name: normalized_name.to_string(),
            created_at: now,
        })
    }

    /// Update the stored path, GUID and normalized name of a document.
    pub fn update_document(
        &self,
        id: i64,
        source_path: &str,
        source_guid: Option<&str>,
        normalized_name: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE documents SET source_path = ?1, source_guid = ?2, normalized_name = ?3
             WHERE id = ?4",
            params![source_path, source_guid, normalized_name, id],
        )?;
        debug!(id, source_path, "updated document");
        Ok(())
    }

    pub fn delete_document(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        debug!(id, "deleted document");
        Ok(())
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY id"))?;
        let docs = stmt
            .query_map([], document_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(docs)
    }

    // -- models -------------------------------------------------------------

    pub fn get_model(&self, id: i64) -> Result<Option<ModelRecord>, DatabaseError> {
        let conn = self.conn();
        let model = conn
            .query_row(
                &format!("SELECT {MODEL_COLUMNS} FROM models WHERE id = ?1"),
                params![id],
                model_from_row,
            )
            .optional()?;
        Ok(model)
    }

    pub fn find_model(
        &self,
        document_id: i64,
        source_model_id: i64,
    ) -> Result<Option<ModelRecord>, DatabaseError> {
        let conn = self.conn();
        let model = conn
            .query_row(
                &format!(
                    "SELECT {MODEL_COLUMNS} FROM models WHERE document_id = ?1 AND source_model_id = ?2"
                ),
                params![document_id, source_model_id],
                model_from_row,
            )
            .optional()?;
        Ok(model)
    }

    /// All model records mapped onto `target_model_id`.
    pub fn find_models_by_target(
        &self,
        target_model_id: TargetId,
    ) -> Result<Vec<ModelRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE target_model_id = ?1 ORDER BY id"
        ))?;
        let models = stmt
            .query_map(params![target_model_id], model_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(models)
    }

    pub fn list_models_for_document(
        &self,
        document_id: i64,
    ) -> Result<Vec<ModelRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE document_id = ?1 ORDER BY id"
        ))?;
        let models = stmt
            .query_map(params![document_id], model_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(models)
    }

    pub fn insert_model(&self, model: &NewModel<'_>) -> Result<i64, DatabaseError> {
        let transform = model.transform.map(serde_json::to_string).transpose()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO models (document_id, source_model_id, source_model_name, target_model_id,
                                 is_root, dimensionality, kind, job_id, transform, last_touched_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                model.document_id,
                model.source_model_id,
                model.source_model_name,
                model.target_model_id,
                model.is_root,
                model.dimensionality.to_string(),
                model.kind.to_string(),
                model.job_id,
                transform,
                model.run_token,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(
            id,
            document_id = model.document_id,
            source_model_id = model.source_model_id,
            target_model_id = model.target_model_id,
            "inserted model mapping"
        );
        Ok(id)
    }

    /// Refresh a model's name, effective transform and touched run.
    pub fn update_model(
        &self,
        id: i64,
        source_model_name: &str,
        transform: Option<&AffineTransform>,
        run_token: RunToken,
    ) -> Result<(), DatabaseError> {
        let transform = transform.map(serde_json::to_string).transpose()?;
        let conn = self.conn();
        conn.execute(
            "UPDATE models SET source_model_name = ?1, transform = ?2, last_touched_run = ?3
             WHERE id = ?4",
            params![source_model_name, transform, run_token, id],
        )?;
        Ok(())
    }

    pub fn delete_model(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute("DELETE FROM models WHERE id = ?1", params![id])?;
        debug!(id, "deleted model mapping");
        Ok(())
    }

    // -- elements -----------------------------------------------------------

    pub fn find_element(
        &self,
        model_id: i64,
        source_element_id: i64,
    ) -> Result<Option<ElementRecord>, DatabaseError> {
        let conn = self.conn();
        let element = conn
            .query_row(
                &format!(
                    "SELECT {ELEMENT_COLUMNS} FROM elements WHERE model_id = ?1 AND source_element_id = ?2"
                ),
                params![model_id, source_element_id],
                element_from_row,
            )
            .optional()?;
        Ok(element)
    }

    /// Insert or update the mapping for one source element, marking it
    /// touched by `run_token`.
    pub fn upsert_element(
        &self,
        model_id: i64,
        source_element_id: i64,
        target_element_id: TargetId,
        fingerprint: &str,
        run_token: RunToken,
    ) -> Result<ElementRecord, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO elements (model_id, source_element_id, target_element_id, fingerprint, last_touched_run)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(model_id, source_element_id) DO UPDATE SET
                target_element_id = excluded.target_element_id,
                fingerprint = excluded.fingerprint,
                last_touched_run = excluded.last_touched_run",
            params![model_id, source_element_id, target_element_id, fingerprint, run_token],
        )?;
        let record = conn.query_row(
            &format!(
                "SELECT {ELEMENT_COLUMNS} FROM elements WHERE model_id = ?1 AND source_element_id = ?2"
            ),
            params![model_id, source_element_id],
            element_from_row,
        )?;
        Ok(record)
    }

    pub fn touch_element(&self, id: i64, run_token: RunToken) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "UPDATE elements SET last_touched_run = ?1 WHERE id = ?2",
            params![run_token, id],
        )?;
        Ok(())
    }

    pub fn delete_element(&self, id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute("DELETE FROM elements WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Elements in `model_id` whose last touch predates `run_token`.
    pub fn find_elements_not_touched_since(
        &self,
        model_id: i64,
        run_token: RunToken,
    ) -> Result<Vec<ElementRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ELEMENT_COLUMNS} FROM elements
             WHERE model_id = ?1 AND last_touched_run < ?2 ORDER BY source_element_id"
        ))?;
        let elements = stmt
            .query_map(params![model_id, run_token], element_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(elements)
    }

    pub fn count_elements(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM elements", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- discards -----------------------------------------------------------

    pub fn find_discard(
        &self,
        model_id: i64,
        source_element_id: i64,
    ) -> Result<Option<DiscardRecord>, DatabaseError> {
        let conn = self.conn();
        let discard = conn
            .query_row(
                "SELECT model_id, source_element_id, fingerprint, reason, run_token
                 FROM discards WHERE model_id = ?1 AND source_element_id = ?2",
                params![model_id, source_element_id],
                |row| {
                    Ok(DiscardRecord {
                        model_id: row.get(0)?,
                        source_element_id: row.get(1)?,
                        fingerprint: row.get(2)?,
                        reason: row.get(3)?,
                        run_token: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(discard)
    }

    pub fn upsert_discard(&self, discard: &DiscardRecord) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO discards (model_id, source_element_id, fingerprint, reason, run_token)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(model_id, source_element_id) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                reason = excluded.reason,
                run_token = excluded.run_token",
            params![
                discard.model_id,
                discard.source_element_id,
                discard.fingerprint,
                discard.reason,
                discard.run_token
            ],
        )?;
        Ok(())
    }

    /// Returns `true` if a row was removed.
    pub fn delete_discard(
        &self,
        model_id: i64,
        source_element_id: i64,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM discards WHERE model_id = ?1 AND source_element_id = ?2",
            params![model_id, source_element_id],
        )?;
        Ok(removed > 0)
    }

    pub fn count_discards(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM discards", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- schema_versions ----------------------------------------------------

    pub fn find_schema_version(
        &self,
        schema_name: &str,
        document_id: i64,
    ) -> Result<Option<SchemaVersionRecord>, DatabaseError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {SCHEMA_VERSION_COLUMNS} FROM schema_versions
                     WHERE schema_name = ?1 AND document_id = ?2"
                ),
                params![schema_name, document_id],
                schema_version_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Every document's record for `schema_name`.
    pub fn list_schema_versions(
        &self,
        schema_name: &str,
    ) -> Result<Vec<SchemaVersionRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCHEMA_VERSION_COLUMNS} FROM schema_versions WHERE schema_name = ?1 ORDER BY id"
        ))?;
        let records = stmt
            .query_map(params![schema_name], schema_version_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn upsert_schema_version(
        &self,
        schema_name: &str,
        document_id: i64,
        version_major: u32,
        version_minor: u32,
        checksum: &str,
        imported: bool,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO schema_versions (schema_name, document_id, version_major, version_minor, checksum, imported)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(schema_name, document_id) DO UPDATE SET
                version_major = excluded.version_major,
                version_minor = excluded.version_minor,
                checksum = excluded.checksum,
                imported = excluded.imported",
            params![schema_name, document_id, version_major, version_minor, checksum, imported],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM schema_versions WHERE schema_name = ?1 AND document_id = ?2",
            params![schema_name, document_id],
            |row| row.get(0),
        )?;
        debug!(schema_name, document_id, version_major, version_minor, imported, "recorded schema version");
        Ok(id)
    }

    // -- jobs ---------------------------------------------------------------

    pub fn find_job(
        &self,
        bridge_key: &str,
        root_document_id: i64,
    ) -> Result<Option<JobRecord>, DatabaseError> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE bridge_key = ?1 AND root_document_id = ?2"
                ),
                params![bridge_key, root_document_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn insert_job(
        &self,
        bridge_key: &str,
        root_document_id: i64,
        subject_id: TargetId,
        definition_model_id: TargetId,
    ) -> Result<JobRecord, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO jobs (bridge_key, root_document_id, subject_id, definition_model_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![bridge_key, root_document_id, subject_id, definition_model_id, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, bridge_key, root_document_id, "inserted job");
        Ok(JobRecord {
            id,
            bridge_key: bridge_key.to_string(),
            root_document_id,
            subject_id,
            definition_model_id,
            created_at: now,
        })
    }

    pub fn list_jobs(&self) -> Result<Vec<JobRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id"))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    // -- job_documents ------------------------------------------------------

    pub fn find_job_document(
        &self,
        job_id: i64,
        document_id: i64,
    ) -> Result<Option<JobDocumentRecord>, DatabaseError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT job_id, document_id, last_save_time, file_size, last_seen_run
                 FROM job_documents WHERE job_id = ?1 AND document_id = ?2",
                params![job_id, document_id],
                |row| {
                    Ok(JobDocumentRecord {
                        job_id: row.get(0)?,
                        document_id: row.get(1)?,
                        last_save_time: row.get(2)?,
                        file_size: row.get(3)?,
                        last_seen_run: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn upsert_job_document(&self, record: &JobDocumentRecord) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO job_documents (job_id, document_id, last_save_time, file_size, last_seen_run)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(job_id, document_id) DO UPDATE SET
                last_save_time = excluded.last_save_time,
                file_size = excluded.file_size,
                last_seen_run = excluded.last_seen_run",
            params![
                record.job_id,
                record.document_id,
                record.last_save_time,
                record.file_size,
                record.last_seen_run
            ],
        )?;
        Ok(())
    }

    pub fn list_job_documents(&self, job_id: i64) -> Result<Vec<JobDocumentRecord>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT job_id, document_id, last_save_time, file_size, last_seen_run
             FROM job_documents WHERE job_id = ?1 ORDER BY document_id",
        )?;
        let records = stmt
            .query_map(params![job_id], |row| {
                Ok(JobDocumentRecord {
                    job_id: row.get(0)?,
                    document_id: row.get(1)?,
                    last_save_time: row.get(2)?,
                    file_size: row.get(3)?,
                    last_seen_run: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn delete_job_document(&self, job_id: i64, document_id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM job_documents WHERE job_id = ?1 AND document_id = ?2",
            params![job_id, document_id],
        )?;
        Ok(())
    }

    /// Number of jobs, other than `job_id`, that still reference `document_id`.
    pub fn count_other_jobs_for_document(
        &self,
        job_id: i64,
        document_id: i64,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM job_documents WHERE document_id = ?1 AND job_id <> ?2",
            params![document_id, job_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- geom_parts ---------------------------------------------------------

    pub fn find_geom_part(
        &self,
        document_id: i64,
        source_definition_id: i64,
    ) -> Result<Option<GeomPartRecord>, DatabaseError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT id, document_id, source_definition_id, target_geom_part_id, fingerprint
                 FROM geom_parts WHERE document_id = ?1 AND source_definition_id = ?2",
                params![document_id, source_definition_id],
                geom_part_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Oldest mapping whose definition content hashes to `fingerprint`.
    pub fn find_geom_part_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<GeomPartRecord>, DatabaseError> {
        let conn = self.conn();
        let record = conn
            .query_row(
                "SELECT id, document_id, source_definition_id, target_geom_part_id, fingerprint
                 FROM geom_parts WHERE fingerprint = ?1 ORDER BY id LIMIT 1",
                params![fingerprint],
                geom_part_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Number of document mappings pointing at a target geometry part.
    pub fn count_geom_part_mappings(&self, target_geom_part_id: TargetId) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM geom_parts WHERE target_geom_part_id = ?1",
            params![target_geom_part_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn upsert_geom_part(
        &self,
        document_id: i64,
        source_definition_id: i64,
        target_geom_part_id: TargetId,
        fingerprint: &str,
    ) -> Result<GeomPartRecord, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO geom_parts (document_id, source_definition_id, target_geom_part_id, fingerprint)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(document_id, source_definition_id) DO UPDATE SET
                target_geom_part_id = excluded.target_geom_part_id,
                fingerprint = excluded.fingerprint",
            params![document_id, source_definition_id, target_geom_part_id, fingerprint],
        )?;
        let record = conn.query_row(
            "SELECT id, document_id, source_definition_id, target_geom_part_id, fingerprint
             FROM geom_parts WHERE document_id = ?1 AND source_definition_id = ?2",
            params![document_id, source_definition_id],
            geom_part_from_row,
        )?;
        Ok(record)
    }

    // -- level_map ----------------------------------------------------------

    pub fn find_level_category(
        &self,
        job_id: i64,
        document_id: i64,
        source_level_id: i64,
    ) -> Result<Option<TargetId>, DatabaseError> {
        let conn = self.conn();
        let category = conn
            .query_row(
                "SELECT category_id FROM level_map
                 WHERE job_id = ?1 AND document_id = ?2 AND source_level_id = ?3",
                params![job_id, document_id, source_level_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(category)
    }

    pub fn upsert_level_category(
        &self,
        job_id: i64,
        document_id: i64,
        source_level_id: i64,
        category_id: TargetId,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO level_map (job_id, document_id, source_level_id, category_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_id, document_id, source_level_id) DO UPDATE SET
                category_id = excluded.category_id",
            params![job_id, document_id, source_level_id, category_id],
        )?;
        Ok(())
    }
}

fn geom_part_from_row(row: &Row<'_>) -> rusqlite::Result<GeomPartRecord> {
    Ok(GeomPartRecord {
        id: row.get(0)?,
        document_id: row.get(1)?,
        source_definition_id: row.get(2)?,
        target_geom_part_id: row.get(3)?,
        fingerprint: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn new_model<'a>(document_id: i64, source_model_id: i64, target: TargetId) -> NewModel<'a> {
        NewModel {
            document_id,
            source_model_id,
            source_model_name: "Default",
            target_model_id: target,
            is_root: false,
            dimensionality: Dimensionality::ThreeD,
            kind: ModelKind::Normal,
            job_id: None,
            transform: None,
            run_token: 1,
        }
    }

    #[test]
    fn test_kv_state() {
        let db = test_db();
        assert_eq!(db.get_state("missing").unwrap(), None);
        db.set_state("key", "v1").unwrap();
        db.set_state("key", "v2").unwrap();
        assert_eq!(db.get_state("key").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn test_runs_and_log() {
        let db = test_db();
        let first = db.insert_run("a", "bridge", "root.dgn", "created").unwrap();
        let second = db.insert_run("b", "bridge", "root.dgn", "created").unwrap();
        assert!(second > first);

        db.append_run_log(second, "elements", 7, "insert").unwrap();
        db.complete_run(second, "committed", true, Some("1 insert")).unwrap();

        let run = db.get_run(second).unwrap().unwrap();
        assert_eq!(run.state, "committed");
        assert!(run.had_changes);
        assert!(run.completed_at.is_some());

        let log = db.list_run_log(second).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].table_name, "elements");

        assert!(db.complete_run(999, "committed", false, None).is_err());
    }

    #[test]
    fn test_document_lookups() {
        let db = test_db();
        let doc = db
            .insert_document("/data/master.dgn", Some("guid-1"), "master.dgn")
            .unwrap();
        assert_eq!(db.find_document_by_guid("guid-1").unwrap().unwrap().id, doc.id);
        assert_eq!(
            db.find_document_by_path("/data/master.dgn").unwrap().unwrap().id,
            doc.id
        );
        assert_eq!(db.find_documents_by_normalized_name("master.dgn").unwrap().len(), 1);

        db.update_document(doc.id, "/moved/master.dgn", Some("guid-1"), "master.dgn")
            .unwrap();
        assert!(db.find_document_by_path("/data/master.dgn").unwrap().is_none());

        // GUIDs are unique when present.
        assert!(db.insert_document("/other.dgn", Some("guid-1"), "other.dgn").is_err());
        // but many documents may lack one
        db.insert_document("/a.dgn", None, "a.dgn").unwrap();
        db.insert_document("/b.dgn", None, "b.dgn").unwrap();
    }

    #[test]
    fn test_model_transform_persisted() {
        let db = test_db();
        let doc = db.insert_document("/m.dgn", None, "m.dgn").unwrap();
        let transform = AffineTransform::translation(crate::geo::Point3d::new(1.0, 2.0, 3.0));
        let mut m = new_model(doc.id, 0, 100);
        m.transform = Some(&transform);
        let id = db.insert_model(&m).unwrap();

        let stored = db.get_model(id).unwrap().unwrap();
        assert_eq!(stored.transform, Some(transform));
        assert_eq!(db.find_models_by_target(100).unwrap().len(), 1);

        db.update_model(id, "Renamed", None, 5).unwrap();
        let stored = db.find_model(doc.id, 0).unwrap().unwrap();
        assert_eq!(stored.source_model_name, "Renamed");
        assert_eq!(stored.transform, None);
        assert_eq!(stored.last_touched_run, 5);
    }

    #[test]
    fn test_element_touch_and_untouched() {
        let db = test_db();
        let doc = db.insert_document("/e.dgn", None, "e.dgn").unwrap();
        let model_id = db.insert_model(&new_model(doc.id, 0, 1)).unwrap();

        let a = db.upsert_element(model_id, 10, 1000, "fp-a", 1).unwrap();
        db.upsert_element(model_id, 11, 1001, "fp-b", 1).unwrap();

        db.touch_element(a.id, 2).unwrap();
        let stale = db.find_elements_not_touched_since(model_id, 2).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].source_element_id, 11);

        let updated = db.upsert_element(model_id, 10, 1000, "fp-a2", 3).unwrap();
        assert_eq!(updated.id, a.id);
        assert_eq!(updated.fingerprint, "fp-a2");

        db.delete_model(model_id).unwrap();
        assert_eq!(db.count_elements().unwrap(), 0);
    }

    #[test]
    fn test_geom_part_fingerprint_lookup() {
        let db = test_db();
        let d1 = db.insert_document("/1.dgn", None, "1.dgn").unwrap();
        let d2 = db.insert_document("/2.dgn", None, "2.dgn").unwrap();
        db.upsert_geom_part(d1.id, 5, 500, "same").unwrap();
        db.upsert_geom_part(d2.id, 9, 500, "same").unwrap();

        let first = db.find_geom_part_by_fingerprint("same").unwrap().unwrap();
        assert_eq!(first.document_id, d1.id);
        assert!(db.find_geom_part(d2.id, 9).unwrap().is_some());
    }
}
