//! The persistent identity store.
//!
//! [`IdentityStore`] owns every mapping between source and target identity:
//! documents, models, elements, schema versions, jobs and geometry parts.
//! All mutations happen inside the run transaction opened on the shared
//! [`Database`] and append one row to the run log.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::recipe::{normalize_with, Recipe};
use crate::db::queries::NewModel;
use crate::db::schema::IDENTITY_TABLES;
use crate::db::Database;
use crate::errors::StoreError;
use crate::geo::AffineTransform;
use crate::models::{
    Dimensionality, DiscardRecord, DocumentRecord, ElementRecord, GeomPartRecord,
    JobDocumentRecord, JobRecord, ModelKind, ModelRecord, RunToken, SchemaVersionRecord, TargetId,
};

/// How documents are matched to existing records.
#[derive(Debug, Clone, Default)]
pub struct IdentityOptions {
    /// Match documents by recipe-normalized basename when no GUID matches.
    pub match_basenames: bool,
    pub recipe: Option<Recipe>,
}

/// Parameters for [`IdentityStore::record_model`].
#[derive(Debug, Clone)]
pub struct ModelMapping<'a> {
    pub document_id: i64,
    pub source_model_id: i64,
    pub source_model_name: &'a str,
    pub target_model_id: TargetId,
    pub is_root: bool,
    pub dimensionality: Dimensionality,
    pub kind: ModelKind,
    pub job_id: Option<i64>,
    pub transform: Option<&'a AffineTransform>,
}

impl ModelMapping<'_> {
    fn is_spatial_root(&self) -> bool {
        self.is_root && self.dimensionality == Dimensionality::ThreeD && self.kind == ModelKind::Normal
    }
}

pub struct IdentityStore {
    db: Arc<Database>,
    options: IdentityOptions,
    run_token: Option<RunToken>,
}

impl IdentityStore {
    /// Open the store on an initialized database. Fails with
    /// [`StoreError::StoreUnavailable`] if any mapping table is missing.
    pub fn open(db: Arc<Database>, options: IdentityOptions) -> Result<Self, StoreError> {
        let missing = db.missing_tables(IDENTITY_TABLES)?;
        if !missing.is_empty() {
            return Err(StoreError::StoreUnavailable(format!(
                "missing tables: {}",
                missing.join(", ")
            )));
        }
        Ok(Self {
            db,
            options,
            run_token: None,
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn options(&self) -> &IdentityOptions {
        &self.options
    }

    // -----------------------------------------------------------------------
    // Runs and transactions
    // -----------------------------------------------------------------------

    /// Register a run and open its write transaction. The run row itself is
    /// committed immediately so aborted runs stay visible in the registry,
    /// which is why no transaction may be open here.
    pub fn begin_run(&mut self, bridge_key: &str, root_path: &str) -> Result<RunToken, StoreError> {
        if self.db.in_transaction() {
            return Err(StoreError::TransactionOpen);
        }
        let label = uuid::Uuid::new_v4().to_string();
        let token = self.db.insert_run(&label, bridge_key, root_path, "created")?;
        self.db.begin()?;
        self.run_token = Some(token);
        info!(token, label = %label, bridge_key, root_path, "run started");
        Ok(token)
    }

    /// Token of the active run.
    pub fn run_token(&self) -> Result<RunToken, StoreError> {
        self.run_token.ok_or(StoreError::NoActiveRun)
    }

    /// Close the active run and record its final state. Call after the run
    /// transaction was committed or abandoned.
    pub fn finish_run(
        &mut self,
        state: &str,
        had_changes: bool,
        summary: Option<&str>,
    ) -> Result<(), StoreError> {
        let token = self.run_token()?;
        self.db.complete_run(token, state, had_changes, summary)?;
        self.run_token = None;
        info!(token, state, had_changes, "run finished");
        Ok(())
    }

    /// Open a write transaction if none is open.
    pub fn begin_changes(&self) -> Result<(), StoreError> {
        self.db.begin()?;
        Ok(())
    }

    pub fn save_changes(&self) -> Result<(), StoreError> {
        self.db.save_changes()?;
        Ok(())
    }

    pub fn abandon_changes(&self) -> Result<(), StoreError> {
        self.db.abandon_changes()?;
        Ok(())
    }

    fn log(&self, table: &str, record_id: i64, action: &str) -> Result<(), StoreError> {
        let token = self.run_token()?;
        self.db.append_run_log(token, table, record_id, action)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    /// Normalized basename of `path` under the configured recipe.
    pub fn normalize(&self, path: &str) -> String {
        normalize_with(self.options.recipe.as_ref(), path)
    }

    /// Resolve a document to its record: embedded GUID first, then
    /// recipe-normalized basename when enabled, then exact path.
    ///
    /// Two rules resolving to different records is reported as
    /// [`StoreError::DuplicateIdentity`].
    pub fn find_document(
        &self,
        path: &str,
        guid: Option<&str>,
    ) -> Result<Option<DocumentRecord>, StoreError> {
        let by_path = self.db.find_document_by_path(path)?;

        if let Some(guid) = guid {
            if let Some(found) = self.db.find_document_by_guid(guid)? {
                if let Some(other) = by_path.as_ref().filter(|p| p.id != found.id) {
                    return Err(StoreError::DuplicateIdentity {
                        path: path.to_string(),
                        first: found.id,
                        second: other.id,
                    });
                }
                debug!(id = found.id, guid, "document matched by guid");
                return Ok(Some(found));
            }
        }

        if self.options.match_basenames {
            let name = self.normalize(path);
            let candidates: Vec<DocumentRecord> = self
                .db
                .find_documents_by_normalized_name(&name)?
                .into_iter()
                .filter(|c| match (&c.source_guid, guid) {
                    (Some(existing), Some(incoming)) => existing == incoming,
                    _ => true,
                })
                .collect();
            match candidates.as_slice() {
                [] => {}
                [only] => {
                    if let Some(other) = by_path.as_ref().filter(|p| p.id != only.id) {
                        return Err(StoreError::DuplicateIdentity {
                            path: path.to_string(),
                            first: only.id,
                            second: other.id,
                        });
                    }
                    debug!(id = only.id, name = %name, "document matched by basename");
                    return Ok(Some(only.clone()));
                }
                [first, second, ..] => {
                    return Err(StoreError::DuplicateIdentity {
                        path: path.to_string(),
                        first: first.id,
                        second: second.id,
                    });
                }
            }
        }

        Ok(by_path)
    }

    /// Find or create the record for a document. Idempotent.
    ///
    /// A GUID match at a new path moves the record to that path. A record
    /// matched without a GUID adopts the incoming one.
    pub fn record_document(
        &self,
        path: &str,
        guid: Option<&str>,
    ) -> Result<DocumentRecord, StoreError> {
        let normalized = self.normalize(path);
        match self.find_document(path, guid)? {
            Some(existing) => {
                let guid_matched = guid.is_some() && existing.source_guid.as_deref() == guid;
                let moved = guid_matched && existing.source_path != path;
                let adopts_guid = existing.source_guid.is_none() && guid.is_some();
                if !moved && !adopts_guid {
                    return Ok(existing);
                }
                let new_path = if moved { path } else { existing.source_path.as_str() };
                let new_guid = guid.or(existing.source_guid.as_deref());
                let new_name = if moved { normalized } else { existing.normalized_name.clone() };
                self.db
                    .update_document(existing.id, new_path, new_guid, &new_name)?;
                self.log("documents", existing.id, "update")?;
                if moved {
                    info!(id = existing.id, from = %existing.source_path, to = path, "document moved");
                }
                Ok(DocumentRecord {
                    source_path: new_path.to_string(),
                    source_guid: new_guid.map(str::to_string),
                    normalized_name: new_name,
                    ..existing
                })
            }
            None => {
                let record = self.db.insert_document(path, guid, &normalized)?;
                self.log("documents", record.id, "insert")?;
                debug!(id = record.id, path, "recorded new document");
                Ok(record)
            }
        }
    }

    pub fn get_document(&self, id: i64) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.db.get_document(id)?)
    }

    /// Remove a document record along with its models, elements and
    /// schema records.
    pub fn delete_document(&self, id: i64) -> Result<(), StoreError> {
        self.db.delete_document(id)?;
        self.log("documents", id, "delete")?;
        info!(id, "deleted document record");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Models
    // -----------------------------------------------------------------------

    pub fn find_model(
        &self,
        document_id: i64,
        source_model_id: i64,
    ) -> Result<Option<ModelRecord>, StoreError> {
        Ok(self.db.find_model(document_id, source_model_id)?)
    }

    pub fn list_models_for_document(&self, document_id: i64) -> Result<Vec<ModelRecord>, StoreError> {
        Ok(self.db.list_models_for_document(document_id)?)
    }

    /// Map a source model onto a target model.
    ///
    /// Re-recording an identical mapping refreshes it. Remapping a source
    /// model to a different target, or mapping a second source model onto a
    /// spatial root target model, fails with
    /// [`StoreError::DuplicateModelMapping`].
    pub fn record_model(&self, mapping: &ModelMapping<'_>) -> Result<ModelRecord, StoreError> {
        let token = self.run_token()?;
        let duplicate = |detail: String| StoreError::DuplicateModelMapping {
            document_id: mapping.document_id,
            source_model_id: mapping.source_model_id,
            target_model_id: mapping.target_model_id,
            detail,
        };

        if let Some(existing) = self.db.find_model(mapping.document_id, mapping.source_model_id)? {
            if existing.target_model_id != mapping.target_model_id {
                return Err(duplicate(format!(
                    "source model already mapped to target model {}",
                    existing.target_model_id
                )));
            }
            self.db.update_model(
                existing.id,
                mapping.source_model_name,
                mapping.transform,
                token,
            )?;
            return Ok(ModelRecord {
                source_model_name: mapping.source_model_name.to_string(),
                transform: mapping.transform.copied(),
                last_touched_run: token,
                ..existing
            });
        }

        let sharing = self.db.find_models_by_target(mapping.target_model_id)?;
        if let Some(root) = sharing.iter().find(|m| m.is_spatial_root()) {
            return Err(duplicate(format!(
                "spatial root target model already receives document {} model {}",
                root.document_id, root.source_model_id
            )));
        }
        if mapping.is_spatial_root() && !sharing.is_empty() {
            return Err(duplicate(
                "spatial root target model is already shared by other source models".into(),
            ));
        }

        let id = self.db.insert_model(&NewModel {
            document_id: mapping.document_id,
            source_model_id: mapping.source_model_id,
            source_model_name: mapping.source_model_name,
            target_model_id: mapping.target_model_id,
            is_root: mapping.is_root,
            dimensionality: mapping.dimensionality,
            kind: mapping.kind,
            job_id: mapping.job_id,
            transform: mapping.transform,
            run_token: token,
        })?;
        self.log("models", id, "insert")?;
        Ok(ModelRecord {
            id,
            document_id: mapping.document_id,
            source_model_id: mapping.source_model_id,
            source_model_name: mapping.source_model_name.to_string(),
            target_model_id: mapping.target_model_id,
            is_root: mapping.is_root,
            dimensionality: mapping.dimensionality,
            kind: mapping.kind,
            job_id: mapping.job_id,
            transform: mapping.transform.copied(),
            last_touched_run: token,
        })
    }

    /// Remove a model mapping and every element mapped under it.
    pub fn delete_model(&self, model: &ModelRecord) -> Result<(), StoreError> {
        self.db.delete_model(model.id)?;
        self.log("models", model.id, "delete")?;
        debug!(id = model.id, target_model_id = model.target_model_id, "deleted model mapping");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Elements
    // -----------------------------------------------------------------------

    pub fn find_element(
        &self,
        model_id: i64,
        source_element_id: i64,
    ) -> Result<Option<ElementRecord>, StoreError> {
        Ok(self.db.find_element(model_id, source_element_id)?)
    }

    /// Insert or update an element mapping and mark it touched by this run.
    pub fn upsert_element(
        &self,
        model_id: i64,
        source_element_id: i64,
        target_element_id: TargetId,
        fingerprint: &str,
    ) -> Result<ElementRecord, StoreError> {
        let token = self.run_token()?;
        let existed = self.db.find_element(model_id, source_element_id)?.is_some();
        let record = self.db.upsert_element(
            model_id,
            source_element_id,
            target_element_id,
            fingerprint,
            token,
        )?;
        self.log("elements", record.id, if existed { "update" } else { "insert" })?;
        Ok(record)
    }

    /// Mark an unchanged element as seen by this run. Not logged: the
    /// touched marker is run bookkeeping, not a mapping change.
    pub fn touch_element(&self, record: &ElementRecord) -> Result<(), StoreError> {
        let token = self.run_token()?;
        if record.last_touched_run != token {
            self.db.touch_element(record.id, token)?;
        }
        Ok(())
    }

    pub fn delete_element(&self, record: &ElementRecord) -> Result<(), StoreError> {
        self.db.delete_element(record.id)?;
        self.log("elements", record.id, "delete")?;
        Ok(())
    }

    /// Deletion candidates: elements of `model_id` last touched before
    /// `run_token`.
    pub fn find_elements_not_touched_since(
        &self,
        model_id: i64,
        run_token: RunToken,
    ) -> Result<Vec<ElementRecord>, StoreError> {
        Ok(self.db.find_elements_not_touched_since(model_id, run_token)?)
    }

    // -----------------------------------------------------------------------
    // Discards
    // -----------------------------------------------------------------------

    pub fn find_discard(
        &self,
        model_id: i64,
        source_element_id: i64,
    ) -> Result<Option<DiscardRecord>, StoreError> {
        Ok(self.db.find_discard(model_id, source_element_id)?)
    }

    pub fn record_discard(
        &self,
        model_id: i64,
        source_element_id: i64,
        fingerprint: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        let token = self.run_token()?;
        self.db.upsert_discard(&DiscardRecord {
            model_id,
            source_element_id,
            fingerprint: fingerprint.to_string(),
            reason: reason.to_string(),
            run_token: token,
        })?;
        self.log("discards", source_element_id, "upsert")?;
        warn!(model_id, source_element_id, reason, "element discarded");
        Ok(())
    }

    pub fn clear_discard(&self, model_id: i64, source_element_id: i64) -> Result<(), StoreError> {
        if self.db.delete_discard(model_id, source_element_id)? {
            self.log("discards", source_element_id, "delete")?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Schema versions
    // -----------------------------------------------------------------------

    pub fn find_schema_version(
        &self,
        schema_name: &str,
        document_id: i64,
    ) -> Result<Option<SchemaVersionRecord>, StoreError> {
        Ok(self.db.find_schema_version(schema_name, document_id)?)
    }

    pub fn list_schema_versions(
        &self,
        schema_name: &str,
    ) -> Result<Vec<SchemaVersionRecord>, StoreError> {
        Ok(self.db.list_schema_versions(schema_name)?)
    }

    pub fn record_schema_version(
        &self,
        schema_name: &str,
        document_id: i64,
        version: (u32, u32),
        checksum: &str,
        imported: bool,
    ) -> Result<(), StoreError> {
        let id = self.db.upsert_schema_version(
            schema_name,
            document_id,
            version.0,
            version.1,
            checksum,
            imported,
        )?;
        self.log("schema_versions", id, "upsert")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub fn find_job(
        &self,
        bridge_key: &str,
        root_document_id: i64,
    ) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.db.find_job(bridge_key, root_document_id)?)
    }

    pub fn record_job(
        &self,
        bridge_key: &str,
        root_document_id: i64,
        subject_id: TargetId,
        definition_model_id: TargetId,
    ) -> Result<JobRecord, StoreError> {
        let job = self
            .db
            .insert_job(bridge_key, root_document_id, subject_id, definition_model_id)?;
        self.log("jobs", job.id, "insert")?;
        Ok(job)
    }

    pub fn list_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.db.list_jobs()?)
    }

    pub fn find_job_document(
        &self,
        job_id: i64,
        document_id: i64,
    ) -> Result<Option<JobDocumentRecord>, StoreError> {
        Ok(self.db.find_job_document(job_id, document_id)?)
    }

    /// Remember that `document_id` was seen by `job_id` in this run, with the
    /// file stamp it had.
    pub fn record_job_document(
        &self,
        job_id: i64,
        document_id: i64,
        last_save_time: Option<&str>,
        file_size: Option<i64>,
    ) -> Result<(), StoreError> {
        let token = self.run_token()?;
        self.db.upsert_job_document(&JobDocumentRecord {
            job_id,
            document_id,
            last_save_time: last_save_time.map(str::to_string),
            file_size,
            last_seen_run: token,
        })?;
        Ok(())
    }

    pub fn list_job_documents(&self, job_id: i64) -> Result<Vec<JobDocumentRecord>, StoreError> {
        Ok(self.db.list_job_documents(job_id)?)
    }

    pub fn forget_job_document(&self, job_id: i64, document_id: i64) -> Result<(), StoreError> {
        self.db.delete_job_document(job_id, document_id)?;
        self.log("job_documents", document_id, "delete")?;
        Ok(())
    }

    /// `true` if a job other than `job_id` still converts `document_id`.
    pub fn document_used_by_other_jobs(
        &self,
        job_id: i64,
        document_id: i64,
    ) -> Result<bool, StoreError> {
        Ok(self.db.count_other_jobs_for_document(job_id, document_id)? > 0)
    }

    // -----------------------------------------------------------------------
    // Geometry parts
    // -----------------------------------------------------------------------

    /// Mapping for a shared definition: this document's own first, then any
    /// document whose definition has identical content.
    pub fn find_geom_part(
        &self,
        document_id: i64,
        source_definition_id: i64,
        fingerprint: &str,
    ) -> Result<Option<GeomPartRecord>, StoreError> {
        if let Some(own) = self.db.find_geom_part(document_id, source_definition_id)? {
            if own.fingerprint == fingerprint {
                return Ok(Some(own));
            }
        }
        Ok(self.db.find_geom_part_by_fingerprint(fingerprint)?)
    }

    /// The mapping recorded for this document's own definition, whatever
    /// its content.
    pub fn own_geom_part(
        &self,
        document_id: i64,
        source_definition_id: i64,
    ) -> Result<Option<GeomPartRecord>, StoreError> {
        Ok(self.db.find_geom_part(document_id, source_definition_id)?)
    }

    /// `true` while any document mapping still points at the target part.
    pub fn geom_part_in_use(&self, target_geom_part_id: TargetId) -> Result<bool, StoreError> {
        Ok(self.db.count_geom_part_mappings(target_geom_part_id)? > 0)
    }

    pub fn record_geom_part(
        &self,
        document_id: i64,
        source_definition_id: i64,
        target_geom_part_id: TargetId,
        fingerprint: &str,
    ) -> Result<GeomPartRecord, StoreError> {
        let record = self.db.upsert_geom_part(
            document_id,
            source_definition_id,
            target_geom_part_id,
            fingerprint,
        )?;
        self.log("geom_parts", record.id, "upsert")?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Level map and shared state
    // -----------------------------------------------------------------------

    pub fn find_level_category(
        &self,
        job_id: i64,
        document_id: i64,
        source_level_id: i64,
    ) -> Result<Option<TargetId>, StoreError> {
        Ok(self
            .db
            .find_level_category(job_id, document_id, source_level_id)?)
    }

    pub fn record_level_category(
        &self,
        job_id: i64,
        document_id: i64,
        source_level_id: i64,
        category_id: TargetId,
    ) -> Result<(), StoreError> {
        self.db
            .upsert_level_category(job_id, document_id, source_level_id, category_id)?;
        self.log("level_map", source_level_id, "upsert")?;
        Ok(())
    }

    pub fn shared_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.db.get_state(key)?)
    }

    pub fn set_shared_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.db.set_state(key, value)?;
        Ok(())
    }
}
