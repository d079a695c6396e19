//! Conversion of one document.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};

use super::{commit_changes, ProgressAction, ProgressMonitor, RunDiagnostic, RunTally, TRANSFORM_TOLERANCE};
use crate::change::{ChangeDetector, ChangeKind, Fingerprint};
use crate::config::FontPolicy;
use crate::convert::ConversionContext;
use crate::definitions::DefinitionMapper;
use crate::errors::{JobError, TargetError};
use crate::geo::{AffineTransform, Gcs};
use crate::host::SyncHost;
use crate::identity::{IdentityStore, ModelMapping};
use crate::import_rules::target_model_name;
use crate::models::{ElementRecord, JobRecord, ModelRecord, TargetId};
use crate::reference::ResolvedDocument;
use crate::schema::TargetSchema;
use crate::source::{Geometry, InstanceData, SourceElement, SourceModel};
use crate::target::TargetWriter;

/// Converts the documents of one run, sharing definition and schema
/// lookups between them.
pub(super) struct DocumentPass<'r> {
    host: &'r SyncHost,
    store: &'r IdentityStore,
    job: &'r JobRecord,
    monitor: &'r dyn ProgressMonitor,
    target_gcs: Option<&'r Gcs>,
    root_transform: &'r AffineTransform,
    tally: &'r mut RunTally,
    defs: DefinitionMapper<'r>,
    schemas: HashMap<String, Option<TargetSchema>>,
}

impl<'r> DocumentPass<'r> {
    pub(super) fn new(
        host: &'r SyncHost,
        store: &'r IdentityStore,
        job: &'r JobRecord,
        monitor: &'r dyn ProgressMonitor,
        target_gcs: Option<&'r Gcs>,
        root_transform: &'r AffineTransform,
        tally: &'r mut RunTally,
    ) -> Self {
        let conversion = &host.config().conversion;
        let defs = DefinitionMapper::new(
            store,
            host.target(),
            job,
            conversion.level_copy,
            conversion.merge_definitions,
        );
        Self {
            host,
            store,
            job,
            monitor,
            target_gcs,
            root_transform,
            tally,
            defs,
            schemas: HashMap::new(),
        }
    }

    fn target(&self) -> &'r dyn TargetWriter {
        self.host.target()
    }

    fn commit(&mut self) -> Result<(), JobError> {
        commit_changes(self.store, self.target(), true)?;
        self.tally.committed_writes = self.target().write_count();
        Ok(())
    }

    /// Transform from `doc` coordinates to target coordinates. A reference
    /// with its own coordinate system is placed by it; anything else
    /// follows its attachment path from the root.
    fn document_transform(&self, doc: &ResolvedDocument) -> Result<AffineTransform, JobError> {
        if !doc.is_root {
            if let (Some(source), Some(target)) = (doc.source.gcs.as_ref(), self.target_gcs) {
                let method = self.host.config().geo.method;
                return Ok(self
                    .host
                    .geo()
                    .resolve_transform(Some(source), None, Some(target), method)?);
            }
        }
        Ok(self.root_transform.compose(&doc.path_transform))
    }

    /// `true` if the document's file stamp and placement are what this job
    /// saw last time, so none of its models need reading.
    fn is_unchanged(
        &self,
        doc: &ResolvedDocument,
        transform: &AffineTransform,
    ) -> Result<bool, JobError> {
        let Some(seen) = self.store.find_job_document(self.job.id, doc.record.id)? else {
            return Ok(false);
        };
        let source = &doc.source;
        if source.last_save_time.is_none()
            || seen.last_save_time != source.last_save_time
            || seen.file_size != source.file_size
        {
            return Ok(false);
        }
        let records = self.store.list_models_for_document(doc.record.id)?;
        Ok(source.models.iter().all(|model| {
            records.iter().any(|r| {
                r.source_model_id == model.id
                    && r.transform
                        .is_some_and(|t| t.approx_eq(transform, TRANSFORM_TOLERANCE))
            })
        }))
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    pub(super) fn convert_document(
        &mut self,
        doc: &ResolvedDocument,
    ) -> Result<ProgressAction, JobError> {
        let path = doc.source.path.as_str();
        if self.monitor.on_document(path) == ProgressAction::Abort {
            return Ok(ProgressAction::Abort);
        }
        let transform = self.document_transform(doc)?;
        if self.is_unchanged(doc, &transform)? {
            debug!(path, "document unchanged, skipped");
            self.tally.stats.documents_skipped += 1;
            return Ok(ProgressAction::Continue);
        }

        info!(path, document_id = doc.record.id, "converting document");
        for model in &doc.source.models {
            if self.monitor.on_model(path, &model.name) == ProgressAction::Abort {
                return Ok(ProgressAction::Abort);
            }
            self.convert_model(doc, model, &transform)?;
            self.commit()?;
        }

        self.delete_removed_models(doc)?;
        let purged = self.defs.purge_retired_parts()?;
        if purged > 0 {
            debug!(path, purged, "deleted unused geometry parts");
        }
        self.embed_fonts(doc)?;
        self.store.record_job_document(
            self.job.id,
            doc.record.id,
            doc.source.last_save_time.as_deref(),
            doc.source.file_size,
        )?;
        self.commit()?;
        self.tally.stats.documents_converted += 1;
        Ok(ProgressAction::Continue)
    }

    /// Delete target models of source models that no longer exist. Only
    /// models this job created are touched.
    fn delete_removed_models(&mut self, doc: &ResolvedDocument) -> Result<(), JobError> {
        for record in self.store.list_models_for_document(doc.record.id)? {
            if doc.source.model(record.source_model_id).is_some()
                || record.job_id != Some(self.job.id)
            {
                continue;
            }
            self.target().delete_model(record.target_model_id)?;
            self.store.delete_model(&record)?;
            self.tally.stats.models_deleted += 1;
            info!(
                document = %doc.source.path,
                model = %record.source_model_name,
                "deleted model removed from source"
            );
        }
        Ok(())
    }

    fn embed_fonts(&mut self, doc: &ResolvedDocument) -> Result<(), JobError> {
        let conversion = &self.host.config().conversion;
        let used: BTreeSet<&str> = doc
            .source
            .models
            .iter()
            .flat_map(|m| m.elements.iter())
            .filter_map(|e| e.symbology.font.as_deref())
            .collect();
        let mut wanted: BTreeSet<&str> = doc
            .source
            .fonts
            .iter()
            .map(String::as_str)
            .filter(|f| conversion.font_policy(f) == FontPolicy::Always)
            .collect();
        wanted.extend(
            used.into_iter()
                .filter(|f| conversion.font_policy(f) != FontPolicy::Never),
        );

        let target = self.target();
        for font in wanted {
            if !target.has_font(font)? {
                target.embed_font(font)?;
                self.tally.stats.fonts_embedded += 1;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Models
    // -----------------------------------------------------------------------

    /// Find or create the target model for `model`. `None` if another job
    /// owns it.
    fn map_model(
        &mut self,
        doc: &ResolvedDocument,
        model: &SourceModel,
        transform: &AffineTransform,
    ) -> Result<Option<(ModelRecord, bool)>, JobError> {
        let target = self.target();
        let existing = self.store.find_model(doc.record.id, model.id)?;
        if let Some(owner) = existing.as_ref().and_then(|r| r.job_id) {
            if owner != self.job.id {
                warn!(document = %doc.source.path, model = %model.name, owner, "model owned by another job");
                self.tally.diagnostics.push(RunDiagnostic::ForeignModel {
                    document: doc.source.path.clone(),
                    model: model.name.clone(),
                });
                return Ok(None);
            }
        }

        let rules = &self.host.config().conversion.import_rules;
        let name = target_model_name(rules, &doc.source.path, &model.name, doc.is_root);
        let target_model_id = match &existing {
            Some(record) => {
                if let Some(current) = target.model_name(record.target_model_id)? {
                    if current != name {
                        target.rename_model(record.target_model_id, &name)?;
                    }
                }
                record.target_model_id
            }
            None => target.insert_model(
                Some(self.job.subject_id),
                &name,
                model.kind,
                model.dimensionality,
            )?,
        };
        let force_update = existing.as_ref().is_some_and(|r| {
            r.transform
                .map_or(true, |t| !t.approx_eq(transform, TRANSFORM_TOLERANCE))
        });
        if force_update {
            info!(document = %doc.source.path, model = %model.name, "placement changed, updating every element");
        }

        let is_root = doc.is_root
            && doc
                .source
                .default_model_id
                .map_or(true, |id| id == model.id);
        let record = self.store.record_model(&ModelMapping {
            document_id: doc.record.id,
            source_model_id: model.id,
            source_model_name: &model.name,
            target_model_id,
            is_root,
            dimensionality: model.dimensionality,
            kind: model.kind,
            job_id: Some(self.job.id),
            transform: Some(transform),
        })?;
        Ok(Some((record, force_update)))
    }

    fn convert_model(
        &mut self,
        doc: &ResolvedDocument,
        model: &SourceModel,
        transform: &AffineTransform,
    ) -> Result<(), JobError> {
        let Some((record, force_update)) = self.map_model(doc, model, transform)? else {
            return Ok(());
        };
        let target = self.target();
        let mut detector = ChangeDetector::begin_model(self.store, record.id, force_update)?;

        for element in &model.elements {
            let part = match &element.geometry {
                Geometry::CellInstance { definition_id, .. } => {
                    self.defs.geom_part(doc.record.id, &doc.source, *definition_id)?
                }
                _ => None,
            };
            let fingerprint = match Fingerprint::of_element(element, part.as_ref().map(|(_, f)| f)) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    self.discarded(doc, element, &e.to_string());
                    continue;
                }
            };
            let Some(classified) = detector.classify(element.id, fingerprint)? else {
                continue;
            };

            if let Some(discard) = self.store.find_discard(record.id, element.id)? {
                if discard.fingerprint == classified.fingerprint.as_str() && !force_update {
                    if let Some(prior) = &classified.prior {
                        detector.confirm(prior)?;
                    }
                    self.tally.stats.discarded += 1;
                    continue;
                }
            }

            match classified.kind {
                ChangeKind::Delete => {
                    if let Some(prior) = &classified.prior {
                        self.remove_element(record.target_model_id, prior)?;
                    }
                }
                ChangeKind::Unchanged => {
                    if let Some(prior) = &classified.prior {
                        detector.confirm(prior)?;
                    }
                    self.tally.stats.unchanged += 1;
                }
                ChangeKind::Insert | ChangeKind::Update => {
                    let ctx = ConversionContext {
                        document_path: &doc.source.path,
                        transform,
                        category_id: self.defs.category_for_level(
                            doc.record.id,
                            &doc.source,
                            doc.is_root,
                            element.symbology.level_id,
                        )?,
                        line_style_id: element
                            .symbology
                            .line_style_id
                            .map(|id| self.defs.line_style(doc.record.id, &doc.source, id))
                            .transpose()?
                            .flatten(),
                        geom_part_id: part.as_ref().map(|(id, _)| *id),
                        properties: element
                            .properties
                            .as_ref()
                            .map(|data| self.remap_properties(data))
                            .transpose()?,
                    };
                    let mut converted = match self.host.converters().convert(element, &ctx) {
                        Ok(converted) => converted,
                        Err(e) => {
                            self.store.record_discard(
                                record.id,
                                element.id,
                                classified.fingerprint.as_str(),
                                &e.to_string(),
                            )?;
                            if let Some(prior) = &classified.prior {
                                detector.confirm(prior)?;
                            }
                            self.discarded(doc, element, &e.to_string());
                            continue;
                        }
                    };

                    let own = classified.prior.as_ref().map(|p| p.target_element_id);
                    if let Some(code) = converted.code.take() {
                        converted.code =
                            self.unique_code(doc, element, record.target_model_id, code, own)?;
                    }

                    let target_element_id = match own {
                        Some(id) => match target.update_element(id, &converted) {
                            Ok(()) => id,
                            Err(TargetError::NotFound { .. }) => {
                                warn!(element_id = id, "target element vanished, inserting again");
                                target.insert_element(record.target_model_id, &converted)?
                            }
                            Err(e) => return Err(e.into()),
                        },
                        None => target.insert_element(record.target_model_id, &converted)?,
                    };
                    detector.record(element.id, target_element_id, &classified.fingerprint)?;
                    self.store.clear_discard(record.id, element.id)?;

                    if let Some(bbox) = converted.placement.bbox {
                        self.tally.extents.extend(&bbox);
                    }
                    self.tally.changed_models.insert(record.target_model_id);
                    if classified.kind == ChangeKind::Insert {
                        self.tally.stats.inserted += 1;
                    } else {
                        self.tally.stats.updated += 1;
                    }
                }
            }
        }

        for stale in detector.finish()? {
            self.remove_element(record.target_model_id, &stale)?;
        }
        self.tally.stats.models_converted += 1;
        debug!(
            document = %doc.source.path,
            model = %model.name,
            target_model_id = record.target_model_id,
            "model converted"
        );
        Ok(())
    }

    fn remove_element(&mut self, model_id: TargetId, stale: &ElementRecord) -> Result<(), JobError> {
        self.target().delete_element(stale.target_element_id)?;
        self.store.delete_element(stale)?;
        self.tally.changed_models.insert(model_id);
        self.tally.stats.deleted += 1;
        Ok(())
    }

    fn discarded(&mut self, doc: &ResolvedDocument, element: &SourceElement, reason: &str) {
        self.tally.stats.discarded += 1;
        self.tally.diagnostics.push(RunDiagnostic::ElementDiscarded {
            document: doc.source.path.clone(),
            source_element_id: element.id,
            reason: reason.to_string(),
        });
    }

    /// Instance values under the property names of the imported schema.
    fn remap_properties(
        &mut self,
        data: &InstanceData,
    ) -> Result<BTreeMap<String, serde_json::Value>, JobError> {
        if !self.schemas.contains_key(&data.schema) {
            let schema = self.target().find_schema(&data.schema)?;
            self.schemas.insert(data.schema.clone(), schema);
        }
        Ok(match self.schemas.get(&data.schema) {
            Some(Some(schema)) => schema.remap_instance(data),
            _ => data.values.clone(),
        })
    }

    /// `code` if no other element of the model uses it. Otherwise the first
    /// free `code-N` when cloning duplicates, or no code at all.
    fn unique_code(
        &mut self,
        doc: &ResolvedDocument,
        element: &SourceElement,
        model_id: TargetId,
        code: String,
        own: Option<TargetId>,
    ) -> Result<Option<String>, JobError> {
        let target = self.target();
        let free = |candidate: &str| -> Result<bool, JobError> {
            Ok(match target.find_element_by_code(model_id, candidate)? {
                None => true,
                Some(holder) => Some(holder) == own,
            })
        };
        if free(&code)? {
            return Ok(Some(code));
        }

        let assigned = if self.host.config().conversion.clone_duplicate_codes {
            let mut n = 2;
            let mut candidate = format!("{code}-{n}");
            while !free(&candidate)? {
                n += 1;
                candidate = format!("{code}-{n}");
            }
            Some(candidate)
        } else {
            None
        };
        warn!(
            document = %doc.source.path,
            source_element_id = element.id,
            code = %code,
            assigned = ?assigned,
            "duplicate element code"
        );
        self.tally.diagnostics.push(RunDiagnostic::CodeCollision {
            document: doc.source.path.clone(),
            source_element_id: element.id,
            code,
            assigned: assigned.clone(),
        });
        Ok(assigned)
    }
}
