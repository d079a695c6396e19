//! Definitions shared by converted elements: categories from levels, line
//! styles and geometry parts.
//!
//! Each job owns a private definition model holding its `Default`
//! category. Level categories and line styles go to the same model, or to
//! one pool shared by every bridge when definitions are merged.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::change::Fingerprint;
use crate::config::LevelCopyPolicy;
use crate::errors::{JobError, TargetError};
use crate::identity::IdentityStore;
use crate::models::{Dimensionality, GeomPartRecord, JobRecord, ModelKind, TargetId};
use crate::source::SourceDocument;
use crate::target::{DefinitionKind, TargetWriter};

/// Name of the per-job fallback category.
pub const DEFAULT_CATEGORY: &str = "Default";

/// Shared state key holding the target model id of the merged pool.
const SHARED_POOL_KEY: &str = "shared_definition_model";

const SHARED_POOL_NAME: &str = "Shared Definitions";

/// Maps source definitions to target definitions for one job.
pub struct DefinitionMapper<'a> {
    store: &'a IdentityStore,
    target: &'a dyn TargetWriter,
    job: &'a JobRecord,
    policy: LevelCopyPolicy,
    merge: bool,
    pool: Option<TargetId>,
    line_styles: HashMap<(i64, i64), TargetId>,
    /// Parts replaced by a changed definition, deleted by
    /// [`DefinitionMapper::purge_retired_parts`] once unused.
    retired_parts: Vec<TargetId>,
}

impl<'a> DefinitionMapper<'a> {
    pub fn new(
        store: &'a IdentityStore,
        target: &'a dyn TargetWriter,
        job: &'a JobRecord,
        policy: LevelCopyPolicy,
        merge: bool,
    ) -> Self {
        Self {
            store,
            target,
            job,
            policy,
            merge,
            pool: None,
            line_styles: HashMap::new(),
            retired_parts: Vec::new(),
        }
    }

    /// Model receiving level categories and line styles.
    pub fn pool_model(&mut self) -> Result<TargetId, JobError> {
        if let Some(pool) = self.pool {
            return Ok(pool);
        }
        let pool = if !self.merge {
            self.job.definition_model_id
        } else if let Some(id) = self
            .store
            .shared_state(SHARED_POOL_KEY)?
            .and_then(|v| v.parse::<TargetId>().ok())
        {
            id
        } else {
            let id = self.target.insert_model(
                None,
                SHARED_POOL_NAME,
                ModelKind::Normal,
                Dimensionality::ThreeD,
            )?;
            self.store.set_shared_state(SHARED_POOL_KEY, &id.to_string())?;
            info!(model_id = id, "created shared definition pool");
            id
        };
        self.pool = Some(pool);
        Ok(pool)
    }

    /// The job's private `Default` category, created on first use.
    pub fn default_category(&self) -> Result<TargetId, JobError> {
        find_or_insert(
            self.target,
            self.job.definition_model_id,
            DefinitionKind::Category,
            DEFAULT_CATEGORY,
            None,
        )
    }

    /// Category for `level_id` of `document`. Unknown levels fall back to
    /// the job's `Default` category.
    pub fn category_for_level(
        &mut self,
        document_id: i64,
        source: &SourceDocument,
        is_root: bool,
        level_id: i64,
    ) -> Result<TargetId, JobError> {
        if let Some(id) = self
            .store
            .find_level_category(self.job.id, document_id, level_id)?
        {
            return Ok(id);
        }
        let Some(level) = source.level(level_id) else {
            return self.default_category();
        };

        let pool = self.pool_model()?;
        let appearance = serde_json::to_value(&level.appearance).map_err(TargetError::from)?;
        let qualified = format!("{} ({})", level.name, source.basename());
        let name = if is_root {
            level.name.clone()
        } else {
            match self.policy {
                LevelCopyPolicy::Never => level.name.clone(),
                LevelCopyPolicy::Always => qualified,
                LevelCopyPolicy::IfDifferent => {
                    match self
                        .target
                        .find_definition(pool, DefinitionKind::Category, &level.name)?
                    {
                        Some(existing) if existing.appearance.as_ref() != Some(&appearance) => {
                            qualified
                        }
                        _ => level.name.clone(),
                    }
                }
            }
        };

        let id = find_or_insert(
            self.target,
            pool,
            DefinitionKind::Category,
            &name,
            Some(&appearance),
        )?;
        self.store
            .record_level_category(self.job.id, document_id, level_id, id)?;
        debug!(document_id, level_id, category = %name, id, "mapped level");
        Ok(id)
    }

    /// Line style for `line_style_id` of `document`, if the document
    /// defines it.
    pub fn line_style(
        &mut self,
        document_id: i64,
        source: &SourceDocument,
        line_style_id: i64,
    ) -> Result<Option<TargetId>, JobError> {
        if let Some(id) = self.line_styles.get(&(document_id, line_style_id)) {
            return Ok(Some(*id));
        }
        let Some(style) = source.line_style(line_style_id) else {
            return Ok(None);
        };
        let pool = self.pool_model()?;
        let pattern = serde_json::json!({ "pattern": style.pattern });
        let id = find_or_insert(
            self.target,
            pool,
            DefinitionKind::LineStyle,
            &style.name,
            Some(&pattern),
        )?;
        self.line_styles.insert((document_id, line_style_id), id);
        Ok(Some(id))
    }

    /// Geometry part for shared cell `definition_id`, with the content
    /// fingerprint of the definition. Parts are shared by every document
    /// whose definition has the same content. `None` if the document does
    /// not define the cell.
    ///
    /// A changed definition is mapped to another part; the one it used
    /// before is retired.
    pub fn geom_part(
        &mut self,
        document_id: i64,
        source: &SourceDocument,
        definition_id: i64,
    ) -> Result<Option<(TargetId, Fingerprint)>, JobError> {
        let Some(cell) = source.shared_cell(definition_id) else {
            return Ok(None);
        };
        let fingerprint =
            Fingerprint::of("geom_part", &cell.geometry).map_err(TargetError::from)?;
        let previous = self.store.own_geom_part(document_id, definition_id)?;
        if let Some(record) =
            self.store
                .find_geom_part(document_id, definition_id, fingerprint.as_str())?
        {
            if record.document_id != document_id || record.source_definition_id != definition_id {
                self.store.record_geom_part(
                    document_id,
                    definition_id,
                    record.target_geom_part_id,
                    fingerprint.as_str(),
                )?;
            }
            self.retire(previous, record.target_geom_part_id);
            return Ok(Some((record.target_geom_part_id, fingerprint)));
        }
        let part_id = self.target.insert_geom_part(&cell.name, &cell.geometry)?;
        self.store
            .record_geom_part(document_id, definition_id, part_id, fingerprint.as_str())?;
        debug!(document_id, definition_id, part_id, "created geometry part");
        self.retire(previous, part_id);
        Ok(Some((part_id, fingerprint)))
    }

    fn retire(&mut self, previous: Option<GeomPartRecord>, current: TargetId) {
        if let Some(old) = previous.filter(|p| p.target_geom_part_id != current) {
            if !self.retired_parts.contains(&old.target_geom_part_id) {
                self.retired_parts.push(old.target_geom_part_id);
            }
        }
    }

    /// Delete retired parts that no document maps to and no element uses.
    /// Parts still in use stay retired for a later call.
    pub fn purge_retired_parts(&mut self) -> Result<usize, JobError> {
        let mut purged = 0;
        let mut kept = Vec::new();
        for part_id in std::mem::take(&mut self.retired_parts) {
            if self.store.geom_part_in_use(part_id)? || !self.target.delete_geom_part(part_id)? {
                kept.push(part_id);
                continue;
            }
            debug!(part_id, "deleted retired geometry part");
            purged += 1;
        }
        self.retired_parts = kept;
        Ok(purged)
    }
}

fn find_or_insert(
    target: &dyn TargetWriter,
    model_id: TargetId,
    kind: DefinitionKind,
    name: &str,
    appearance: Option<&serde_json::Value>,
) -> Result<TargetId, JobError> {
    if let Some(existing) = target.find_definition(model_id, kind, name)? {
        return Ok(existing.id);
    }
    Ok(target.insert_definition(model_id, kind, name, appearance)?)
}
