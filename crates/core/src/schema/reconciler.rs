//! Deciding whether a source schema must be (re-)imported.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::flatten::flatten;
use super::{SourceSchema, TargetSchema};
use crate::errors::SchemaError;
use crate::identity::IdentityStore;
use crate::target::TargetWriter;

/// What reconciliation did with one schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// First import into the target catalog.
    Imported,
    /// Nothing to do: unused, unchanged or older.
    Skipped,
    /// Merged into a schema of the same name already in the catalog.
    Merged,
    /// Same version number as the imported one but different content.
    VersionConflict,
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Imported => write!(f, "imported"),
            Self::Skipped => write!(f, "skipped"),
            Self::Merged => write!(f, "merged"),
            Self::VersionConflict => write!(f, "version_conflict"),
        }
    }
}

/// Extension point around schema import.
pub trait SchemaHook: Send + Sync {
    /// Adjust a flattened schema before it reaches the catalog.
    fn before_import(&self, _schema: &mut TargetSchema) {}

    /// Called with the schema exactly as written to the catalog.
    fn after_import(&self, _schema: &TargetSchema) {}
}

/// Union of two versions of a schema. Classes, properties and capability
/// tags are merged by name; nothing that is in neither input is created.
/// Returns the merged schema and whether it differs from `existing`.
pub fn merge_schemas(existing: &TargetSchema, incoming: &TargetSchema) -> (TargetSchema, bool) {
    let mut merged = existing.clone();
    if incoming.version() > merged.version() {
        merged.version_major = incoming.version_major;
        merged.version_minor = incoming.version_minor;
    }

    for class in &incoming.classes {
        let Some(current) = merged.classes.iter_mut().find(|c| c.name == class.name) else {
            merged.classes.push(class.clone());
            continue;
        };
        for property in &class.properties {
            if !current
                .properties
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(&property.name))
            {
                current.properties.push(property.clone());
            }
        }
        for capability in &class.capabilities {
            if !current.capabilities.contains(capability) {
                current.capabilities.push(capability.clone());
            }
        }
        if current.base_class.is_none() {
            current.base_class = class.base_class.clone();
        }
        if current.applies_to.is_none() {
            current.applies_to = class.applies_to.clone();
        }
    }

    let changed = merged != *existing;
    (merged, changed)
}

/// Reconciles the schemas of one document against the identity store and
/// the target catalog.
pub struct SchemaReconciler<'a> {
    store: &'a IdentityStore,
    target: &'a dyn TargetWriter,
    hooks: &'a [Arc<dyn SchemaHook>],
}

impl<'a> SchemaReconciler<'a> {
    pub fn new(
        store: &'a IdentityStore,
        target: &'a dyn TargetWriter,
        hooks: &'a [Arc<dyn SchemaHook>],
    ) -> Self {
        Self {
            store,
            target,
            hooks,
        }
    }

    /// Reconcile `schema` as declared by `document_id`. `used` is `true` when
    /// at least one element of the document carries an instance of it.
    ///
    /// Unused schemas are only tracked. A used schema is imported the first
    /// time, re-imported (merged) when its version rises, and reported as a
    /// conflict when its content changed under the same version.
    pub fn reconcile(
        &self,
        schema: &SourceSchema,
        document_id: i64,
        used: bool,
    ) -> Result<ReconcileOutcome, SchemaError> {
        let checksum = schema.checksum()?;
        let version = schema.version();
        let prior = self.store.find_schema_version(&schema.name, document_id)?;

        if !used {
            let unchanged = prior.as_ref().is_some_and(|p| {
                p.imported
                    || ((p.version_major, p.version_minor) == version && p.checksum == checksum)
            });
            if !unchanged {
                self.store
                    .record_schema_version(&schema.name, document_id, version, &checksum, false)?;
                debug!(schema = %schema.name, document_id, "tracking unused schema");
            }
            return Ok(ReconcileOutcome::Skipped);
        }

        if let Some(prior) = prior.filter(|p| p.imported) {
            let prior_version = (prior.version_major, prior.version_minor);
            match version.cmp(&prior_version) {
                Ordering::Equal if prior.checksum == checksum => {
                    debug!(schema = %schema.name, document_id, "schema unchanged");
                    return Ok(ReconcileOutcome::Skipped);
                }
                Ordering::Equal => {
                    warn!(
                        schema = %schema.name,
                        document_id,
                        major = version.0,
                        minor = version.1,
                        "schema content changed without a version bump"
                    );
                    return Ok(ReconcileOutcome::VersionConflict);
                }
                Ordering::Less => {
                    debug!(schema = %schema.name, document_id, "older schema version ignored");
                    return Ok(ReconcileOutcome::Skipped);
                }
                Ordering::Greater => {
                    self.import_or_merge(schema)?;
                    self.store
                        .record_schema_version(&schema.name, document_id, version, &checksum, true)?;
                    info!(
                        schema = %schema.name,
                        document_id,
                        from = %format!("{}.{}", prior_version.0, prior_version.1),
                        to = %format!("{}.{}", version.0, version.1),
                        "schema upgraded"
                    );
                    return Ok(ReconcileOutcome::Merged);
                }
            }
        }

        let outcome = self.import_or_merge(schema)?;
        self.store
            .record_schema_version(&schema.name, document_id, version, &checksum, true)?;
        Ok(outcome)
    }

    fn import_or_merge(&self, schema: &SourceSchema) -> Result<ReconcileOutcome, SchemaError> {
        let mut incoming = flatten(schema)?;
        for hook in self.hooks {
            hook.before_import(&mut incoming);
        }

        let Some(existing) = self.target.find_schema(&incoming.name)? else {
            self.target.import_schema(&incoming)?;
            self.after_import(&incoming);
            return Ok(ReconcileOutcome::Imported);
        };

        let (merged, changed) = merge_schemas(&existing, &incoming);
        if !changed {
            debug!(schema = %incoming.name, "catalog already contains every class");
            return Ok(ReconcileOutcome::Skipped);
        }
        self.target.import_schema(&merged)?;
        self.after_import(&merged);
        info!(schema = %merged.name, classes = merged.classes.len(), "merged schema");
        Ok(ReconcileOutcome::Merged)
    }

    fn after_import(&self, schema: &TargetSchema) {
        for hook in self.hooks {
            hook.after_import(schema);
        }
    }
}
