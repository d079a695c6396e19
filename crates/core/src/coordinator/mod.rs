//! The job coordinator.
//!
//! A [`JobCoordinator`] drives one run of one bridge over one root
//! document:
//!
//! 1. Resolve the reference graph and the root transform.
//! 2. Reconcile schemas of every converted document, then commit.
//! 3. Find the bridge's job for the root, or create it.
//! 4. Convert each document, committing after every model.
//! 5. Remove content of documents deleted from the source.
//! 6. Grow project extents, request thumbnails and commit.
//!
//! Any error rolls back the open transaction and aborts the run. Work
//! committed before the failure is kept and picked up by the next run.

mod document;
pub mod progress;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use self::document::DocumentPass;
use crate::definitions::DefinitionMapper;
use crate::errors::{JobError, SchemaError};
use crate::geo::{AffineTransform, ExtentsTracker, Gcs, GeoTransformResolver};
use crate::host::{RunLock, SyncHost};
use crate::identity::IdentityStore;
use crate::models::{Dimensionality, JobRecord, ModelKind, RunToken, TargetId};
use crate::reference::{EdgeKind, ReferenceGraph, ReferenceResolver};
use crate::schema::{ReconcileOutcome, SchemaReconciler};
use crate::target::TargetWriter;

pub use progress::{
    JobResolution, NoProgress, ProgressAction, ProgressMonitor, RunDiagnostic, RunOutcome,
    RunState, RunStats,
};

/// Tolerance when comparing a model's stored transform with the current one.
const TRANSFORM_TOLERANCE: f64 = 1e-9;

/// Counters and accumulators shared by the phases of a run.
#[derive(Debug, Default)]
struct RunTally {
    stats: RunStats,
    diagnostics: Vec<RunDiagnostic>,
    /// Target models that received writes, for thumbnail requests.
    changed_models: BTreeSet<TargetId>,
    extents: ExtentsTracker,
    /// Target write count at the last commit.
    committed_writes: u64,
}

/// Commit target and store, optionally opening the next transaction.
fn commit_changes(
    store: &IdentityStore,
    target: &dyn TargetWriter,
    reopen: bool,
) -> Result<(), JobError> {
    target.save_changes()?;
    store.save_changes()?;
    if reopen {
        store.begin_changes()?;
    }
    Ok(())
}

pub struct JobCoordinator<'h> {
    host: &'h SyncHost,
    _lock: RunLock<'h>,
    store: IdentityStore,
    bridge_key: String,
    root_path: String,
    monitor: Arc<dyn ProgressMonitor>,
    state: RunState,
    token: Option<RunToken>,
    graph: Option<Arc<ReferenceGraph>>,
    job: Option<JobRecord>,
    target_gcs: Option<Gcs>,
    /// Root document coordinates to target coordinates.
    root_transform: AffineTransform,
    writes_at_start: u64,
    tally: RunTally,
    aborted: bool,
}

impl<'h> JobCoordinator<'h> {
    /// Claim `host` for a run of `bridge_key` over `root_path`. Fails with
    /// [`JobError::RunInProgress`] while another run holds the host.
    pub fn new(host: &'h SyncHost, bridge_key: &str, root_path: &str) -> Result<Self, JobError> {
        let lock = host.acquire()?;
        let store = IdentityStore::open(Arc::clone(host.database()), host.identity_options().clone())?;
        Ok(Self {
            host,
            _lock: lock,
            store,
            bridge_key: bridge_key.to_string(),
            root_path: root_path.to_string(),
            monitor: Arc::new(NoProgress),
            state: RunState::Created,
            token: None,
            graph: None,
            job: None,
            target_gcs: None,
            root_transform: AffineTransform::identity(),
            writes_at_start: 0,
            tally: RunTally::default(),
            aborted: false,
        })
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn ProgressMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute the run.
    ///
    /// Returns the outcome when the run committed or was cancelled by the
    /// progress monitor. Errors abort the run and are returned after the
    /// open transaction was rolled back.
    pub fn run(&mut self) -> Result<RunOutcome, JobError> {
        if self.token.is_some() {
            return Err(JobError::InvalidStateTransition {
                from: self.state.to_string(),
                to: RunState::Created.to_string(),
            });
        }
        let token = self.store.begin_run(&self.bridge_key, &self.root_path)?;
        self.token = Some(token);
        self.writes_at_start = self.host.target().write_count();
        self.tally.committed_writes = self.writes_at_start;

        match self.process() {
            Ok(()) if self.aborted => {
                info!(token, "run cancelled by progress monitor");
                self.abort("cancelled");
                Ok(self.outcome(token))
            }
            Ok(()) => Ok(self.outcome(token)),
            Err(e) => {
                warn!(token, error = %e, "run failed");
                self.abort(&e.to_string());
                Err(e)
            }
        }
    }

    fn process(&mut self) -> Result<(), JobError> {
        self.init_root_model()?;
        self.make_schema_changes()?;
        self.resolve_job()?;
        self.convert_data()?;
        if self.aborted {
            return Ok(());
        }
        self.detect_deleted_documents()?;
        self.finish()
    }

    fn outcome(&self, token: RunToken) -> RunOutcome {
        RunOutcome {
            token,
            state: self.state,
            had_changes: self.had_any_changes(),
            stats: self.tally.stats.clone(),
            diagnostics: self.tally.diagnostics.clone(),
        }
    }

    /// Roll back uncommitted work and close the run as aborted. Failures
    /// here are logged; the run is already lost.
    fn abort(&mut self, reason: &str) {
        if let Err(e) = self.host.target().abandon_changes() {
            warn!(error = %e, "failed to roll back target changes");
        }
        if let Err(e) = self.store.abandon_changes() {
            warn!(error = %e, "failed to roll back identity changes");
        }
        if self.state.can_transition_to(RunState::Aborted) {
            self.state = RunState::Aborted;
        }
        self.aborted = true;
        let summary = format!("{reason}; {}", self.tally.stats.summary());
        let had_changes = self.had_any_changes();
        if let Err(e) = self.store.finish_run("aborted", had_changes, Some(&summary)) {
            warn!(error = %e, "failed to record aborted run");
        }
    }

    // -----------------------------------------------------------------------
    // State
    // -----------------------------------------------------------------------

    pub fn state(&self) -> RunState {
        self.state
    }

    /// `true` once the run was cancelled or failed.
    pub fn was_aborted(&self) -> bool {
        self.aborted
    }

    /// `true` if committed work of this run wrote to the target.
    pub fn had_any_changes(&self) -> bool {
        self.tally.committed_writes > self.writes_at_start
    }

    pub fn graph(&self) -> Option<&ReferenceGraph> {
        self.graph.as_deref()
    }

    pub fn job(&self) -> Option<&JobRecord> {
        self.job.as_ref()
    }

    fn check_transition(&self, next: RunState) -> Result<(), JobError> {
        if self.aborted {
            return Err(JobError::Aborted(format!("cannot move to {next}")));
        }
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: RunState) -> Result<(), JobError> {
        self.check_transition(next)?;
        info!(from = %self.state, to = %next, "run state changed");
        self.state = next;
        Ok(())
    }

    fn graph_handle(&self) -> Result<Arc<ReferenceGraph>, JobError> {
        self.graph
            .clone()
            .ok_or_else(|| JobError::Aborted("reference graph not resolved".into()))
    }

    fn current_job(&self) -> Result<JobRecord, JobError> {
        match (&self.job, &self.graph) {
            (Some(job), _) => Ok(job.clone()),
            (None, Some(graph)) => Err(JobError::JobNotFound {
                bridge_key: self.bridge_key.clone(),
                root_document_id: graph.root().map_or(0, |r| r.record.id),
            }),
            (None, None) => Err(JobError::Aborted("reference graph not resolved".into())),
        }
    }

    /// Commit everything written so far. While the run is active the next
    /// transaction is opened; before it starts or after it ends none is.
    pub fn save_changes(&mut self) -> Result<(), JobError> {
        let reopen = self.token.is_some() && !self.aborted && !self.state.is_terminal();
        commit_changes(&self.store, self.host.target(), reopen)?;
        self.tally.committed_writes = self.host.target().write_count();
        debug!(writes = self.tally.committed_writes, "saved progress");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    /// Resolve the reference graph, adopt a coordinate system for the
    /// target if it has none, and compute the root transform.
    fn init_root_model(&mut self) -> Result<(), JobError> {
        let host = self.host;
        let resolver =
            ReferenceResolver::new(&self.store, host.reader(), host.oracle(), &self.bridge_key);
        let graph = resolver.resolve(&self.root_path)?;
        for diagnostic in &graph.diagnostics {
            warn!(%diagnostic, "reference diagnostic");
            self.tally.diagnostics.push(RunDiagnostic::Reference {
                message: diagnostic.to_string(),
            });
        }
        let root = graph
            .root()
            .ok_or_else(|| JobError::Aborted("reference graph has no root".into()))?;

        let geo = &host.config().geo;
        let target = host.target();
        let mut target_gcs = target.gcs()?;
        if target_gcs.is_none() {
            if let Some(gcs) =
                GeoTransformResolver::effective_source_gcs(root.source.gcs.as_ref(), geo.input.as_ref())
            {
                gcs.validate()?;
                target.set_gcs(&gcs)?;
                info!(gcs = %gcs.name, "target adopted root coordinate system");
                target_gcs = Some(gcs);
            }
        }
        self.root_transform = host.geo().resolve_transform(
            root.source.gcs.as_ref(),
            geo.input.as_ref(),
            target_gcs.as_ref(),
            geo.method,
        )?;
        self.tally.extents = ExtentsTracker::new(target.project_extents()?);
        info!(
            root = %root.source.path,
            documents = graph.documents.len(),
            assigned = graph.assigned().count(),
            shared = graph.edges_of_kind(EdgeKind::Cross).count(),
            cycles = graph.edges_of_kind(EdgeKind::Back).count(),
            "reference graph resolved"
        );
        self.target_gcs = target_gcs;
        self.graph = Some(Arc::new(graph));
        Ok(())
    }

    /// Reconcile the schemas of every converted document and commit. A
    /// schema whose content changed without a version bump aborts the run.
    fn make_schema_changes(&mut self) -> Result<(), JobError> {
        self.check_transition(RunState::SchemaChangesApplied)?;
        let graph = self.graph_handle()?;
        let reconciler =
            SchemaReconciler::new(&self.store, self.host.target(), self.host.schema_hooks());
        for doc in graph.assigned() {
            for schema in &doc.source.schemas {
                let used = doc.source.uses_schema(&schema.name);
                match reconciler.reconcile(schema, doc.record.id, used)? {
                    ReconcileOutcome::Imported => self.tally.stats.schemas_imported += 1,
                    ReconcileOutcome::Merged => self.tally.stats.schemas_merged += 1,
                    ReconcileOutcome::Skipped => {}
                    ReconcileOutcome::VersionConflict => {
                        return Err(SchemaError::VersionConflict {
                            name: schema.name.clone(),
                            major: schema.version_major,
                            minor: schema.version_minor,
                        }
                        .into());
                    }
                }
            }
        }
        self.save_changes()?;
        self.transition(RunState::SchemaChangesApplied)
    }

    /// The bridge's existing job for the root document, if any.
    fn find_job(&self) -> Result<Option<JobRecord>, JobError> {
        let graph = self.graph_handle()?;
        let Some(root) = graph.root() else {
            return Ok(None);
        };
        Ok(self.store.find_job(&self.bridge_key, root.record.id)?)
    }

    /// Create the job subject, its private definition model and `Default`
    /// category.
    fn initialize_job(&self) -> Result<JobRecord, JobError> {
        let graph = self.graph_handle()?;
        let root = graph
            .root()
            .ok_or_else(|| JobError::Aborted("reference graph has no root".into()))?;
        let target = self.host.target();
        let subject_id =
            target.insert_subject(&format!("{} ({})", self.bridge_key, root.source.basename()))?;
        let definition_model_id = target.insert_model(
            Some(subject_id),
            &format!("{} Definitions", self.bridge_key),
            ModelKind::Normal,
            Dimensionality::ThreeD,
        )?;
        let job =
            self.store
                .record_job(&self.bridge_key, root.record.id, subject_id, definition_model_id)?;
        let conversion = &self.host.config().conversion;
        DefinitionMapper::new(
            &self.store,
            target,
            &job,
            conversion.level_copy,
            conversion.merge_definitions,
        )
        .default_category()?;
        info!(job_id = job.id, bridge_key = %self.bridge_key, subject_id, "created job");
        Ok(job)
    }

    fn resolve_job(&mut self) -> Result<(), JobError> {
        self.check_transition(RunState::JobResolved(JobResolution::Found))?;
        let (job, resolution) = match self.find_job()? {
            Some(job) => {
                debug!(job_id = job.id, "found existing job");
                (job, JobResolution::Found)
            }
            None => (self.initialize_job()?, JobResolution::Created),
        };
        self.job = Some(job);
        self.save_changes()?;
        self.transition(RunState::JobResolved(resolution))
    }

    /// Convert every assigned document. Stops early, without error, when
    /// the progress monitor cancels.
    fn convert_data(&mut self) -> Result<(), JobError> {
        self.check_transition(RunState::DataConverted)?;
        let graph = self.graph_handle()?;
        let job = self.current_job()?;
        let mut pass = DocumentPass::new(
            self.host,
            &self.store,
            &job,
            self.monitor.as_ref(),
            self.target_gcs.as_ref(),
            &self.root_transform,
            &mut self.tally,
        );
        for doc in graph.assigned() {
            if pass.convert_document(doc)? == ProgressAction::Abort {
                self.aborted = true;
                return Ok(());
            }
        }
        self.transition(RunState::DataConverted)
    }

    /// Remove the content of documents this job converted before that are
    /// no longer referenced and no longer exist. Unreferenced documents that
    /// still exist keep their content.
    fn detect_deleted_documents(&mut self) -> Result<(), JobError> {
        self.check_transition(RunState::DeletionsDetected)?;
        let graph = self.graph_handle()?;
        let job = self.current_job()?;
        let target = self.host.target();

        for seen in self.store.list_job_documents(job.id)? {
            if graph.contains(seen.document_id) {
                continue;
            }
            let Some(record) = self.store.get_document(seen.document_id)? else {
                self.store.forget_job_document(job.id, seen.document_id)?;
                continue;
            };
            if self.host.reader().exists(&record.source_path) {
                debug!(path = %record.source_path, "document no longer referenced, content kept");
                continue;
            }
            if !self
                .host
                .oracle()
                .is_assigned_to_bridge(&record.source_path, &self.bridge_key)
            {
                continue;
            }

            for model in self.store.list_models_for_document(record.id)? {
                if model.job_id != Some(job.id) {
                    continue;
                }
                target.delete_model(model.target_model_id)?;
                self.store.delete_model(&model)?;
                self.tally.stats.models_deleted += 1;
            }
            self.store.forget_job_document(job.id, record.id)?;
            if !self.store.document_used_by_other_jobs(job.id, record.id)? {
                self.store.delete_document(record.id)?;
            }
            self.tally.stats.documents_deleted += 1;
            info!(path = %record.source_path, "removed content of deleted document");
        }

        self.save_changes()?;
        self.transition(RunState::DeletionsDetected)
    }

    /// Grow project extents, request thumbnails and commit the run.
    fn finish(&mut self) -> Result<(), JobError> {
        self.check_transition(RunState::Committed)?;
        let target = self.host.target();
        if self.tally.extents.has_grown() {
            if let Some(extents) = self.tally.extents.current() {
                target.set_project_extents(&extents)?;
            }
        }
        let dirty = target.write_count() > self.writes_at_start;
        if dirty
            && self.host.config().conversion.generate_thumbnails
            && !self.tally.changed_models.is_empty()
        {
            let models: Vec<TargetId> = self.tally.changed_models.iter().copied().collect();
            target.request_thumbnails(&models)?;
        }

        commit_changes(&self.store, target, false)?;
        self.tally.committed_writes = target.write_count();
        self.transition(RunState::Committed)?;

        let had_changes = self.had_any_changes();
        let summary = self.tally.stats.summary();
        self.store.finish_run("committed", had_changes, Some(&summary))?;
        info!(had_changes, %summary, "run committed");
        Ok(())
    }
}
