//! The process-wide host handle.
//!
//! A [`SyncHost`] is created once and passed to every run. It owns the
//! database, the source reader, the target writer and the registered
//! extension points, and guarantees that only one run is active at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::convert::{ConverterRegistry, ElementConverter};
use crate::db::Database;
use crate::errors::{ConfigError, CoreError, DatabaseError, JobError};
use crate::geo::{GeoTransformResolver, Reprojection};
use crate::identity::IdentityOptions;
use crate::reference::AssignmentOracle;
use crate::schema::SchemaHook;
use crate::source::SourceReader;
use crate::target::{SqliteTarget, TargetWriter};

pub struct SyncHost {
    config: AppConfig,
    identity: IdentityOptions,
    db: Arc<Database>,
    reader: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    oracle: Arc<dyn AssignmentOracle>,
    converters: ConverterRegistry,
    geo: GeoTransformResolver,
    schema_hooks: Vec<Arc<dyn SchemaHook>>,
    /// Set while a run holds the host.
    running: AtomicBool,
    started_at: DateTime<Utc>,
}

impl SyncHost {
    /// Build a host over an initialized database. The target defaults to a
    /// [`SqliteTarget`] on the same database and document assignment to the
    /// `[assignments]` table of `config`.
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        reader: Arc<dyn SourceReader>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let identity = config.identity_options()?;
        let oracle: Arc<dyn AssignmentOracle> = Arc::new(config.assignment_oracle());
        let target: Arc<dyn TargetWriter> = Arc::new(SqliteTarget::new(Arc::clone(&db)));
        info!(bridge_key = %config.engine.bridge_key, "initializing sync host");
        Ok(Self {
            config,
            identity,
            db,
            reader,
            target,
            oracle,
            converters: ConverterRegistry::new(),
            geo: GeoTransformResolver::default(),
            schema_hooks: Vec::new(),
            running: AtomicBool::new(false),
            started_at: Utc::now(),
        })
    }

    /// Open the database under `engine.data_dir`, migrate it and build a
    /// host on it.
    pub fn open(config: AppConfig, reader: Arc<dyn SourceReader>) -> Result<Self, CoreError> {
        std::fs::create_dir_all(&config.engine.data_dir).map_err(DatabaseError::from)?;
        let db = Database::new(config.database_path())?;
        db.initialize()?;
        Ok(Self::new(config, Arc::new(db), reader)?)
    }

    // -- extension points --

    pub fn with_target(mut self, target: Arc<dyn TargetWriter>) -> Self {
        self.target = target;
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn AssignmentOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_reprojection(mut self, reprojection: Arc<dyn Reprojection>) -> Self {
        self.geo = GeoTransformResolver::new(reprojection);
        self
    }

    pub fn register_converter(&mut self, element_type: &str, converter: Arc<dyn ElementConverter>) {
        self.converters.register(element_type, converter);
    }

    pub fn add_schema_hook(&mut self, hook: Arc<dyn SchemaHook>) {
        debug!("registered schema hook");
        self.schema_hooks.push(hook);
    }

    // -- accessors --

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn identity_options(&self) -> &IdentityOptions {
        &self.identity
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn reader(&self) -> &dyn SourceReader {
        self.reader.as_ref()
    }

    pub fn target(&self) -> &dyn TargetWriter {
        self.target.as_ref()
    }

    pub fn oracle(&self) -> &dyn AssignmentOracle {
        self.oracle.as_ref()
    }

    pub fn converters(&self) -> &ConverterRegistry {
        &self.converters
    }

    pub fn geo(&self) -> &GeoTransformResolver {
        &self.geo
    }

    pub fn schema_hooks(&self) -> &[Arc<dyn SchemaHook>] {
        &self.schema_hooks
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// `true` while a run holds the host.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim the host for one run. The claim is released when the returned
    /// guard drops, even on panic.
    pub(crate) fn acquire(&self) -> Result<RunLock<'_>, JobError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(JobError::RunInProgress);
        }
        Ok(RunLock(&self.running))
    }
}

impl std::fmt::Debug for SyncHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHost")
            .field("bridge_key", &self.config.engine.bridge_key)
            .field("converters", &self.converters)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Releases the host's run claim on drop.
pub(crate) struct RunLock<'h>(&'h AtomicBool);

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
