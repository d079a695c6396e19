//! Run states, statistics and the progress callback.

use serde::{Deserialize, Serialize};

use crate::models::RunToken;

// ---------------------------------------------------------------------------
// Run state machine
// ---------------------------------------------------------------------------

/// How the run's job was obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobResolution {
    Created,
    Found,
}

/// States of one run. `Aborted` is reachable from every state except
/// `Committed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    SchemaChangesApplied,
    JobResolved(JobResolution),
    DataConverted,
    DeletionsDetected,
    Committed,
    Aborted,
}

impl RunState {
    /// `true` if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Committed, _) | (Aborted, _) => false,
            (_, Aborted) => true,
            (Created, SchemaChangesApplied) => true,
            (SchemaChangesApplied, JobResolved(_)) => true,
            (JobResolved(_), DataConverted) => true,
            (DataConverted, DeletionsDetected) => true,
            (DeletionsDetected, Committed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::SchemaChangesApplied => write!(f, "schema_changes_applied"),
            Self::JobResolved(JobResolution::Created) => write!(f, "job_created"),
            Self::JobResolved(JobResolution::Found) => write!(f, "job_found"),
            Self::DataConverted => write!(f, "data_converted"),
            Self::DeletionsDetected => write!(f, "deletions_detected"),
            Self::Committed => write!(f, "committed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics and diagnostics
// ---------------------------------------------------------------------------

/// Counters from a single run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStats {
    pub documents_converted: usize,
    pub documents_skipped: usize,
    pub documents_deleted: usize,
    pub models_converted: usize,
    pub models_deleted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub discarded: usize,
    pub schemas_imported: usize,
    pub schemas_merged: usize,
    pub fonts_embedded: usize,
}

impl RunStats {
    /// One-line summary stored with the run record.
    pub fn summary(&self) -> String {
        format!(
            "documents: {} converted, {} skipped, {} deleted; elements: {} inserted, {} updated, {} unchanged, {} deleted, {} discarded",
            self.documents_converted,
            self.documents_skipped,
            self.documents_deleted,
            self.inserted,
            self.updated,
            self.unchanged,
            self.deleted,
            self.discarded
        )
    }
}

/// Findings reported by a run that did not stop it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunDiagnostic {
    /// From reference resolution.
    Reference { message: String },
    /// An element failed conversion and was discarded.
    ElementDiscarded {
        document: String,
        source_element_id: i64,
        reason: String,
    },
    /// An element code already used in the model.
    CodeCollision {
        document: String,
        source_element_id: i64,
        code: String,
        /// Code given to the element instead, if any.
        assigned: Option<String>,
    },
    /// A source model mapped into a model another job owns.
    ForeignModel { document: String, model: String },
}

impl std::fmt::Display for RunDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reference { message } => write!(f, "reference: {message}"),
            Self::ElementDiscarded {
                document,
                source_element_id,
                reason,
            } => write!(f, "{document}: element {source_element_id} discarded: {reason}"),
            Self::CodeCollision {
                document,
                source_element_id,
                code,
                assigned: Some(assigned),
            } => write!(
                f,
                "{document}: element {source_element_id} code '{code}' already used, stored as '{assigned}'"
            ),
            Self::CodeCollision {
                document,
                source_element_id,
                code,
                assigned: None,
            } => write!(
                f,
                "{document}: element {source_element_id} code '{code}' already used, stored without code"
            ),
            Self::ForeignModel { document, model } => {
                write!(f, "{document}: model '{model}' is owned by another job")
            }
        }
    }
}

/// Result of a run that did not fail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub token: RunToken,
    /// `Committed`, or `Aborted` when the progress monitor cancelled.
    pub state: RunState,
    pub had_changes: bool,
    pub stats: RunStats,
    pub diagnostics: Vec<RunDiagnostic>,
}

impl RunOutcome {
    pub fn was_aborted(&self) -> bool {
        self.state == RunState::Aborted
    }
}

// ---------------------------------------------------------------------------
// Progress callback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressAction {
    Continue,
    Abort,
}

/// Polled before each document and each model. Returning
/// [`ProgressAction::Abort`] cancels the run; work committed so far is kept.
pub trait ProgressMonitor: Send + Sync {
    fn on_document(&self, _path: &str) -> ProgressAction {
        ProgressAction::Continue
    }

    fn on_model(&self, _path: &str, _model: &str) -> ProgressAction {
        ProgressAction::Continue
    }
}

/// A monitor that never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressMonitor for NoProgress {}
