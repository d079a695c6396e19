//! Per-model change classification.

use std::collections::HashSet;

use tracing::{debug, warn};

use super::fingerprint::Fingerprint;
use crate::errors::StoreError;
use crate::identity::IdentityStore;
use crate::models::{ElementRecord, RunToken, TargetId};

/// Outcome of comparing one source element against its stored mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Unchanged,
    /// Never returned by [`classify`]; deletions come from
    /// [`ChangeDetector::finish`].
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// Classify a fingerprint against the stored one. `force_update` turns
/// `Unchanged` into `Update` (e.g. when the model's placement moved).
pub fn classify(current: &Fingerprint, prior: Option<&str>, force_update: bool) -> ChangeKind {
    match prior {
        None => ChangeKind::Insert,
        Some(prior) if prior != current.as_str() || force_update => ChangeKind::Update,
        Some(_) => ChangeKind::Unchanged,
    }
}

/// A classified element, with its prior mapping when one exists.
#[derive(Debug, Clone)]
pub struct Classified {
    pub kind: ChangeKind,
    pub fingerprint: Fingerprint,
    pub prior: Option<ElementRecord>,
}

/// Classifies the elements of one model against the identity store.
///
/// Elements confirmed during the pass are touched with the run token; once
/// the pass is finished every mapping of the model not touched by this run
/// is a deletion.
pub struct ChangeDetector<'s> {
    store: &'s IdentityStore,
    model_id: i64,
    run_token: RunToken,
    force_update: bool,
    seen: HashSet<i64>,
}

impl<'s> ChangeDetector<'s> {
    pub fn begin_model(
        store: &'s IdentityStore,
        model_id: i64,
        force_update: bool,
    ) -> Result<Self, StoreError> {
        let run_token = store.run_token()?;
        debug!(model_id, run_token, force_update, "change detection started");
        Ok(Self {
            store,
            model_id,
            run_token,
            force_update,
            seen: HashSet::new(),
        })
    }

    /// Classify one element. Returns `None` for a source id already seen in
    /// this pass.
    pub fn classify(
        &mut self,
        source_element_id: i64,
        fingerprint: Fingerprint,
    ) -> Result<Option<Classified>, StoreError> {
        if !self.seen.insert(source_element_id) {
            warn!(
                model_id = self.model_id,
                source_element_id, "duplicate source element id in model, ignoring repeat"
            );
            return Ok(None);
        }
        let prior = self.store.find_element(self.model_id, source_element_id)?;
        let kind = classify(
            &fingerprint,
            prior.as_ref().map(|p| p.fingerprint.as_str()),
            self.force_update,
        );
        Ok(Some(Classified {
            kind,
            fingerprint,
            prior,
        }))
    }

    /// Keep an existing mapping alive without changing it.
    pub fn confirm(&self, prior: &ElementRecord) -> Result<(), StoreError> {
        self.store.touch_element(prior)
    }

    /// Record the target element written for an insert or update.
    pub fn record(
        &self,
        source_element_id: i64,
        target_element_id: TargetId,
        fingerprint: &Fingerprint,
    ) -> Result<ElementRecord, StoreError> {
        self.store.upsert_element(
            self.model_id,
            source_element_id,
            target_element_id,
            fingerprint.as_str(),
        )
    }

    /// End the pass and return the mappings to delete.
    pub fn finish(self) -> Result<Vec<ElementRecord>, StoreError> {
        let stale = self
            .store
            .find_elements_not_touched_since(self.model_id, self.run_token)?;
        debug!(
            model_id = self.model_id,
            seen = self.seen.len(),
            deletions = stale.len(),
            "change detection finished"
        );
        Ok(stale)
    }
}
