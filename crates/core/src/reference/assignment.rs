//! Which documents a bridge converts.

use std::collections::BTreeMap;

use crate::identity::recipe::basename;

/// Tells whether a document belongs to a bridge. Documents not assigned to
/// the running bridge are still walked for topology but never converted.
pub trait AssignmentOracle: Send + Sync {
    fn is_assigned_to_bridge(&self, document_path: &str, bridge_key: &str) -> bool;
}

/// Every document is assigned to every bridge.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssignAll;

impl AssignmentOracle for AssignAll {
    fn is_assigned_to_bridge(&self, _document_path: &str, _bridge_key: &str) -> bool {
        true
    }
}

/// Assignments from the `[assignments]` config table: bridge key to glob
/// patterns over lowercased document basenames. An empty table assigns
/// everything to everyone.
#[derive(Debug, Clone, Default)]
pub struct ConfigAssignments {
    patterns: BTreeMap<String, Vec<String>>,
}

impl ConfigAssignments {
    pub fn new(patterns: BTreeMap<String, Vec<String>>) -> Self {
        let patterns = patterns
            .into_iter()
            .map(|(bridge, globs)| (bridge, globs.iter().map(|g| g.to_lowercase()).collect()))
            .collect();
        Self { patterns }
    }
}

impl AssignmentOracle for ConfigAssignments {
    fn is_assigned_to_bridge(&self, document_path: &str, bridge_key: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let name = basename(document_path);
        self.patterns
            .get(bridge_key)
            .map(|globs| globs.iter().any(|g| glob_match::glob_match(g, &name)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_assigns_everything() {
        let oracle = ConfigAssignments::default();
        assert!(oracle.is_assigned_to_bridge("/x/anything.dgn", "civil"));
        assert!(AssignAll.is_assigned_to_bridge("/x/anything.dgn", "civil"));
    }

    #[test]
    fn test_globs_match_basename_case_insensitively() {
        let oracle = ConfigAssignments::new(BTreeMap::from([
            ("civil".to_string(), vec!["C-*.DGN".to_string()]),
            ("plant".to_string(), vec!["p-*.dgn".to_string(), "shared.dgn".to_string()]),
        ]));
        assert!(oracle.is_assigned_to_bridge("/site/c-road.dgn", "civil"));
        assert!(!oracle.is_assigned_to_bridge("/site/p-pump.dgn", "civil"));
        assert!(oracle.is_assigned_to_bridge("C:\\site\\Shared.dgn", "plant"));
        assert!(!oracle.is_assigned_to_bridge("/site/c-road.dgn", "unknown"));
        assert!(!oracle.is_assigned_to_bridge("/site/c-road.dgn", "plant"));
    }
}
