//! Model renaming rules.
//!
//! Rules are tried in order; the first one whose patterns all match renames
//! the target model. Patterns are case-insensitive globs: `file` and
//! `not_file` against the document's file name, `name` and `not_name`
//! against the source model name. `%file` in `new_name` expands to the file
//! name without its extension.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportRule {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub not_file: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub not_name: Option<String>,
    pub new_name: String,
}

fn glob(pattern: &str, text: &str) -> bool {
    glob_match::glob_match(&pattern.to_lowercase(), &text.to_lowercase())
}

/// File name of `path` with its original case.
fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

impl ImportRule {
    pub fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.new_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("conversion.import_rules[{index}].new_name"),
                detail: "new_name must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn matches(&self, document_path: &str, model_name: &str) -> bool {
        let file = file_name(document_path);
        self.file.as_deref().map_or(true, |p| glob(p, file))
            && self.not_file.as_deref().map_or(true, |p| !glob(p, file))
            && self.name.as_deref().map_or(true, |p| glob(p, model_name))
            && self.not_name.as_deref().map_or(true, |p| !glob(p, model_name))
    }

    pub fn apply(&self, document_path: &str) -> String {
        self.new_name.replace("%file", file_stem(document_path))
    }
}

/// Name of the target model for a source model. Without a matching rule,
/// root models keep their name and reference models are qualified with
/// their file name.
pub fn target_model_name(
    rules: &[ImportRule],
    document_path: &str,
    model_name: &str,
    is_root_document: bool,
) -> String {
    if let Some(rule) = rules.iter().find(|r| r.matches(document_path, model_name)) {
        let renamed = rule.apply(document_path);
        debug!(document = document_path, model = model_name, to = %renamed, "import rule matched");
        return renamed;
    }
    if is_root_document {
        model_name.to_string()
    } else {
        format!("{model_name} ({})", file_name(document_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(file: Option<&str>, name: Option<&str>, new_name: &str) -> ImportRule {
        ImportRule {
            file: file.map(str::to_string),
            not_file: None,
            name: name.map(str::to_string),
            not_name: None,
            new_name: new_name.into(),
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = vec![
            rule(Some("site*.dgn"), Some("default"), "%file - Plan"),
            rule(None, None, "Catch-all"),
        ];
        assert_eq!(
            target_model_name(&rules, "/p/Site_A.DGN", "Default", true),
            "Site_A - Plan"
        );
        assert_eq!(target_model_name(&rules, "/p/other.dgn", "Default", true), "Catch-all");
    }

    #[test]
    fn test_negated_patterns() {
        let mut r = rule(None, None, "x");
        r.not_file = Some("*.tmp.dgn".into());
        r.not_name = Some("sheet*".into());
        assert!(r.matches("/a/plan.dgn", "Default"));
        assert!(!r.matches("/a/plan.tmp.dgn", "Default"));
        assert!(!r.matches("/a/plan.dgn", "Sheet 1"));
    }

    #[test]
    fn test_default_names() {
        assert_eq!(target_model_name(&[], "/a/Master.dgn", "Default", true), "Default");
        assert_eq!(
            target_model_name(&[], "/a/Ref.dgn", "Default", false),
            "Default (Ref.dgn)"
        );
    }

    #[test]
    fn test_empty_new_name_rejected() {
        assert!(rule(None, None, " ").validate(0).is_err());
        assert!(rule(None, None, "ok").validate(0).is_ok());
    }
}
