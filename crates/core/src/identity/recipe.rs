//! Basename normalization used for basename-based document matching.
//!
//! A recipe is a regular expression whose matches are stripped from the
//! lowercased file stem, so that e.g. `Site_v3.dgn` and `site_v7.DGN` both
//! normalize to `site.dgn` under the recipe `_v\d+$`.

use regex_lite::Regex;

use crate::errors::ConfigError;

/// Compiled suffix-strip rule.
#[derive(Debug, Clone)]
pub struct Recipe {
    pattern: Regex,
}

impl Recipe {
    /// Compile a recipe. Fails with [`ConfigError::InvalidValue`] if the
    /// pattern is not a valid regular expression.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let pattern = Regex::new(pattern).map_err(|e| ConfigError::InvalidValue {
            field: "identity.recipe".into(),
            detail: e.to_string(),
        })?;
        Ok(Self { pattern })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Normalize a path or basename with this recipe.
    pub fn normalize(&self, path: &str) -> String {
        normalize_with(Some(self), path)
    }
}

/// Lowercased basename of `path`. Accepts both `/` and `\` separators.
pub fn basename(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_lowercase()
}

/// Normalize `path` to the name used for basename matching: the lowercased
/// basename with recipe matches removed from the stem.
pub fn normalize_with(recipe: Option<&Recipe>, path: &str) -> String {
    let name = basename(path);
    let Some(recipe) = recipe else {
        return name;
    };
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name.as_str(), ""),
    };
    let stripped = recipe.pattern.replace_all(stem, "");
    if stripped.is_empty() {
        // never normalize a name away entirely
        return name;
    }
    format!("{stripped}{ext}")
}
