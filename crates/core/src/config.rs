//! TOML-based configuration for dgnsync.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. [`AppConfig::validate`] checks the values that serde
//! cannot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::geo::{InputGcsDefinition, TransformMethod};
use crate::identity::{IdentityOptions, Recipe};
use crate::import_rules::ImportRule;
use crate::reference::ConfigAssignments;

/// File name of the database inside `engine.data_dir`.
pub const DATABASE_FILE: &str = "dgnsync.db";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Document identity matching.
    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub conversion: ConversionConfig,

    /// Geographic transform settings.
    #[serde(default)]
    pub geo: GeoConfig,

    /// Bridge key to glob patterns over document file names. Empty means
    /// every document is assigned to every bridge.
    #[serde(default)]
    pub assignments: BTreeMap<String, Vec<String>>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Key identifying this bridge in a shared target repository.
    #[serde(default = "default_bridge_key")]
    pub bridge_key: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".dgnsync")
}
fn default_bridge_key() -> String {
    "default".into()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            bridge_key: default_bridge_key(),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Match documents by normalized file name when no GUID matches.
    #[serde(default)]
    pub match_basenames: bool,

    /// Regular expression stripped from file stems before basename matching.
    #[serde(default)]
    pub recipe: Option<String>,
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// How levels of reference documents become categories.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LevelCopyPolicy {
    /// Reuse the category with the same name.
    Never,
    /// Reuse only when the appearance matches.
    #[default]
    IfDifferent,
    /// Always create a document-qualified category.
    Always,
}

/// When a font is embedded in the target.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FontPolicy {
    #[default]
    IfUsed,
    Always,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default)]
    pub level_copy: LevelCopyPolicy,

    /// Share categories and line styles between bridges by name.
    #[serde(default)]
    pub merge_definitions: bool,

    /// Suffix colliding element codes instead of dropping them.
    #[serde(default)]
    pub clone_duplicate_codes: bool,

    #[serde(default = "default_true")]
    pub generate_thumbnails: bool,

    /// Per-font embedding policy, keyed by font name.
    #[serde(default)]
    pub fonts: BTreeMap<String, FontPolicy>,

    #[serde(default)]
    pub default_font_policy: FontPolicy,

    #[serde(default)]
    pub import_rules: Vec<ImportRule>,
}

fn default_true() -> bool {
    true
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            level_copy: LevelCopyPolicy::default(),
            merge_definitions: false,
            clone_duplicate_codes: false,
            generate_thumbnails: default_true(),
            fonts: BTreeMap::new(),
            default_font_policy: FontPolicy::default(),
            import_rules: Vec::new(),
        }
    }
}

impl ConversionConfig {
    pub fn font_policy(&self, font: &str) -> FontPolicy {
        self.fonts
            .get(font)
            .copied()
            .unwrap_or(self.default_font_policy)
    }
}

// ---------------------------------------------------------------------------
// Geo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoConfig {
    #[serde(default)]
    pub method: TransformMethod,

    /// Coordinate system assumed for a root document that has none.
    #[serde(default)]
    pub input: Option<InputGcsDefinition>,
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate values that serde cannot check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.engine.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "engine.log_level".into(),
                detail: format!("must be one of {}", LOG_LEVELS.join(", ")),
            });
        }
        if self.engine.bridge_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "engine.bridge_key".into(),
                detail: "bridge key must not be empty".into(),
            });
        }
        if let Some(ref recipe) = self.identity.recipe {
            Recipe::new(recipe)?;
        }
        if let Some(ref input) = self.geo.input {
            if !(input.meters_per_unit.is_finite() && input.meters_per_unit > 0.0) {
                return Err(ConfigError::InvalidValue {
                    field: "geo.input.meters_per_unit".into(),
                    detail: "must be > 0".into(),
                });
            }
            if input.latitude.abs() >= 90.0 {
                return Err(ConfigError::InvalidValue {
                    field: "geo.input.latitude".into(),
                    detail: "must be within (-90, 90)".into(),
                });
            }
        }
        for (index, rule) in self.conversion.import_rules.iter().enumerate() {
            rule.validate(index)?;
        }
        for (bridge, globs) in &self.assignments {
            if globs.iter().any(|g| g.trim().is_empty()) {
                return Err(ConfigError::InvalidValue {
                    field: format!("assignments.{bridge}"),
                    detail: "patterns must not be empty".into(),
                });
            }
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.engine.data_dir.join(DATABASE_FILE)
    }

    /// Identity options with the recipe compiled.
    pub fn identity_options(&self) -> Result<IdentityOptions, ConfigError> {
        let recipe = self.identity.recipe.as_deref().map(Recipe::new).transpose()?;
        Ok(IdentityOptions {
            match_basenames: self.identity.match_basenames,
            recipe,
        })
    }

    pub fn assignment_oracle(&self) -> ConfigAssignments {
        ConfigAssignments::new(self.assignments.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[engine]
log_level = "debug"
data_dir = "/tmp/dgnsync"
bridge_key = "plant"

[identity]
match_basenames = true
recipe = '_v\d+$'

[conversion]
level_copy = "always"
merge_definitions = true
clone_duplicate_codes = true
generate_thumbnails = false
default_font_policy = "never"

[conversion.fonts]
Arial = "always"

[[conversion.import_rules]]
file = "site*.dgn"
new_name = "%file plan"

[geo]
method = "reprojection"

[geo.input]
latitude = 40.0
longitude = -75.0
azimuth_deg = 12.5

[assignments]
plant = ["p-*.dgn"]
civil = ["c-*.dgn", "road*.dgn"]
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.engine.bridge_key, "plant");
        assert!(config.identity.match_basenames);
        assert_eq!(config.conversion.level_copy, LevelCopyPolicy::Always);
        assert_eq!(config.conversion.font_policy("Arial"), FontPolicy::Always);
        assert_eq!(config.conversion.font_policy("Courier"), FontPolicy::Never);
        assert_eq!(config.conversion.import_rules.len(), 1);
        assert_eq!(config.geo.method, TransformMethod::UseReprojection);
        assert_eq!(config.geo.input.as_ref().unwrap().azimuth_deg, 12.5);
        assert_eq!(config.assignments["civil"].len(), 2);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/dgnsync/dgnsync.db"));
        config.validate().unwrap();

        let options = config.identity_options().unwrap();
        assert_eq!(options.recipe.unwrap().normalize("/x/Site_v2.dgn"), "site.dgn");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dgnsync.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_and_validate(&path).expect("load failed");
        assert_eq!(config.engine.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/dgnsync.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.identity.recipe = Some("(unclosed".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "identity.recipe"
        ));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.engine.log_level = "loud".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "engine.log_level"
        ));

        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.engine.bridge_key = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.log_level, "info");
        assert_eq!(config.engine.bridge_key, "default");
        assert!(!config.identity.match_basenames);
        assert_eq!(config.conversion.level_copy, LevelCopyPolicy::IfDifferent);
        assert!(config.conversion.generate_thumbnails);
        assert_eq!(config.geo.method, TransformMethod::UseGcsTransformWithScaling);
        assert!(config.assignments.is_empty());
        config.validate().unwrap();
    }
}
