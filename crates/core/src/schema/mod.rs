//! Schema reconciliation.
//!
//! Source schemas may use multiple inheritance, reserved property names and
//! may diverge between documents. They are flattened into single-inheritance
//! [`TargetSchema`]s with capability tags, checked against the versions
//! already imported, and merged into the target catalog.

pub mod flatten;
pub mod names;
pub mod reconciler;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::change::Fingerprint;
use crate::errors::SchemaError;
use crate::source::InstanceData;

pub use flatten::flatten;
pub use reconciler::{merge_schemas, ReconcileOutcome, SchemaHook, SchemaReconciler};

// ---------------------------------------------------------------------------
// Source schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceSchema {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default = "default_major")]
    pub version_major: u32,
    #[serde(default)]
    pub version_minor: u32,
    #[serde(default)]
    pub classes: Vec<SourceClass>,
}

fn default_major() -> u32 {
    1
}

impl SourceSchema {
    /// Short prefix used when remapping reserved names.
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn version(&self) -> (u32, u32) {
        (self.version_major, self.version_minor)
    }

    pub fn class(&self, name: &str) -> Option<&SourceClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Content checksum over the whole definition.
    pub fn checksum(&self) -> Result<String, SchemaError> {
        Fingerprint::of("schema", self)
            .map(|f| f.as_str().to_string())
            .map_err(|e| SchemaError::Invalid {
                name: self.name.clone(),
                detail: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceClass {
    pub name: String,
    /// Base classes in declaration order. The first non-mixin base is the
    /// primary base.
    #[serde(default)]
    pub base_classes: Vec<String>,
    #[serde(default)]
    pub properties: Vec<SourceProperty>,
    #[serde(default)]
    pub is_mixin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceProperty {
    pub name: String,
    #[serde(default = "default_type_name")]
    pub type_name: String,
}

fn default_type_name() -> String {
    "string".into()
}

// ---------------------------------------------------------------------------
// Target schemas
// ---------------------------------------------------------------------------

/// A single-inheritance schema as stored in the target catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetSchema {
    pub name: String,
    pub alias: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub classes: Vec<TargetClass>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetClass {
    pub name: String,
    pub base_class: Option<String>,
    pub properties: Vec<TargetProperty>,
    /// Secondary bases, kept as tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// `true` for mixin classes, which are only ever applied as tags.
    #[serde(default)]
    pub is_capability: bool,
    /// For capability classes: the most specific class every user derives from.
    #[serde(default)]
    pub applies_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetProperty {
    pub name: String,
    /// Original name when the property was renamed.
    #[serde(default)]
    pub display_label: Option<String>,
    pub type_name: String,
}

impl TargetProperty {
    /// Name the source used for this property.
    pub fn source_name(&self) -> &str {
        self.display_label.as_deref().unwrap_or(&self.name)
    }
}

impl TargetSchema {
    pub fn version(&self) -> (u32, u32) {
        (self.version_major, self.version_minor)
    }

    pub fn class(&self, name: &str) -> Option<&TargetClass> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Rename instance values to the property names used in this schema.
    /// Values of unknown classes or properties pass through unchanged.
    pub fn remap_instance(&self, data: &InstanceData) -> BTreeMap<String, serde_json::Value> {
        let Some(class) = self.class(&data.class) else {
            return data.values.clone();
        };
        data.values
            .iter()
            .map(|(key, value)| {
                let name = class
                    .properties
                    .iter()
                    .find(|p| p.source_name() == key)
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| key.clone());
                (name, value.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_tracks_content() {
        let mut schema = SourceSchema {
            name: "Plant".into(),
            alias: None,
            version_major: 1,
            version_minor: 0,
            classes: vec![SourceClass {
                name: "Pipe".into(),
                base_classes: Vec::new(),
                properties: Vec::new(),
                is_mixin: false,
            }],
        };
        let before = schema.checksum().unwrap();
        assert_eq!(before, schema.checksum().unwrap());
        schema.classes[0].properties.push(SourceProperty {
            name: "Diameter".into(),
            type_name: "double".into(),
        });
        assert_ne!(before, schema.checksum().unwrap());
        assert_eq!(schema.alias(), "Plant");
    }

    #[test]
    fn test_remap_instance_uses_display_label() {
        let schema = TargetSchema {
            name: "Plant".into(),
            alias: "pl".into(),
            version_major: 1,
            version_minor: 0,
            classes: vec![TargetClass {
                name: "Pipe".into(),
                base_class: None,
                properties: vec![TargetProperty {
                    name: "pl_Id_".into(),
                    display_label: Some("Id".into()),
                    type_name: "string".into(),
                }],
                capabilities: Vec::new(),
                is_capability: false,
                applies_to: None,
            }],
        };
        let data = InstanceData {
            schema: "Plant".into(),
            class: "Pipe".into(),
            values: [
                ("Id".to_string(), serde_json::json!("P-1")),
                ("Other".to_string(), serde_json::json!(1)),
            ]
            .into(),
        };
        let remapped = schema.remap_instance(&data);
        assert_eq!(remapped["pl_Id_"], serde_json::json!("P-1"));
        assert_eq!(remapped["Other"], serde_json::json!(1));
    }
}
