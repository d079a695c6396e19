//! Reserved property names.
//!
//! The target reserves a handful of system property names. A source
//! property using one is renamed to `{alias}_{name}_`, or
//! `{alias}_{name}_{n}` if that is also taken, and keeps its original name
//! as display label.

use tracing::debug;

use super::TargetSchema;

pub const RESERVED_PROPERTY_NAMES: &[&str] = &[
    "ECInstanceId",
    "Id",
    "ECClassId",
    "SourceECInstanceId",
    "SourceId",
    "SourceECClassId",
    "TargetECInstanceId",
    "TargetId",
    "TargetECClassId",
];

/// Case-insensitive check against [`RESERVED_PROPERTY_NAMES`].
pub fn is_reserved(name: &str) -> bool {
    RESERVED_PROPERTY_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(name))
}

/// Rename reserved properties in every class of `schema`. Deterministic:
/// the same input always yields the same names.
pub fn remap_reserved(schema: &mut TargetSchema) {
    let alias = schema.alias.clone();
    for class in &mut schema.classes {
        for idx in 0..class.properties.len() {
            let original = class.properties[idx].name.clone();
            if !is_reserved(&original) {
                continue;
            }
            let taken = |candidate: &str| {
                class
                    .properties
                    .iter()
                    .any(|p| p.name.eq_ignore_ascii_case(candidate))
            };
            let mut candidate = format!("{alias}_{original}_");
            let mut n = 1;
            while taken(&candidate) {
                candidate = format!("{alias}_{original}_{n}");
                n += 1;
            }
            debug!(class = %class.name, from = %original, to = %candidate, "renamed reserved property");
            let property = &mut class.properties[idx];
            property.name = candidate;
            property.display_label = Some(original);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{TargetClass, TargetProperty};

    fn prop(name: &str) -> TargetProperty {
        TargetProperty {
            name: name.into(),
            display_label: None,
            type_name: "string".into(),
        }
    }

    fn schema(props: Vec<TargetProperty>) -> TargetSchema {
        TargetSchema {
            name: "Plant".into(),
            alias: "pl".into(),
            version_major: 1,
            version_minor: 0,
            classes: vec![TargetClass {
                name: "Pipe".into(),
                base_class: None,
                properties: props,
                capabilities: Vec::new(),
                is_capability: false,
                applies_to: None,
            }],
        }
    }

    #[test]
    fn test_reserved_is_case_insensitive() {
        assert!(is_reserved("id"));
        assert!(is_reserved("ECCLASSID"));
        assert!(!is_reserved("Identifier"));
    }

    #[test]
    fn test_remap_keeps_display_label() {
        let mut s = schema(vec![prop("Id"), prop("Length")]);
        remap_reserved(&mut s);
        let props = &s.classes[0].properties;
        assert_eq!(props[0].name, "pl_Id_");
        assert_eq!(props[0].display_label.as_deref(), Some("Id"));
        assert_eq!(props[1].name, "Length");
        assert_eq!(props[1].display_label, None);
    }

    #[test]
    fn test_remap_avoids_collisions() {
        let mut s = schema(vec![prop("pl_Id_"), prop("Id"), prop("pl_Id_1")]);
        remap_reserved(&mut s);
        let names: Vec<&str> = s.classes[0].properties.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["pl_Id_", "pl_Id_2", "pl_Id_1"]);
    }
}
