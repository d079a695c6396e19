//! Flattening multiple inheritance to single inheritance plus capabilities.
//!
//! For every non-mixin class the first non-mixin base stays the base class.
//! Every other base becomes a capability tag, and the properties it would
//! have contributed are copied into the class. Mixin classes become
//! capability classes whose `applies_to` is the lowest common ancestor of
//! all classes carrying them.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::names::remap_reserved;
use super::{SourceClass, SourceProperty, SourceSchema, TargetClass, TargetProperty, TargetSchema};
use crate::errors::SchemaError;

/// Flatten `schema` and remap reserved property names.
pub fn flatten(schema: &SourceSchema) -> Result<TargetSchema, SchemaError> {
    let by_name: HashMap<&str, &SourceClass> =
        schema.classes.iter().map(|c| (c.name.as_str(), c)).collect();

    for class in &schema.classes {
        check_acyclic(schema, &by_name, class)?;
    }

    let is_mixin = |name: &str| by_name.get(name).map(|c| c.is_mixin).unwrap_or(false);

    let mut classes = Vec::with_capacity(schema.classes.len());
    for class in &schema.classes {
        let (base_class, secondaries): (Option<String>, Vec<&String>) = if class.is_mixin {
            (class.base_classes.first().cloned(), Vec::new())
        } else {
            let primary = class.base_classes.iter().find(|b| !is_mixin(b)).cloned();
            let rest = class
                .base_classes
                .iter()
                .filter(|b| Some(*b) != primary.as_ref())
                .collect();
            (primary, rest)
        };

        let mut properties: Vec<TargetProperty> =
            class.properties.iter().map(target_property).collect();
        for secondary in &secondaries {
            for inherited in inherited_properties(&by_name, secondary) {
                let present = properties
                    .iter()
                    .any(|p| p.name.eq_ignore_ascii_case(&inherited.name));
                if !present {
                    properties.push(target_property(inherited));
                }
            }
        }

        classes.push(TargetClass {
            name: class.name.clone(),
            base_class,
            properties,
            capabilities: secondaries.into_iter().cloned().collect(),
            is_capability: class.is_mixin,
            applies_to: None,
        });
    }

    // applies_to for capability classes
    let primary_of: HashMap<String, Option<String>> = classes
        .iter()
        .filter(|c| !c.is_capability)
        .map(|c| (c.name.clone(), c.base_class.clone()))
        .collect();
    let applies: Vec<(usize, Option<String>)> = classes
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_capability)
        .map(|(idx, c)| {
            let users: Vec<&str> = classes
                .iter()
                .filter(|u| u.capabilities.contains(&c.name))
                .map(|u| u.name.as_str())
                .collect();
            (idx, lowest_common_ancestor(&primary_of, &users))
        })
        .collect();
    for (idx, applies_to) in applies {
        classes[idx].applies_to = applies_to;
    }

    let mut target = TargetSchema {
        name: schema.name.clone(),
        alias: schema.alias().to_string(),
        version_major: schema.version_major,
        version_minor: schema.version_minor,
        classes,
    };
    remap_reserved(&mut target);
    debug!(schema = %target.name, classes = target.classes.len(), "flattened schema");
    Ok(target)
}

fn target_property(p: &SourceProperty) -> TargetProperty {
    TargetProperty {
        name: p.name.clone(),
        display_label: None,
        type_name: p.type_name.clone(),
    }
}

/// A class may not reach itself through its bases.
fn check_acyclic(
    schema: &SourceSchema,
    by_name: &HashMap<&str, &SourceClass>,
    start: &SourceClass,
) -> Result<(), SchemaError> {
    let mut stack: Vec<&str> = start.base_classes.iter().map(String::as_str).collect();
    let mut visited = HashSet::new();
    while let Some(name) = stack.pop() {
        if name == start.name {
            return Err(SchemaError::Invalid {
                name: schema.name.clone(),
                detail: format!("class '{}' derives from itself", start.name),
            });
        }
        if !visited.insert(name) {
            continue;
        }
        if let Some(class) = by_name.get(name) {
            stack.extend(class.base_classes.iter().map(String::as_str));
        }
    }
    Ok(())
}

/// Properties of `name` and all of its bases, nearest first. Unknown
/// (external) classes contribute nothing.
fn inherited_properties<'a>(
    by_name: &HashMap<&str, &'a SourceClass>,
    name: &str,
) -> Vec<&'a SourceProperty> {
    let mut out = Vec::new();
    let mut stack = vec![name.to_string()];
    let mut visited = HashSet::new();
    while let Some(current) = stack.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        if let Some(class) = by_name.get(current.as_str()) {
            out.extend(class.properties.iter());
            stack.extend(class.base_classes.iter().rev().cloned());
        }
    }
    out
}

/// Most specific class on every user's primary-base chain.
fn lowest_common_ancestor(
    primary_of: &HashMap<String, Option<String>>,
    users: &[&str],
) -> Option<String> {
    let chain = |start: &str| -> Vec<String> {
        let mut chain = vec![start.to_string()];
        let mut seen = HashSet::from([start.to_string()]);
        let mut current = primary_of.get(start).cloned().flatten();
        while let Some(name) = current {
            if !seen.insert(name.clone()) {
                break;
            }
            current = primary_of.get(&name).cloned().flatten();
            chain.push(name);
        }
        chain
    };

    let (first, rest) = users.split_first()?;
    let rest_chains: Vec<Vec<String>> = rest.iter().map(|u| chain(u)).collect();
    chain(first)
        .into_iter()
        .find(|candidate| rest_chains.iter().all(|c| c.contains(candidate)))
}
