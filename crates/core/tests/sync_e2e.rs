//! End-to-end tests for incremental conversion.
//!
//! These tests drive the real `JobCoordinator` with:
//! - In-memory source documents (`MemorySourceReader`)
//! - The bundled SQLite target sharing the identity database
//! - Real identity mapping, change detection and schema reconciliation
//!
//! Every scenario runs in an in-memory SQLite database; no files are written.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dgnsync_core::config::{AppConfig, FontPolicy, LevelCopyPolicy};
use dgnsync_core::coordinator::{ProgressAction, ProgressMonitor, RunDiagnostic, RunOutcome};
use dgnsync_core::db::Database;
use dgnsync_core::errors::{JobError, ReferenceError, SchemaError};
use dgnsync_core::geo::{AffineTransform, Gcs, GeoPoint, Point3d};
use dgnsync_core::models::{Dimensionality, ModelKind, TargetId};
use dgnsync_core::schema::{SourceClass, SourceProperty, SourceSchema};
use dgnsync_core::source::{
    Attachment, Geometry, InstanceData, SharedCellDefinition, SourceDocument, SourceElement,
    SourceLevel, SourceModel, Symbology,
};
use dgnsync_core::target::{DefinitionKind, SqliteTarget, TargetWriter};
use dgnsync_core::{JobCoordinator, MemorySourceReader, RunState, SyncHost};

// ===========================================================================
// Helpers
// ===========================================================================

struct Env {
    reader: Arc<MemorySourceReader>,
    target: Arc<SqliteTarget>,
    host: SyncHost,
}

impl Env {
    fn new(config: AppConfig) -> Self {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let reader = Arc::new(MemorySourceReader::new());
        let target = Arc::new(SqliteTarget::new(Arc::clone(&db)));
        let host = SyncHost::new(config, db, reader.clone())
            .unwrap()
            .with_target(target.clone());
        Self {
            reader,
            target,
            host,
        }
    }

    fn run(&self, bridge: &str, root: &str) -> RunOutcome {
        let mut job = JobCoordinator::new(&self.host, bridge, root).unwrap();
        job.run().unwrap()
    }

    fn try_run(&self, bridge: &str, root: &str) -> Result<RunOutcome, JobError> {
        JobCoordinator::new(&self.host, bridge, root)?.run()
    }

    fn model_id(&self, name: &str) -> TargetId {
        self.target
            .list_models()
            .unwrap()
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| id)
            .unwrap_or_else(|| panic!("no target model named '{name}'"))
    }

    fn models_named(&self, prefix: &str) -> Vec<String> {
        self.target
            .list_models()
            .unwrap()
            .into_iter()
            .map(|(_, n)| n)
            .filter(|n| n.starts_with(prefix))
            .collect()
    }

    fn element_ids(&self, model: &str) -> Vec<TargetId> {
        self.target.list_element_ids(self.model_id(model)).unwrap()
    }
}

fn line(id: i64, from: Point3d, to: Point3d) -> SourceElement {
    SourceElement {
        id,
        element_type: "line".into(),
        geometry: Geometry::Line {
            start: from,
            end: to,
        },
        symbology: Symbology::default(),
        properties: None,
        code: None,
        last_modified: None,
    }
}

fn unit_line(id: i64) -> SourceElement {
    line(id, Point3d::new(0.0, 0.0, 0.0), Point3d::new(1.0, 0.0, 0.0))
}

fn model(id: i64, name: &str, elements: Vec<SourceElement>) -> SourceModel {
    SourceModel {
        id,
        name: name.into(),
        dimensionality: Dimensionality::ThreeD,
        kind: ModelKind::Normal,
        elements,
        attachments: Vec::new(),
    }
}

fn document(path: &str, elements: Vec<SourceElement>) -> SourceDocument {
    SourceDocument {
        path: path.into(),
        last_save_time: Some("t1".into()),
        file_size: Some(1024),
        default_model_id: Some(0),
        models: vec![model(0, "Default", elements)],
        ..Default::default()
    }
}

fn attach(id: i64, path: &str, offset: Point3d) -> Attachment {
    Attachment {
        id,
        document: path.into(),
        model_name: None,
        transform: AffineTransform::translation(offset),
        display: true,
        clip: None,
    }
}

fn with_attachments(mut doc: SourceDocument, attachments: Vec<Attachment>) -> SourceDocument {
    doc.models[0].attachments = attachments;
    doc
}

// ===========================================================================
// Round trip
// ===========================================================================

#[test]
fn test_insert_skip_update_delete_round_trip() {
    let env = Env::new(AppConfig::default());
    env.reader.put(document("/p/master.dgn", vec![unit_line(1)]));

    let first = env.run("b", "/p/master.dgn");
    assert_eq!(first.state, RunState::Committed);
    assert!(first.had_changes);
    assert_eq!(first.stats.inserted, 1);
    let ids = env.element_ids("Default");
    assert_eq!(ids.len(), 1);
    let element_id = ids[0];

    // unchanged source: no target writes at all
    let writes = env.target.write_count();
    let second = env.run("b", "/p/master.dgn");
    assert!(!second.had_changes);
    assert_eq!(second.stats.documents_skipped, 1);
    assert_eq!(second.stats.inserted + second.stats.updated + second.stats.deleted, 0);
    assert_eq!(env.target.write_count(), writes);

    // translate the element
    env.reader.update("/p/master.dgn", |doc| {
        doc.models[0].elements[0] = line(1, Point3d::new(10.0, 10.0, 10.0), Point3d::new(11.0, 10.0, 10.0));
    });
    let third = env.run("b", "/p/master.dgn");
    assert!(third.had_changes);
    assert_eq!(third.stats.updated, 1);
    assert_eq!(env.element_ids("Default"), vec![element_id]);
    let moved = env.target.get_element(element_id).unwrap().unwrap();
    assert_eq!(moved.placement.origin, Point3d::new(10.0, 10.0, 10.0));
    let bbox = moved.placement.bbox.unwrap();
    assert_eq!(bbox.size(), Point3d::new(1.0, 0.0, 0.0));

    // remove it
    env.reader.update("/p/master.dgn", |doc| doc.models[0].elements.clear());
    let fourth = env.run("b", "/p/master.dgn");
    assert_eq!(fourth.stats.deleted, 1);
    assert!(env.element_ids("Default").is_empty());
    assert!(env.target.get_element(element_id).unwrap().is_none());

    // project extents only ever grow
    let extents = env.target.project_extents().unwrap().unwrap();
    assert_eq!(extents.low, Point3d::new(0.0, 0.0, 0.0));
    assert_eq!(extents.high, Point3d::new(11.0, 10.0, 10.0));

    let runs = env.host.database().list_runs(10).unwrap();
    assert_eq!(runs.len(), 4);
    assert!(runs.iter().all(|r| r.state == "committed"));
}

#[test]
fn test_unchanged_rerun_without_save_time_writes_nothing() {
    let env = Env::new(AppConfig::default());
    let mut doc = document("/p/master.dgn", vec![unit_line(1), unit_line(2)]);
    doc.last_save_time = None;
    env.reader.put(doc);

    env.run("b", "/p/master.dgn");
    let writes = env.target.write_count();
    let thumbnails = env.target.thumbnail_requests().unwrap();
    assert!(!thumbnails.is_empty());

    let again = env.run("b", "/p/master.dgn");
    assert_eq!(again.stats.documents_skipped, 0);
    assert_eq!(again.stats.unchanged, 2);
    assert!(!again.had_changes);
    assert_eq!(env.target.write_count(), writes);
    assert_eq!(env.target.thumbnail_requests().unwrap(), thumbnails);
}

// ===========================================================================
// Document identity
// ===========================================================================

#[test]
fn test_same_guid_under_two_paths_is_converted_once() {
    let env = Env::new(AppConfig::default());
    let origin = Point3d::new(0.0, 0.0, 0.0);
    env.reader.put(with_attachments(
        document("/p/master_a.dgn", vec![unit_line(1)]),
        vec![attach(1, "/lib/shared.dgn", origin)],
    ));
    env.reader.put(with_attachments(
        document("/p/master_b.dgn", vec![unit_line(1)]),
        vec![attach(1, "/copy/shared_copy.dgn", origin)],
    ));
    let mut shared = document("/lib/shared.dgn", vec![unit_line(5)]);
    shared.guid = Some("G-1".into());
    env.reader.put(shared);
    let mut copy = document("/copy/shared_copy.dgn", vec![unit_line(5)]);
    copy.guid = Some("G-1".into());
    env.reader.put(copy);

    env.run("b", "/p/master_a.dgn");
    let second = env.run("b", "/p/master_b.dgn");

    assert_eq!(env.models_named("Default (shared").len(), 1);
    assert!(second.diagnostics.iter().any(|d| matches!(
        d,
        RunDiagnostic::ForeignModel { document, .. } if document == "/copy/shared_copy.dgn"
    )));
}

#[test]
fn test_basename_matching_merges_copies() {
    let mut config = AppConfig::default();
    config.identity.match_basenames = true;
    let env = Env::new(config);
    let origin = Point3d::new(0.0, 0.0, 0.0);
    env.reader.put(with_attachments(
        document("/a/master_a.dgn", Vec::new()),
        vec![attach(1, "/a/lib/pump.dgn", origin)],
    ));
    env.reader.put(with_attachments(
        document("/b/master_b.dgn", Vec::new()),
        vec![attach(1, "/b/lib/Pump.dgn", origin)],
    ));
    env.reader.put(document("/a/lib/pump.dgn", vec![unit_line(1)]));
    env.reader.put(document("/b/lib/Pump.dgn", vec![unit_line(1)]));

    env.run("b", "/a/master_a.dgn");
    let second = env.run("b", "/b/master_b.dgn");

    assert_eq!(env.models_named("Default (pump.dgn)").len(), 1);
    assert!(env.models_named("Default (Pump.dgn)").is_empty());
    assert!(second
        .diagnostics
        .iter()
        .any(|d| matches!(d, RunDiagnostic::ForeignModel { .. })));
}

#[test]
fn test_reference_only_root_is_rejected() {
    let env = Env::new(AppConfig::default());
    let mut doc = document("/p/ref.dgn", vec![unit_line(1)]);
    doc.reference_only = true;
    env.reader.put(doc);

    let err = env.try_run("b", "/p/ref.dgn").unwrap_err();
    assert!(matches!(
        err,
        JobError::Reference(ReferenceError::NotARootDocument { .. })
    ));
    assert!(env.target.list_models().unwrap().is_empty());
}

#[test]
fn test_reference_cycle_terminates() {
    let env = Env::new(AppConfig::default());
    let origin = Point3d::new(0.0, 0.0, 0.0);
    env.reader.put(with_attachments(
        document("/p/a.dgn", vec![unit_line(1)]),
        vec![attach(1, "/p/b.dgn", origin)],
    ));
    env.reader.put(with_attachments(
        document("/p/b.dgn", vec![unit_line(1)]),
        vec![attach(1, "/p/a.dgn", origin)],
    ));

    let outcome = env.run("b", "/p/a.dgn");
    assert_eq!(outcome.state, RunState::Committed);
    assert_eq!(outcome.stats.documents_converted, 2);
    assert_eq!(outcome.stats.inserted, 2);
    assert_eq!(env.element_ids("Default (b.dgn)").len(), 1);
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| matches!(d, RunDiagnostic::Reference { .. })));
}

// ===========================================================================
// Attachments
// ===========================================================================

#[test]
fn test_moved_attachment_updates_every_reference_element() {
    let env = Env::new(AppConfig::default());
    env.reader.put(with_attachments(
        document("/p/master.dgn", vec![unit_line(1)]),
        vec![attach(1, "/p/ref.dgn", Point3d::new(0.0, 0.0, 0.0))],
    ));
    env.reader.put(document("/p/ref.dgn", vec![unit_line(1)]));
    env.run("b", "/p/master.dgn");
    let ref_element = env.element_ids("Default (ref.dgn)")[0];

    env.reader.update("/p/master.dgn", |doc| {
        doc.models[0].attachments[0].transform =
            AffineTransform::translation(Point3d::new(5.0, 0.0, 0.0));
    });
    let outcome = env.run("b", "/p/master.dgn");
    assert_eq!(outcome.stats.updated, 1);
    assert_eq!(outcome.stats.unchanged, 1);
    assert_eq!(env.element_ids("Default (ref.dgn)"), vec![ref_element]);
    let moved = env.target.get_element(ref_element).unwrap().unwrap();
    assert_eq!(moved.placement.origin, Point3d::new(5.0, 0.0, 0.0));
}

#[test]
fn test_deleted_reference_document_is_removed() {
    let env = Env::new(AppConfig::default());
    let origin = Point3d::new(0.0, 0.0, 0.0);
    env.reader.put(with_attachments(
        document("/p/master.dgn", vec![unit_line(1)]),
        vec![attach(1, "/p/gone.dgn", origin), attach(2, "/p/kept.dgn", origin)],
    ));
    env.reader.put(document("/p/gone.dgn", vec![unit_line(1)]));
    env.reader.put(document("/p/kept.dgn", vec![unit_line(1)]));
    env.run("b", "/p/master.dgn");
    assert_eq!(env.models_named("Default (").len(), 2);

    env.reader
        .update("/p/master.dgn", |doc| doc.models[0].attachments.clear());
    env.reader.remove("/p/gone.dgn");
    let outcome = env.run("b", "/p/master.dgn");

    assert_eq!(outcome.stats.documents_deleted, 1);
    assert_eq!(outcome.stats.models_deleted, 1);
    assert!(env.models_named("Default (gone.dgn)").is_empty());
    // unreferenced but still on disk: content stays
    assert_eq!(env.element_ids("Default (kept.dgn)").len(), 1);
}

#[test]
fn test_removed_source_model_is_deleted() {
    let env = Env::new(AppConfig::default());
    let mut doc = document("/p/master.dgn", vec![unit_line(1)]);
    doc.models.push(model(1, "Sheet", vec![unit_line(2)]));
    env.reader.put(doc);
    env.run("b", "/p/master.dgn");
    assert_eq!(env.models_named("Sheet").len(), 1);

    env.reader.update("/p/master.dgn", |doc| {
        doc.models.truncate(1);
    });
    let outcome = env.run("b", "/p/master.dgn");
    assert_eq!(outcome.stats.models_deleted, 1);
    assert!(env.models_named("Sheet").is_empty());
}

// ===========================================================================
// Schemas
// ===========================================================================

fn plant_schema(minor: u32, classes: &[&str]) -> SourceSchema {
    SourceSchema {
        name: "Plant".into(),
        alias: None,
        version_major: 1,
        version_minor: minor,
        classes: classes
            .iter()
            .map(|name| SourceClass {
                name: name.to_string(),
                base_classes: Vec::new(),
                properties: vec![
                    SourceProperty {
                        name: "Id".into(),
                        type_name: "string".into(),
                    },
                    SourceProperty {
                        name: "Diameter".into(),
                        type_name: "double".into(),
                    },
                ],
                is_mixin: false,
            })
            .collect(),
    }
}

fn pipe(id: i64) -> SourceElement {
    let mut element = unit_line(id);
    element.properties = Some(InstanceData {
        schema: "Plant".into(),
        class: "Pipe".into(),
        values: BTreeMap::from([
            ("Id".to_string(), serde_json::json!("P-1")),
            ("Diameter".to_string(), serde_json::json!(0.25)),
        ]),
    });
    element
}

#[test]
fn test_schema_imported_once_used_and_versions_enforced() {
    let env = Env::new(AppConfig::default());
    let mut doc = document("/p/master.dgn", vec![unit_line(1)]);
    doc.schemas = vec![plant_schema(0, &["Pipe"])];
    env.reader.put(doc);

    // declared but unused
    let first = env.run("b", "/p/master.dgn");
    assert_eq!(first.stats.schemas_imported, 0);
    assert!(env.target.find_schema("Plant").unwrap().is_none());

    // first instance promotes it
    env.reader
        .update("/p/master.dgn", |doc| doc.models[0].elements.push(pipe(2)));
    let second = env.run("b", "/p/master.dgn");
    assert_eq!(second.stats.schemas_imported, 1);
    assert!(env.target.find_schema("Plant").unwrap().is_some());
    let ids = env.element_ids("Default");
    let converted = env.target.get_element(ids[1]).unwrap().unwrap();
    assert_eq!(converted.class_name, "Plant:Pipe");
    let properties = converted.properties.unwrap();
    assert_eq!(properties.get("Plant_Id_"), Some(&serde_json::json!("P-1")));
    assert_eq!(properties.get("Diameter"), Some(&serde_json::json!(0.25)));

    // same version, different content
    env.reader.update("/p/master.dgn", |doc| {
        doc.schemas = vec![plant_schema(0, &["Pipe", "Valve"])];
    });
    let err = env.try_run("b", "/p/master.dgn").unwrap_err();
    assert!(matches!(
        err,
        JobError::Schema(SchemaError::VersionConflict { .. })
    ));
    let runs = env.host.database().list_runs(1).unwrap();
    assert_eq!(runs[0].state, "aborted");

    // bumping the version merges
    env.reader.update("/p/master.dgn", |doc| {
        doc.schemas = vec![plant_schema(1, &["Pipe", "Valve"])];
    });
    let fourth = env.run("b", "/p/master.dgn");
    assert_eq!(fourth.stats.schemas_merged, 1);
    let merged = env.target.find_schema("Plant").unwrap().unwrap();
    assert_eq!((merged.version_major, merged.version_minor), (1, 1));
    assert!(merged.classes.iter().any(|c| c.name == "Valve"));
}

// ===========================================================================
// Definitions
// ===========================================================================

fn walls_document(path: &str) -> SourceDocument {
    let mut element = unit_line(1);
    element.symbology.level_id = 1;
    let mut doc = document(path, vec![element]);
    doc.levels = vec![SourceLevel {
        id: 1,
        name: "Walls".into(),
        appearance: Default::default(),
    }];
    doc
}

fn two_bridge_env(merge: bool) -> Env {
    let mut config = AppConfig::default();
    config.conversion.merge_definitions = merge;
    config.assignments = BTreeMap::from([
        ("arch".to_string(), vec!["a.dgn".to_string()]),
        ("struct".to_string(), vec!["b.dgn".to_string()]),
    ]);
    let env = Env::new(config);
    env.reader.put(walls_document("/p/a.dgn"));
    env.reader.put(walls_document("/p/b.dgn"));
    env.run("arch", "/p/a.dgn");
    env.run("struct", "/p/b.dgn");
    env
}

#[test]
fn test_categories_private_per_bridge() {
    let env = two_bridge_env(false);
    let categories = env.target.list_definitions(DefinitionKind::Category).unwrap();
    let walls: Vec<_> = categories.iter().filter(|c| c.name == "Walls").collect();
    let defaults: Vec<_> = categories.iter().filter(|c| c.name == "Default").collect();
    assert_eq!(walls.len(), 2);
    assert_ne!(walls[0].model_id, walls[1].model_id);
    assert_eq!(defaults.len(), 2);
}

#[test]
fn test_merged_categories_shared_between_bridges() {
    let env = two_bridge_env(true);
    let categories = env.target.list_definitions(DefinitionKind::Category).unwrap();
    let walls: Vec<_> = categories.iter().filter(|c| c.name == "Walls").collect();
    let defaults: Vec<_> = categories.iter().filter(|c| c.name == "Default").collect();
    assert_eq!(walls.len(), 1);
    assert_eq!(walls[0].model_id, env.model_id("Shared Definitions"));
    // the fallback category stays private to each job
    assert_eq!(defaults.len(), 2);
    assert_ne!(defaults[0].model_id, defaults[1].model_id);
}

#[test]
fn test_bridge_assigned_to_nested_reference_runs_from_master() {
    let mut config = AppConfig::default();
    config.assignments = BTreeMap::from([
        ("m".to_string(), vec!["master.dgn".to_string()]),
        ("r".to_string(), vec!["ref.dgn".to_string()]),
    ]);
    let env = Env::new(config);
    env.reader.put(with_attachments(
        document("/p/master.dgn", vec![unit_line(1)]),
        vec![attach(1, "/p/ref.dgn", Point3d::new(0.0, 0.0, 0.0))],
    ));
    env.reader.put(document("/p/ref.dgn", vec![unit_line(1), unit_line(2)]));

    let master = env.run("m", "/p/master.dgn");
    assert_eq!(master.state, RunState::Committed);
    assert_eq!(master.stats.documents_converted, 1);
    assert_eq!(master.stats.inserted, 1);

    // bridge r walks through the master it does not own to reach its reference
    let reference = env.run("r", "/p/master.dgn");
    assert_eq!(reference.state, RunState::Committed);
    assert_eq!(reference.stats.documents_converted, 1);
    assert_eq!(reference.stats.inserted, 2);
    assert_eq!(env.element_ids("Default").len(), 1);
    assert_eq!(env.element_ids("Default (ref.dgn)").len(), 2);

    let defaults: Vec<_> = env
        .target
        .list_definitions(DefinitionKind::Category)
        .unwrap()
        .into_iter()
        .filter(|c| c.name == "Default")
        .collect();
    assert_eq!(defaults.len(), 2);
    assert_ne!(defaults[0].model_id, defaults[1].model_id);

    let again = env.run("r", "/p/master.dgn");
    assert!(!again.had_changes);
    assert_eq!(env.element_ids("Default").len(), 1);
}

#[test]
fn test_bridge_with_nothing_assigned_is_rejected() {
    let mut config = AppConfig::default();
    config.assignments = BTreeMap::from([("m".to_string(), vec!["master.dgn".to_string()])]);
    let env = Env::new(config);
    env.reader.put(document("/p/master.dgn", vec![unit_line(1)]));

    let err = env.try_run("civil", "/p/master.dgn").unwrap_err();
    assert!(matches!(
        err,
        JobError::Reference(ReferenceError::NotARootDocument { .. })
    ));
    assert!(env.models_named("Default").is_empty());
}

#[test]
fn test_reference_levels_follow_copy_policy() {
    let mut config = AppConfig::default();
    config.conversion.level_copy = LevelCopyPolicy::Always;
    let env = Env::new(config);
    env.reader.put(with_attachments(
        walls_document("/p/master.dgn"),
        vec![attach(1, "/p/ref.dgn", Point3d::new(0.0, 0.0, 0.0))],
    ));
    env.reader.put(walls_document("/p/ref.dgn"));
    env.run("b", "/p/master.dgn");

    let names: Vec<String> = env
        .target
        .list_definitions(DefinitionKind::Category)
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert!(names.contains(&"Walls".to_string()));
    assert!(names.contains(&"Walls (ref.dgn)".to_string()));
}

#[test]
fn test_identical_shared_cells_share_one_geometry_part() {
    let env = Env::new(AppConfig::default());
    let cell = SharedCellDefinition {
        id: 7,
        name: "Valve".into(),
        geometry: vec![Geometry::Line {
            start: Point3d::new(0.0, 0.0, 0.0),
            end: Point3d::new(0.0, 1.0, 0.0),
        }],
    };
    let instance = |id: i64| SourceElement {
        id,
        element_type: "cell".into(),
        geometry: Geometry::CellInstance {
            definition_id: 7,
            origin: Point3d::new(2.0, 2.0, 0.0),
            scale: 1.0,
            rotation: 0.0,
        },
        symbology: Symbology::default(),
        properties: None,
        code: None,
        last_modified: None,
    };
    let mut master = with_attachments(
        document("/p/master.dgn", vec![instance(1)]),
        vec![attach(1, "/p/ref.dgn", Point3d::new(0.0, 0.0, 0.0))],
    );
    master.shared_cells = vec![cell.clone()];
    let mut reference = document("/p/ref.dgn", vec![instance(1)]);
    reference.shared_cells = vec![cell];
    env.reader.put(master);
    env.reader.put(reference);
    env.run("b", "/p/master.dgn");

    let a = env.target.get_element(env.element_ids("Default")[0]).unwrap().unwrap();
    let b = env
        .target
        .get_element(env.element_ids("Default (ref.dgn)")[0])
        .unwrap()
        .unwrap();
    assert!(a.geom_part_id.is_some());
    assert_eq!(a.geom_part_id, b.geom_part_id);
}

#[test]
fn test_changed_shared_cell_replaces_its_geometry_part() {
    let env = Env::new(AppConfig::default());
    let cell = |end_y: f64| SharedCellDefinition {
        id: 7,
        name: "Valve".into(),
        geometry: vec![Geometry::Line {
            start: Point3d::new(0.0, 0.0, 0.0),
            end: Point3d::new(0.0, end_y, 0.0),
        }],
    };
    let mut master = document(
        "/p/master.dgn",
        vec![SourceElement {
            id: 1,
            element_type: "cell".into(),
            geometry: Geometry::CellInstance {
                definition_id: 7,
                origin: Point3d::new(2.0, 2.0, 0.0),
                scale: 1.0,
                rotation: 0.0,
            },
            symbology: Symbology::default(),
            properties: None,
            code: None,
            last_modified: None,
        }],
    );
    master.shared_cells = vec![cell(1.0)];
    env.reader.put(master);
    env.run("b", "/p/master.dgn");
    let first = env.target.list_geom_parts().unwrap();
    assert_eq!(first.len(), 1);

    env.reader
        .update("/p/master.dgn", |doc| doc.shared_cells = vec![cell(3.0)]);
    let outcome = env.run("b", "/p/master.dgn");
    assert_eq!(outcome.stats.updated, 1);

    let parts = env.target.list_geom_parts().unwrap();
    assert_eq!(parts.len(), 1);
    assert_ne!(parts, first);
    let element = env.target.get_element(env.element_ids("Default")[0]).unwrap().unwrap();
    assert_eq!(element.geom_part_id, Some(parts[0]));
}

// ===========================================================================
// Failures and cancellation
// ===========================================================================

/// Cancels the run on the n-th model.
struct CancelOnModel {
    seen: AtomicUsize,
    at: usize,
}

impl ProgressMonitor for CancelOnModel {
    fn on_model(&self, _path: &str, _model: &str) -> ProgressAction {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.at {
            ProgressAction::Abort
        } else {
            ProgressAction::Continue
        }
    }
}

#[test]
fn test_cancelled_run_keeps_committed_models() {
    let env = Env::new(AppConfig::default());
    let mut doc = document("/p/master.dgn", vec![unit_line(1)]);
    doc.models.push(model(1, "Second", vec![unit_line(2)]));
    env.reader.put(doc);

    let monitor = Arc::new(CancelOnModel {
        seen: AtomicUsize::new(0),
        at: 2,
    });
    let mut job = JobCoordinator::new(&env.host, "b", "/p/master.dgn")
        .unwrap()
        .with_monitor(monitor);
    let outcome = job.run().unwrap();
    assert!(outcome.was_aborted());
    assert!(outcome.had_changes);
    drop(job);

    assert_eq!(env.element_ids("Default").len(), 1);
    assert!(env.models_named("Second").is_empty());
    assert_eq!(env.host.database().list_runs(1).unwrap()[0].state, "aborted");

    // the next run picks up where the cancelled one stopped
    let resumed = env.run("b", "/p/master.dgn");
    assert_eq!(resumed.state, RunState::Committed);
    assert_eq!(resumed.stats.unchanged, 1);
    assert_eq!(resumed.stats.inserted, 1);
    assert_eq!(env.element_ids("Second").len(), 1);
}

#[test]
fn test_saving_after_a_run_ends_leaves_no_transaction_open() {
    let env = Env::new(AppConfig::default());
    let mut doc = document("/p/master.dgn", vec![unit_line(1)]);
    doc.models.push(model(1, "Second", vec![unit_line(2)]));
    env.reader.put(doc);

    let monitor = Arc::new(CancelOnModel {
        seen: AtomicUsize::new(0),
        at: 2,
    });
    let mut job = JobCoordinator::new(&env.host, "b", "/p/master.dgn")
        .unwrap()
        .with_monitor(monitor);
    assert!(job.run().unwrap().was_aborted());
    job.save_changes().unwrap();
    drop(job);
    assert!(!env.host.database().in_transaction());

    // a failing run after that still leaves its aborted record behind
    let before = env.host.database().list_runs(100).unwrap().len();
    let err = env.try_run("b", "/p/missing.dgn").unwrap_err();
    assert!(matches!(
        err,
        JobError::Reference(ReferenceError::DocumentNotFound(_))
    ));
    let runs = env.host.database().list_runs(100).unwrap();
    assert_eq!(runs.len(), before + 1);
    assert_eq!(runs[0].state, "aborted");

    let mut job = JobCoordinator::new(&env.host, "b", "/p/master.dgn").unwrap();
    assert_eq!(job.run().unwrap().state, RunState::Committed);
    job.save_changes().unwrap();
    drop(job);
    assert!(!env.host.database().in_transaction());
}

#[test]
fn test_unconvertible_element_is_discarded_until_it_changes() {
    let env = Env::new(AppConfig::default());
    let mut opaque = unit_line(2);
    opaque.element_type = "mesh".into();
    opaque.geometry = Geometry::Opaque {
        payload: "00ff".into(),
    };
    let mut doc = document("/p/master.dgn", vec![unit_line(1), opaque]);
    doc.last_save_time = None;
    env.reader.put(doc);

    let first = env.run("b", "/p/master.dgn");
    assert_eq!(first.stats.inserted, 1);
    assert_eq!(first.stats.discarded, 1);
    assert!(first.diagnostics.iter().any(|d| matches!(
        d,
        RunDiagnostic::ElementDiscarded { source_element_id: 2, .. }
    )));

    // not retried while unchanged
    let writes = env.target.write_count();
    let second = env.run("b", "/p/master.dgn");
    assert_eq!(second.stats.discarded, 1);
    assert!(!second
        .diagnostics
        .iter()
        .any(|d| matches!(d, RunDiagnostic::ElementDiscarded { .. })));
    assert_eq!(env.target.write_count(), writes);

    // fixed in the source: converted
    env.reader.update("/p/master.dgn", |doc| {
        doc.models[0].elements[1] = unit_line(2);
    });
    let third = env.run("b", "/p/master.dgn");
    assert_eq!(third.stats.inserted, 1);
    assert_eq!(third.stats.discarded, 0);
    assert_eq!(env.element_ids("Default").len(), 2);
}

// ===========================================================================
// Codes, fonts, coordinate systems
// ===========================================================================

fn coded_pair() -> SourceDocument {
    let mut first = unit_line(1);
    first.code = Some("P-1".into());
    let mut second = unit_line(2);
    second.code = Some("P-1".into());
    document("/p/master.dgn", vec![first, second])
}

#[test]
fn test_duplicate_code_dropped_by_default() {
    let env = Env::new(AppConfig::default());
    env.reader.put(coded_pair());
    let outcome = env.run("b", "/p/master.dgn");

    let ids = env.element_ids("Default");
    let first = env.target.get_element(ids[0]).unwrap().unwrap();
    let second = env.target.get_element(ids[1]).unwrap().unwrap();
    assert_eq!(first.code.as_deref(), Some("P-1"));
    assert_eq!(second.code, None);
    assert!(outcome.diagnostics.iter().any(|d| matches!(
        d,
        RunDiagnostic::CodeCollision { assigned: None, .. }
    )));
}

#[test]
fn test_duplicate_code_cloned_when_enabled() {
    let mut config = AppConfig::default();
    config.conversion.clone_duplicate_codes = true;
    let env = Env::new(config);
    env.reader.put(coded_pair());
    env.run("b", "/p/master.dgn");

    let ids = env.element_ids("Default");
    let second = env.target.get_element(ids[1]).unwrap().unwrap();
    assert_eq!(second.code.as_deref(), Some("P-1-2"));
}

#[test]
fn test_fonts_embedded_per_policy() {
    let mut config = AppConfig::default();
    config
        .conversion
        .fonts
        .insert("Courier".into(), FontPolicy::Always);
    let env = Env::new(config);
    let mut text = unit_line(1);
    text.geometry = Geometry::Text {
        origin: Point3d::new(0.0, 0.0, 0.0),
        text: "PUMP".into(),
        height: 1.0,
    };
    text.symbology.font = Some("Arial".into());
    let mut doc = document("/p/master.dgn", vec![text]);
    doc.fonts = vec!["Arial".into(), "Courier".into(), "Symbols".into()];
    env.reader.put(doc);

    let outcome = env.run("b", "/p/master.dgn");
    assert_eq!(outcome.stats.fonts_embedded, 2);
    assert_eq!(
        env.target.list_fonts().unwrap(),
        vec!["Arial".to_string(), "Courier".to_string()]
    );
}

#[test]
fn test_target_adopts_root_coordinate_system() {
    let env = Env::new(AppConfig::default());
    let gcs = Gcs {
        name: "Site Grid".into(),
        datum: "WGS84".into(),
        origin: GeoPoint {
            latitude: 40.0,
            longitude: -74.0,
            elevation: 0.0,
        },
        azimuth_deg: 0.0,
        meters_per_unit: 1.0,
        false_origin: Point3d::new(0.0, 0.0, 0.0),
    };
    let mut doc = document("/p/master.dgn", vec![unit_line(1)]);
    doc.gcs = Some(gcs.clone());
    env.reader.put(doc);

    env.run("b", "/p/master.dgn");
    assert_eq!(env.target.gcs().unwrap(), Some(gcs));
    let element = env.target.get_element(env.element_ids("Default")[0]).unwrap().unwrap();
    assert_eq!(element.placement.origin, Point3d::new(0.0, 0.0, 0.0));
}
