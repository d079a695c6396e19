//! Walking the attachment graph from a root document.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::assignment::AssignmentOracle;
use crate::errors::{ReferenceError, SourceError};
use crate::geo::AffineTransform;
use crate::identity::IdentityStore;
use crate::models::DocumentRecord;
use crate::source::{Attachment, SourceDocument, SourceReader};

/// Classification of an attachment edge in the depth-first walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// First discovery of the attached document.
    Tree,
    /// The attached document was already fully resolved (shared reference).
    Cross,
    /// The attached document is still being resolved (cycle).
    Back,
}

#[derive(Debug, Clone)]
pub struct ReferenceEdge {
    /// Index of the attaching document in [`ReferenceGraph::documents`].
    pub from: usize,
    /// Index of the attached document.
    pub to: usize,
    pub attachment_id: i64,
    pub kind: EdgeKind,
}

/// Structural findings that do not stop the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceDiagnostic {
    /// A document attaches itself.
    SelfReference { document_id: i64, attachment_id: i64 },
    /// A different file resolved to the identity of a document that is
    /// still being resolved.
    IdentityCollision {
        document_id: i64,
        resolving_path: String,
        attached_path: String,
    },
    /// An attachment closes a cycle.
    Cycle { from_document: i64, to_document: i64 },
    /// An attached document does not exist or cannot be read.
    MissingReference { from_document: i64, path: String, detail: String },
}

impl std::fmt::Display for ReferenceDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfReference {
                document_id,
                attachment_id,
            } => write!(f, "document {document_id} attaches itself (attachment {attachment_id})"),
            Self::IdentityCollision {
                document_id,
                resolving_path,
                attached_path,
            } => write!(
                f,
                "'{attached_path}' resolves to document {document_id} while '{resolving_path}' is still resolving"
            ),
            Self::Cycle {
                from_document,
                to_document,
            } => write!(f, "reference cycle from document {from_document} back to {to_document}"),
            Self::MissingReference {
                from_document,
                path,
                detail,
            } => write!(f, "document {from_document} references missing '{path}': {detail}"),
        }
    }
}

/// One document reached from the root.
#[derive(Debug, Clone)]
pub struct ResolvedDocument {
    pub record: DocumentRecord,
    pub source: Arc<SourceDocument>,
    /// Converted by this bridge. Unassigned documents are topology only.
    pub assigned: bool,
    pub is_root: bool,
    /// Number of tree edges from the root.
    pub depth: usize,
    /// Composed attachment transforms from this document into the root.
    pub path_transform: AffineTransform,
}

/// The resolved document set. `documents[0]` is the root; the rest follow
/// in discovery order.
#[derive(Debug, Clone, Default)]
pub struct ReferenceGraph {
    pub documents: Vec<ResolvedDocument>,
    pub edges: Vec<ReferenceEdge>,
    pub diagnostics: Vec<ReferenceDiagnostic>,
}

impl ReferenceGraph {
    pub fn root(&self) -> Option<&ResolvedDocument> {
        self.documents.first()
    }

    pub fn find(&self, document_id: i64) -> Option<&ResolvedDocument> {
        self.documents.iter().find(|d| d.record.id == document_id)
    }

    pub fn contains(&self, document_id: i64) -> bool {
        self.find(document_id).is_some()
    }

    /// Documents this bridge converts, root first.
    pub fn assigned(&self) -> impl Iterator<Item = &ResolvedDocument> {
        self.documents.iter().filter(|d| d.assigned)
    }

    pub fn edges_of_kind(&self, kind: EdgeKind) -> impl Iterator<Item = &ReferenceEdge> {
        self.edges.iter().filter(move |e| e.kind == kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// One open document on the explicit DFS stack.
struct Frame {
    node: usize,
    attachments: Vec<Attachment>,
    next: usize,
}

impl Frame {
    fn new(node: usize, source: &SourceDocument) -> Self {
        let attachments = source
            .models
            .iter()
            .flat_map(|m| m.attachments.iter().cloned())
            .collect();
        Self {
            node,
            attachments,
            next: 0,
        }
    }
}

/// Resolves the document graph reachable from a root.
pub struct ReferenceResolver<'a> {
    store: &'a IdentityStore,
    reader: &'a dyn SourceReader,
    oracle: &'a dyn AssignmentOracle,
    bridge_key: &'a str,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(
        store: &'a IdentityStore,
        reader: &'a dyn SourceReader,
        oracle: &'a dyn AssignmentOracle,
        bridge_key: &'a str,
    ) -> Self {
        Self {
            store,
            reader,
            oracle,
            bridge_key,
        }
    }

    /// Read the root document and check that it can be converted as a root.
    pub fn read_root(&self, root_path: &str) -> Result<Arc<SourceDocument>, ReferenceError> {
        if !self.reader.exists(root_path) {
            return Err(ReferenceError::DocumentNotFound(root_path.to_string()));
        }
        let source = match self.reader.read_document(root_path) {
            Ok(source) => source,
            Err(SourceError::NotFound(path)) => return Err(ReferenceError::DocumentNotFound(path)),
            Err(e) => return Err(e.into()),
        };
        self.check_root(&source)?;
        Ok(source)
    }

    fn check_root(&self, source: &SourceDocument) -> Result<(), ReferenceError> {
        let not_root = |detail: &str| ReferenceError::NotARootDocument {
            path: source.path.clone(),
            detail: detail.to_string(),
        };
        if source.reference_only {
            return Err(not_root("document is reference-only"));
        }
        if source.models.is_empty() {
            return Err(not_root("document has no models"));
        }
        Ok(())
    }

    /// Walk every attachment reachable from `root_path`.
    ///
    /// Shared references converge on one node. Cycles and self-references
    /// terminate: back edges are recorded but never descended. The root is
    /// walked even when another bridge owns it, so a bridge assigned to a
    /// nested reference still finds its documents; a graph with nothing
    /// assigned to the bridge fails with `NotARootDocument`.
    pub fn resolve(&self, root_path: &str) -> Result<ReferenceGraph, ReferenceError> {
        let root_source = self.read_root(root_path)?;
        let root_record = self
            .store
            .record_document(&root_source.path, root_source.guid.as_deref())?;

        let mut graph = ReferenceGraph::default();
        let mut visits: HashMap<i64, (Visit, usize)> = HashMap::new();

        visits.insert(root_record.id, (Visit::InProgress, 0));
        let mut stack = vec![Frame::new(0, &root_source)];
        graph.documents.push(ResolvedDocument {
            assigned: self.oracle.is_assigned_to_bridge(&root_source.path, self.bridge_key),
            record: root_record,
            source: root_source,
            is_root: true,
            depth: 0,
            path_transform: AffineTransform::identity(),
        });

        while let Some(frame) = stack.last_mut() {
            let Some(attachment) = frame.attachments.get(frame.next).cloned() else {
                let node = frame.node;
                stack.pop();
                let id = graph.documents[node].record.id;
                visits.insert(id, (Visit::Done, node));
                continue;
            };
            frame.next += 1;
            let parent = frame.node;
            let parent_id = graph.documents[parent].record.id;

            let source = match self.read_attached(&attachment.document) {
                Ok(source) => source,
                Err(detail) => {
                    warn!(from = parent_id, path = %attachment.document, %detail, "missing reference");
                    graph.diagnostics.push(ReferenceDiagnostic::MissingReference {
                        from_document: parent_id,
                        path: attachment.document.clone(),
                        detail,
                    });
                    continue;
                }
            };
            let record = self
                .store
                .record_document(&source.path, source.guid.as_deref())?;

            if record.id == parent_id {
                graph.diagnostics.push(ReferenceDiagnostic::SelfReference {
                    document_id: record.id,
                    attachment_id: attachment.id,
                });
                self.check_collision(&mut graph, parent, &source.path);
                graph.edges.push(ReferenceEdge {
                    from: parent,
                    to: parent,
                    attachment_id: attachment.id,
                    kind: EdgeKind::Back,
                });
                continue;
            }

            match visits.get(&record.id).copied() {
                Some((Visit::InProgress, node)) => {
                    debug!(from = parent_id, to = record.id, "back edge");
                    graph.diagnostics.push(ReferenceDiagnostic::Cycle {
                        from_document: parent_id,
                        to_document: record.id,
                    });
                    self.check_collision(&mut graph, node, &source.path);
                    graph.edges.push(ReferenceEdge {
                        from: parent,
                        to: node,
                        attachment_id: attachment.id,
                        kind: EdgeKind::Back,
                    });
                }
                Some((Visit::Done, node)) => {
                    graph.edges.push(ReferenceEdge {
                        from: parent,
                        to: node,
                        attachment_id: attachment.id,
                        kind: EdgeKind::Cross,
                    });
                }
                None => {
                    let node = graph.documents.len();
                    let parent_doc = &graph.documents[parent];
                    let resolved = ResolvedDocument {
                        assigned: self.oracle.is_assigned_to_bridge(&source.path, self.bridge_key),
                        is_root: false,
                        depth: parent_doc.depth + 1,
                        path_transform: parent_doc.path_transform.compose(&attachment.transform),
                        record,
                        source,
                    };
                    debug!(
                        id = resolved.record.id,
                        path = %resolved.record.source_path,
                        depth = resolved.depth,
                        assigned = resolved.assigned,
                        "resolved reference"
                    );
                    visits.insert(resolved.record.id, (Visit::InProgress, node));
                    graph.edges.push(ReferenceEdge {
                        from: parent,
                        to: node,
                        attachment_id: attachment.id,
                        kind: EdgeKind::Tree,
                    });
                    let frame = Frame::new(node, &resolved.source);
                    graph.documents.push(resolved);
                    stack.push(frame);
                }
            }
        }

        if graph.assigned().next().is_none() {
            return Err(ReferenceError::NotARootDocument {
                path: root_path.to_string(),
                detail: format!(
                    "no document reachable from it is assigned to bridge '{}'",
                    self.bridge_key
                ),
            });
        }

        info!(
            root = root_path,
            documents = graph.documents.len(),
            assigned = graph.assigned().count(),
            diagnostics = graph.diagnostics.len(),
            "reference graph resolved"
        );
        Ok(graph)
    }

    fn read_attached(&self, path: &str) -> Result<Arc<SourceDocument>, String> {
        if !self.reader.exists(path) {
            return Err("document does not exist".into());
        }
        self.reader.read_document(path).map_err(|e| e.to_string())
    }

    /// A different file landing on a node that is still resolving.
    fn check_collision(&self, graph: &mut ReferenceGraph, node: usize, attached_path: &str) {
        let resolving = &graph.documents[node].record;
        if resolving.source_path != attached_path {
            warn!(
                document_id = resolving.id,
                resolving = %resolving.source_path,
                attached = attached_path,
                "identity collision on a resolving document"
            );
            graph.diagnostics.push(ReferenceDiagnostic::IdentityCollision {
                document_id: resolving.id,
                resolving_path: resolving.source_path.clone(),
                attached_path: attached_path.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::geo::Point3d;
    use crate::identity::IdentityOptions;
    use crate::models::{Dimensionality, ModelKind};
    use crate::reference::{AssignAll, ConfigAssignments};
    use crate::source::{MemorySourceReader, SourceModel};

    fn store() -> IdentityStore {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let mut store = IdentityStore::open(db, IdentityOptions::default()).unwrap();
        store.begin_run("b", "/master.dgn").unwrap();
        store
    }

    fn attach(id: i64, path: &str, offset: f64) -> Attachment {
        Attachment {
            id,
            document: path.into(),
            model_name: None,
            transform: AffineTransform::translation(Point3d::new(offset, 0.0, 0.0)),
            display: true,
            clip: None,
        }
    }

    fn doc(path: &str, attachments: Vec<Attachment>) -> SourceDocument {
        SourceDocument {
            path: path.into(),
            default_model_id: Some(0),
            models: vec![SourceModel {
                id: 0,
                name: "Default".into(),
                dimensionality: Dimensionality::ThreeD,
                kind: ModelKind::Normal,
                elements: Vec::new(),
                attachments,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_shared_reference_converges() {
        let reader = MemorySourceReader::new();
        reader.put(doc(
            "/master.dgn",
            vec![attach(1, "/a.dgn", 10.0), attach(2, "/b.dgn", 20.0)],
        ));
        reader.put(doc("/a.dgn", vec![attach(1, "/shared.dgn", 1.0)]));
        reader.put(doc("/b.dgn", vec![attach(1, "/shared.dgn", 2.0)]));
        reader.put(doc("/shared.dgn", Vec::new()));
        let store = store();

        let graph = ReferenceResolver::new(&store, &reader, &AssignAll, "b")
            .resolve("/master.dgn")
            .unwrap();
        assert_eq!(graph.documents.len(), 4);
        assert_eq!(graph.edges_of_kind(EdgeKind::Cross).count(), 1);
        assert!(graph.diagnostics.is_empty());

        let shared = graph
            .documents
            .iter()
            .find(|d| d.record.source_path == "/shared.dgn")
            .unwrap();
        assert_eq!(shared.depth, 2);
        // first discovery wins: master -> a (10) -> shared (1)
        assert_eq!(shared.path_transform.translation, Point3d::new(11.0, 0.0, 0.0));
    }

    #[test]
    fn test_cycles_and_self_references_terminate() {
        let reader = MemorySourceReader::new();
        reader.put(doc(
            "/master.dgn",
            vec![attach(1, "/a.dgn", 0.0), attach(2, "/master.dgn", 0.0)],
        ));
        reader.put(doc("/a.dgn", vec![attach(1, "/master.dgn", 0.0)]));
        let store = store();

        let graph = ReferenceResolver::new(&store, &reader, &AssignAll, "b")
            .resolve("/master.dgn")
            .unwrap();
        assert_eq!(graph.documents.len(), 2);
        assert_eq!(graph.edges_of_kind(EdgeKind::Back).count(), 2);
        assert!(graph
            .diagnostics
            .iter()
            .any(|d| matches!(d, ReferenceDiagnostic::Cycle { .. })));
        assert!(graph
            .diagnostics
            .iter()
            .any(|d| matches!(d, ReferenceDiagnostic::SelfReference { .. })));
    }

    #[test]
    fn test_missing_reference_is_a_diagnostic() {
        let reader = MemorySourceReader::new();
        reader.put(doc("/master.dgn", vec![attach(1, "/gone.dgn", 0.0)]));
        let store = store();
        let graph = ReferenceResolver::new(&store, &reader, &AssignAll, "b")
            .resolve("/master.dgn")
            .unwrap();
        assert_eq!(graph.documents.len(), 1);
        assert!(matches!(
            graph.diagnostics[0],
            ReferenceDiagnostic::MissingReference { .. }
        ));
    }

    #[test]
    fn test_root_checks() {
        let reader = MemorySourceReader::new();
        let mut reference = doc("/ref.dgn", Vec::new());
        reference.reference_only = true;
        reader.put(reference);
        let store = store();
        let resolver = ReferenceResolver::new(&store, &reader, &AssignAll, "b");

        assert!(matches!(
            resolver.resolve("/ref.dgn"),
            Err(ReferenceError::NotARootDocument { .. })
        ));
        assert!(matches!(
            resolver.resolve("/nope.dgn"),
            Err(ReferenceError::DocumentNotFound(_))
        ));
    }

    #[test]
    fn test_unassigned_documents_are_topology_only() {
        let reader = MemorySourceReader::new();
        reader.put(doc("/p-master.dgn", vec![attach(1, "/c-road.dgn", 0.0)]));
        reader.put(doc("/c-road.dgn", vec![attach(1, "/p-pipe.dgn", 0.0)]));
        reader.put(doc("/p-pipe.dgn", Vec::new()));
        let oracle = ConfigAssignments::new(
            [("plant".to_string(), vec!["p-*.dgn".to_string()])].into(),
        );
        let store = store();
        let graph = ReferenceResolver::new(&store, &reader, &oracle, "plant")
            .resolve("/p-master.dgn")
            .unwrap();
        assert_eq!(graph.documents.len(), 3);
        let assigned: Vec<&str> = graph
            .assigned()
            .map(|d| d.record.source_path.as_str())
            .collect();
        assert_eq!(assigned, vec!["/p-master.dgn", "/p-pipe.dgn"]);
    }

    #[test]
    fn test_unassigned_root_is_walked_for_nested_assignments() {
        let reader = MemorySourceReader::new();
        reader.put(doc("/master.dgn", vec![attach(1, "/ref.dgn", 0.0)]));
        reader.put(doc("/ref.dgn", Vec::new()));
        let oracle = ConfigAssignments::new(
            [
                ("m".to_string(), vec!["master.dgn".to_string()]),
                ("r".to_string(), vec!["ref.dgn".to_string()]),
            ]
            .into(),
        );
        let store = store();

        let graph = ReferenceResolver::new(&store, &reader, &oracle, "r")
            .resolve("/master.dgn")
            .unwrap();
        let root = graph.root().unwrap();
        assert!(root.is_root);
        assert!(!root.assigned);
        let assigned: Vec<&str> = graph
            .assigned()
            .map(|d| d.record.source_path.as_str())
            .collect();
        assert_eq!(assigned, vec!["/ref.dgn"]);

        let err = ReferenceResolver::new(&store, &reader, &oracle, "civil")
            .resolve("/master.dgn")
            .unwrap_err();
        assert!(matches!(err, ReferenceError::NotARootDocument { .. }));
    }

    #[test]
    fn test_copy_carrying_root_guid_is_an_identity_collision() {
        let reader = MemorySourceReader::new();
        let mut master = doc("/master.dgn", vec![attach(1, "/a.dgn", 0.0)]);
        master.guid = Some("guid-master".into());
        let mut copy = doc("/copy.dgn", vec![attach(1, "/a.dgn", 0.0)]);
        copy.guid = Some("guid-master".into());
        reader.put(master);
        reader.put(doc("/a.dgn", vec![attach(1, "/copy.dgn", 0.0)]));
        reader.put(copy);
        let store = store();

        let graph = ReferenceResolver::new(&store, &reader, &AssignAll, "b")
            .resolve("/master.dgn")
            .unwrap();
        assert_eq!(graph.documents.len(), 2);
        let root_id = graph.root().unwrap().record.id;
        assert!(graph.diagnostics.iter().any(|d| matches!(
            d,
            ReferenceDiagnostic::Cycle { to_document, .. } if *to_document == root_id
        )));
        assert!(graph.diagnostics.iter().any(|d| matches!(
            d,
            ReferenceDiagnostic::IdentityCollision { resolving_path, attached_path, .. }
                if resolving_path == "/master.dgn" && attached_path == "/copy.dgn"
        )));
        assert_eq!(graph.edges_of_kind(EdgeKind::Back).count(), 1);
    }
}
