//! Reference graph resolution and bridge assignment.

pub mod assignment;
pub mod resolver;

pub use assignment::{AssignAll, AssignmentOracle, ConfigAssignments};
pub use resolver::{
    EdgeKind, ReferenceDiagnostic, ReferenceEdge, ReferenceGraph, ReferenceResolver,
    ResolvedDocument,
};
