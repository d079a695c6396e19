//! dgnsync core library.
//!
//! This crate converts a graph of CAD source documents (a master file and
//! its nested attachments) into a persistent target element graph, and
//! re-runs against a changed source applying only the inserts, updates and
//! deletes needed while keeping target identity stable across runs.

pub mod change;
pub mod config;
pub mod convert;
pub mod coordinator;
pub mod db;
pub mod definitions;
pub mod errors;
pub mod geo;
pub mod host;
pub mod identity;
pub mod import_rules;
pub mod models;
pub mod reference;
pub mod schema;
pub mod source;
pub mod target;

// Re-exports for convenience.
pub use config::AppConfig;
pub use coordinator::{JobCoordinator, ProgressMonitor, RunOutcome, RunState};
pub use db::Database;
pub use errors::CoreError;
pub use host::SyncHost;
pub use identity::IdentityStore;
pub use source::{JsonSourceReader, MemorySourceReader, SourceReader};
pub use target::{SqliteTarget, TargetWriter};
