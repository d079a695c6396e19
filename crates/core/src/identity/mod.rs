//! Persistent source-to-target identity.
//!
//! Document resolution order:
//! 1. Embedded GUID (exact match)
//! 2. Recipe-normalized basename, if basename matching is enabled
//! 3. Exact source path
//! 4. Otherwise a new record

pub mod recipe;
pub mod store;

pub use recipe::Recipe;
pub use store::{IdentityOptions, IdentityStore, ModelMapping};
