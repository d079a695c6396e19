//! Element change detection.
//!
//! No stored mapping means Insert, a different fingerprint means Update, an
//! equal one means Unchanged (no target writes). Mappings not confirmed by
//! the end of a model pass are Deletes.

pub mod detector;
pub mod fingerprint;

pub use detector::{classify, ChangeDetector, ChangeKind, Classified};
pub use fingerprint::Fingerprint;
