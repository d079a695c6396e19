//! In-memory source documents, for programmatic use and tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::debug;

use super::{SourceDocument, SourceReader};
use crate::errors::SourceError;

#[derive(Default)]
pub struct MemorySourceReader {
    documents: RwLock<HashMap<String, Arc<SourceDocument>>>,
}

impl MemorySourceReader {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<SourceDocument>>> {
        self.documents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<SourceDocument>>> {
        self.documents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or replace a document, keyed by its `path`.
    pub fn put(&self, document: SourceDocument) {
        debug!(path = %document.path, "stored in-memory document");
        self.write_guard()
            .insert(document.path.clone(), Arc::new(document));
    }

    /// Edit a stored document in place, as a save would: the save time is
    /// bumped so quick-skip sees the change. Returns `false` if absent.
    pub fn update<F>(&self, path: &str, edit: F) -> bool
    where
        F: FnOnce(&mut SourceDocument),
    {
        let mut documents = self.write_guard();
        let Some(existing) = documents.get_mut(path) else {
            return false;
        };
        let doc = Arc::make_mut(existing);
        edit(doc);
        doc.last_save_time = Some(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true));
        true
    }

    pub fn remove(&self, path: &str) -> Option<Arc<SourceDocument>> {
        self.write_guard().remove(path)
    }
}

impl SourceReader for MemorySourceReader {
    fn read_document(&self, path: &str) -> Result<Arc<SourceDocument>, SourceError> {
        self.read_guard()
            .get(path)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(path.to_string()))
    }

    fn exists(&self, path: &str) -> bool {
        self.read_guard().contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_read_remove() {
        let reader = MemorySourceReader::new();
        reader.put(SourceDocument {
            path: "/a.dgn".into(),
            ..Default::default()
        });
        assert!(reader.exists("/a.dgn"));
        assert_eq!(reader.read_document("/a.dgn").unwrap().path, "/a.dgn");

        reader.remove("/a.dgn");
        assert!(matches!(
            reader.read_document("/a.dgn"),
            Err(SourceError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_bumps_save_time_without_touching_snapshots() {
        let reader = MemorySourceReader::new();
        reader.put(SourceDocument {
            path: "/a.dgn".into(),
            ..Default::default()
        });
        let before = reader.read_document("/a.dgn").unwrap();
        assert!(reader.update("/a.dgn", |d| d.fonts.push("Arial".into())));

        let after = reader.read_document("/a.dgn").unwrap();
        assert!(after.last_save_time.is_some());
        assert_eq!(after.fonts, vec!["Arial".to_string()]);
        // the earlier snapshot is unchanged
        assert!(before.fonts.is_empty());
        assert!(!reader.update("/missing.dgn", |_| {}));
    }
}
