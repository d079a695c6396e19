//! Source documents stored as one JSON file each.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{SourceDocument, SourceReader};
use crate::errors::SourceError;

/// Reads `SourceDocument` JSON files. Relative paths (including attachment
/// paths) resolve against `base_dir`.
#[derive(Debug, Clone)]
pub struct JsonSourceReader {
    base_dir: PathBuf,
}

impl JsonSourceReader {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }
}

impl SourceReader for JsonSourceReader {
    fn read_document(&self, path: &str) -> Result<Arc<SourceDocument>, SourceError> {
        let full = self.resolve(path);
        let content = match std::fs::read_to_string(&full) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut doc: SourceDocument =
            serde_json::from_str(&content).map_err(|e| SourceError::Parse {
                path: path.to_string(),
                detail: e.to_string(),
            })?;

        if doc.path.is_empty() {
            doc.path = path.to_string();
        }
        // Stamp from the file system when the document carries none.
        if doc.last_save_time.is_none() || doc.file_size.is_none() {
            let meta = std::fs::metadata(&full)?;
            if doc.file_size.is_none() {
                doc.file_size = i64::try_from(meta.len()).ok();
            }
            if doc.last_save_time.is_none() {
                doc.last_save_time = meta
                    .modified()
                    .ok()
                    .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
            }
        }

        debug!(path, models = doc.models.len(), "read json source document");
        Ok(Arc::new(doc))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_relative_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("master.json"),
            r#"{
                "default_model_id": 0,
                "models": [{
                    "id": 0,
                    "name": "Default",
                    "elements": [{
                        "id": 1,
                        "element_type": "line",
                        "geometry": {"type": "line",
                                     "start": {"x": 0, "y": 0, "z": 0},
                                     "end": {"x": 1, "y": 0, "z": 0}}
                    }],
                    "attachments": [{"id": 5, "document": "ref.json"}]
                }]
            }"#,
        )
        .unwrap();

        let reader = JsonSourceReader::new(dir.path());
        assert!(reader.exists("master.json"));
        let doc = reader.read_document("master.json").unwrap();
        assert_eq!(doc.path, "master.json");
        assert!(doc.file_size.unwrap() > 0);
        assert!(doc.last_save_time.is_some());
        assert_eq!(doc.models[0].elements.len(), 1);
        assert!(doc.models[0].attachments[0].display);
        assert!(!reader.exists("ref.json"));
    }

    #[test]
    fn test_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        let reader = JsonSourceReader::new(dir.path());

        assert!(matches!(
            reader.read_document("nope.json"),
            Err(SourceError::NotFound(_))
        ));
        assert!(matches!(
            reader.read_document("bad.json"),
            Err(SourceError::Parse { .. })
        ));
    }
}
