//! SQLite-backed target graph sharing the identity store's database.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use super::{DefinitionKind, Placement, TargetDefinition, TargetElement, TargetWriter};
use crate::db::Database;
use crate::errors::TargetError;
use crate::geo::{Gcs, Range3d};
use crate::models::{Dimensionality, ModelKind, TargetId};
use crate::schema::TargetSchema;
use crate::source::Geometry;

const PROP_GCS: &str = "gcs";
const PROP_EXTENTS: &str = "project_extents";
const PROP_THUMBNAILS: &str = "thumbnail_requests";

/// A [`TargetWriter`] over the `target_*` tables.
pub struct SqliteTarget {
    db: Arc<Database>,
    writes: AtomicU64,
}

impl SqliteTarget {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            writes: AtomicU64::new(0),
        }
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn get_property<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, TargetError> {
        let conn = self.db.conn();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM target_properties WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn set_property<T: serde::Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), TargetError> {
        let json = serde_json::to_string(value)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO target_properties (name, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![name, json, Utc::now().to_rfc3339()],
        )?;
        self.wrote();
        Ok(())
    }

    // -- read helpers for status output and tests --

    /// Number of elements in `model_id`.
    pub fn count_elements(&self, model_id: TargetId) -> Result<i64, TargetError> {
        let conn = self.db.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM target_elements WHERE model_id = ?1",
            params![model_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Ids of the elements in `model_id`, ascending.
    pub fn list_element_ids(&self, model_id: TargetId) -> Result<Vec<TargetId>, TargetError> {
        let conn = self.db.conn();
        let mut stmt =
            conn.prepare("SELECT id FROM target_elements WHERE model_id = ?1 ORDER BY id")?;
        let ids = stmt
            .query_map(params![model_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// `(id, name)` of every model, ascending by id.
    pub fn list_models(&self) -> Result<Vec<(TargetId, String)>, TargetError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT id, name FROM target_models ORDER BY id")?;
        let models = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(models)
    }

    pub fn list_geom_parts(&self) -> Result<Vec<TargetId>, TargetError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT id FROM target_geom_parts ORDER BY id")?;
        let parts = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts)
    }

    /// Every definition of `kind` across all definition models.
    pub fn list_definitions(
        &self,
        kind: DefinitionKind,
    ) -> Result<Vec<TargetDefinition>, TargetError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, model_id, kind, name, appearance FROM target_definitions
             WHERE kind = ?1 ORDER BY id",
        )?;
        let defs = stmt
            .query_map(params![kind.as_str()], definition_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(defs)
    }

    pub fn list_fonts(&self) -> Result<Vec<String>, TargetError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT name FROM target_fonts ORDER BY name")?;
        let fonts = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(fonts)
    }

    /// Model ids from every thumbnail request so far.
    pub fn thumbnail_requests(&self) -> Result<Vec<TargetId>, TargetError> {
        Ok(self
            .get_property::<Vec<TargetId>>(PROP_THUMBNAILS)?
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for SqliteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTarget")
            .field("writes", &self.writes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn definition_from_row(row: &Row<'_>) -> rusqlite::Result<TargetDefinition> {
    let kind: String = row.get(2)?;
    let kind = match kind.as_str() {
        "line_style" => DefinitionKind::LineStyle,
        _ => DefinitionKind::Category,
    };
    let appearance: Option<String> = row.get(4)?;
    let appearance = appearance
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(TargetDefinition {
        id: row.get(0)?,
        model_id: row.get(1)?,
        kind,
        name: row.get(3)?,
        appearance,
    })
}

/// Unique-index violations become [`TargetError::Constraint`].
fn constraint_or(err: rusqlite::Error) -> TargetError {
    if let rusqlite::Error::SqliteFailure(ref code, ref message) = err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return TargetError::Constraint(message.clone().unwrap_or_else(|| err.to_string()));
        }
    }
    TargetError::from(err)
}

impl TargetWriter for SqliteTarget {
    // -----------------------------------------------------------------------
    // Subjects and models
    // -----------------------------------------------------------------------

    fn insert_subject(&self, name: &str) -> Result<TargetId, TargetError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO target_subjects (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().to_rfc3339()],
        )
        .map_err(constraint_or)?;
        let id = conn.last_insert_rowid();
        self.wrote();
        info!(id, name, "created job subject");
        Ok(id)
    }

    fn insert_model(
        &self,
        subject_id: Option<TargetId>,
        name: &str,
        kind: ModelKind,
        dimensionality: Dimensionality,
    ) -> Result<TargetId, TargetError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO target_models (subject_id, name, kind, dimensionality, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                subject_id,
                name,
                kind.to_string(),
                dimensionality.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.wrote();
        debug!(id, name, %kind, %dimensionality, "inserted target model");
        Ok(id)
    }

    fn rename_model(&self, model_id: TargetId, name: &str) -> Result<(), TargetError> {
        let conn = self.db.conn();
        let n = conn.execute(
            "UPDATE target_models SET name = ?1 WHERE id = ?2",
            params![name, model_id],
        )?;
        if n == 0 {
            return Err(TargetError::NotFound {
                entity: "model".into(),
                id: model_id,
            });
        }
        self.wrote();
        Ok(())
    }

    fn model_name(&self, model_id: TargetId) -> Result<Option<String>, TargetError> {
        let conn = self.db.conn();
        let name = conn
            .query_row(
                "SELECT name FROM target_models WHERE id = ?1",
                params![model_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    fn delete_model(&self, model_id: TargetId) -> Result<(), TargetError> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM target_models WHERE id = ?1", params![model_id])?;
        self.wrote();
        debug!(model_id, "deleted target model");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Elements
    // -----------------------------------------------------------------------

    fn insert_element(
        &self,
        model_id: TargetId,
        element: &TargetElement,
    ) -> Result<TargetId, TargetError> {
        let placement = serde_json::to_string(&element.placement)?;
        let geometry = serde_json::to_string(&element.geometry)?;
        let properties = element
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO target_elements
                (model_id, class_name, category_id, line_style_id, code, placement,
                 geom_part_id, geometry, properties, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                model_id,
                element.class_name,
                element.category_id,
                element.line_style_id,
                element.code,
                placement,
                element.geom_part_id,
                geometry,
                properties,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(constraint_or)?;
        let id = conn.last_insert_rowid();
        self.wrote();
        Ok(id)
    }

    fn update_element(
        &self,
        element_id: TargetId,
        element: &TargetElement,
    ) -> Result<(), TargetError> {
        let placement = serde_json::to_string(&element.placement)?;
        let geometry = serde_json::to_string(&element.geometry)?;
        let properties = element
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.db.conn();
        let n = conn
            .execute(
                "UPDATE target_elements SET
                    class_name = ?1, category_id = ?2, line_style_id = ?3, code = ?4,
                    placement = ?5, geom_part_id = ?6, geometry = ?7, properties = ?8,
                    updated_at = ?9
                 WHERE id = ?10",
                params![
                    element.class_name,
                    element.category_id,
                    element.line_style_id,
                    element.code,
                    placement,
                    element.geom_part_id,
                    geometry,
                    properties,
                    Utc::now().to_rfc3339(),
                    element_id
                ],
            )
            .map_err(constraint_or)?;
        if n == 0 {
            return Err(TargetError::NotFound {
                entity: "element".into(),
                id: element_id,
            });
        }
        self.wrote();
        Ok(())
    }

    fn delete_element(&self, element_id: TargetId) -> Result<(), TargetError> {
        let conn = self.db.conn();
        conn.execute(
            "DELETE FROM target_elements WHERE id = ?1",
            params![element_id],
        )?;
        self.wrote();
        Ok(())
    }

    fn get_element(&self, element_id: TargetId) -> Result<Option<TargetElement>, TargetError> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                "SELECT class_name, category_id, line_style_id, code, placement,
                        geom_part_id, geometry, properties
                 FROM target_elements WHERE id = ?1",
                params![element_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<TargetId>>(1)?,
                        row.get::<_, Option<TargetId>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<TargetId>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;
        drop(conn);
        let Some((class_name, category_id, line_style_id, code, placement, geom_part_id, geometry, properties)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(TargetElement {
            class_name,
            category_id,
            line_style_id,
            code,
            placement: serde_json::from_str::<Placement>(&placement)?,
            geom_part_id,
            geometry: serde_json::from_str::<Geometry>(&geometry)?,
            properties: properties
                .map(|json| serde_json::from_str(&json))
                .transpose()?,
        }))
    }

    fn find_element_by_code(
        &self,
        model_id: TargetId,
        code: &str,
    ) -> Result<Option<TargetId>, TargetError> {
        let conn = self.db.conn();
        let id = conn
            .query_row(
                "SELECT id FROM target_elements WHERE model_id = ?1 AND code = ?2",
                params![model_id, code],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    fn find_definition(
        &self,
        model_id: TargetId,
        kind: DefinitionKind,
        name: &str,
    ) -> Result<Option<TargetDefinition>, TargetError> {
        let conn = self.db.conn();
        let def = conn
            .query_row(
                "SELECT id, model_id, kind, name, appearance FROM target_definitions
                 WHERE model_id = ?1 AND kind = ?2 AND name = ?3",
                params![model_id, kind.as_str(), name],
                definition_from_row,
            )
            .optional()?;
        Ok(def)
    }

    fn insert_definition(
        &self,
        model_id: TargetId,
        kind: DefinitionKind,
        name: &str,
        appearance: Option<&serde_json::Value>,
    ) -> Result<TargetId, TargetError> {
        let appearance = appearance.map(serde_json::to_string).transpose()?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO target_definitions (model_id, kind, name, appearance)
             VALUES (?1, ?2, ?3, ?4)",
            params![model_id, kind.as_str(), name, appearance],
        )
        .map_err(constraint_or)?;
        let id = conn.last_insert_rowid();
        self.wrote();
        debug!(id, model_id, %kind, name, "inserted definition");
        Ok(id)
    }

    fn insert_geom_part(&self, name: &str, geometry: &[Geometry]) -> Result<TargetId, TargetError> {
        let json = serde_json::to_string(geometry)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO target_geom_parts (name, geometry, created_at) VALUES (?1, ?2, ?3)",
            params![name, json, Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        self.wrote();
        debug!(id, name, "inserted geometry part");
        Ok(id)
    }

    fn delete_geom_part(&self, part_id: TargetId) -> Result<bool, TargetError> {
        let conn = self.db.conn();
        let deleted = conn.execute(
            "DELETE FROM target_geom_parts WHERE id = ?1
             AND NOT EXISTS (SELECT 1 FROM target_elements WHERE geom_part_id = ?1)",
            params![part_id],
        )?;
        if deleted == 0 {
            return Ok(false);
        }
        self.wrote();
        debug!(id = part_id, "deleted geometry part");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Schemas
    // -----------------------------------------------------------------------

    fn find_schema(&self, name: &str) -> Result<Option<TargetSchema>, TargetError> {
        let conn = self.db.conn();
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM target_schemas WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        match body {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn import_schema(&self, schema: &TargetSchema) -> Result<(), TargetError> {
        let body = serde_json::to_string(schema)?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO target_schemas (name, version_major, version_minor, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (name) DO UPDATE SET
                version_major = excluded.version_major,
                version_minor = excluded.version_minor,
                body = excluded.body,
                updated_at = excluded.updated_at",
            params![
                schema.name,
                schema.version_major,
                schema.version_minor,
                body,
                Utc::now().to_rfc3339()
            ],
        )?;
        self.wrote();
        info!(
            schema = %schema.name,
            version = %format!("{}.{}", schema.version_major, schema.version_minor),
            classes = schema.classes.len(),
            "imported schema"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Repository properties
    // -----------------------------------------------------------------------

    fn gcs(&self) -> Result<Option<Gcs>, TargetError> {
        self.get_property(PROP_GCS)
    }

    fn set_gcs(&self, gcs: &Gcs) -> Result<(), TargetError> {
        self.set_property(PROP_GCS, gcs)?;
        info!(gcs = %gcs.name, "set repository coordinate system");
        Ok(())
    }

    fn project_extents(&self) -> Result<Option<Range3d>, TargetError> {
        self.get_property(PROP_EXTENTS)
    }

    fn set_project_extents(&self, extents: &Range3d) -> Result<(), TargetError> {
        self.set_property(PROP_EXTENTS, extents)
    }

    fn has_font(&self, name: &str) -> Result<bool, TargetError> {
        let conn = self.db.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM target_fonts WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn embed_font(&self, name: &str) -> Result<(), TargetError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO target_fonts (name, embedded_at) VALUES (?1, ?2)",
            params![name, Utc::now().to_rfc3339()],
        )?;
        self.wrote();
        debug!(font = name, "embedded font");
        Ok(())
    }

    fn request_thumbnails(&self, model_ids: &[TargetId]) -> Result<(), TargetError> {
        let mut requested = self.thumbnail_requests()?;
        requested.extend_from_slice(model_ids);
        self.set_property(PROP_THUMBNAILS, &requested)?;
        info!(models = model_ids.len(), "requested thumbnails");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    fn save_changes(&self) -> Result<(), TargetError> {
        self.db.save_changes().map_err(TargetError::from)
    }

    fn abandon_changes(&self) -> Result<(), TargetError> {
        self.db.abandon_changes().map_err(TargetError::from)
    }

    fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}
