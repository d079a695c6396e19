//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `user_version`
//! pragma tracks which migrations have already been applied. Identity
//! mapping tables and the SQLite target graph live side by side so they
//! commit together.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "identity mapping tables",
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            token        INTEGER PRIMARY KEY AUTOINCREMENT,
            label        TEXT    NOT NULL,
            bridge_key   TEXT    NOT NULL,
            root_path    TEXT    NOT NULL,
            state        TEXT    NOT NULL,
            had_changes  INTEGER NOT NULL DEFAULT 0,
            summary      TEXT,
            started_at   TEXT    NOT NULL,
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS run_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            run_token   INTEGER NOT NULL,
            table_name  TEXT    NOT NULL,
            record_id   INTEGER NOT NULL,
            action      TEXT    NOT NULL,
            created_at  TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_run_log_run_token ON run_log (run_token);

        CREATE TABLE IF NOT EXISTS documents (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            source_path     TEXT NOT NULL UNIQUE,
            source_guid     TEXT,
            normalized_name TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_guid
            ON documents (source_guid) WHERE source_guid IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_documents_normalized_name ON documents (normalized_name);

        CREATE TABLE IF NOT EXISTS jobs (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            bridge_key          TEXT    NOT NULL,
            root_document_id    INTEGER NOT NULL REFERENCES documents (id),
            subject_id          INTEGER NOT NULL,
            definition_model_id INTEGER NOT NULL,
            created_at          TEXT    NOT NULL,
            UNIQUE (bridge_key, root_document_id)
        );

        CREATE TABLE IF NOT EXISTS job_documents (
            job_id         INTEGER NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            document_id    INTEGER NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
            last_save_time TEXT,
            file_size      INTEGER,
            last_seen_run  INTEGER NOT NULL,
            PRIMARY KEY (job_id, document_id)
        );

        CREATE TABLE IF NOT EXISTS models (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id       INTEGER NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
            source_model_id   INTEGER NOT NULL,
            source_model_name TEXT    NOT NULL,
            target_model_id   INTEGER NOT NULL,
            is_root           INTEGER NOT NULL DEFAULT 0,
            dimensionality    TEXT    NOT NULL,
            kind              TEXT    NOT NULL,
            job_id            INTEGER REFERENCES jobs (id) ON DELETE SET NULL,
            transform         TEXT,
            last_touched_run  INTEGER NOT NULL DEFAULT 0,
            UNIQUE (document_id, source_model_id)
        );

        CREATE INDEX IF NOT EXISTS idx_models_target_model_id ON models (target_model_id);

        CREATE TABLE IF NOT EXISTS elements (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            model_id          INTEGER NOT NULL REFERENCES models (id) ON DELETE CASCADE,
            source_element_id INTEGER NOT NULL,
            target_element_id INTEGER NOT NULL,
            fingerprint       TEXT    NOT NULL,
            last_touched_run  INTEGER NOT NULL,
            UNIQUE (model_id, source_element_id)
        );

        CREATE INDEX IF NOT EXISTS idx_elements_touched ON elements (model_id, last_touched_run);

        CREATE TABLE IF NOT EXISTS discards (
            model_id          INTEGER NOT NULL REFERENCES models (id) ON DELETE CASCADE,
            source_element_id INTEGER NOT NULL,
            fingerprint       TEXT    NOT NULL,
            reason            TEXT    NOT NULL,
            run_token         INTEGER NOT NULL,
            PRIMARY KEY (model_id, source_element_id)
        );

        CREATE TABLE IF NOT EXISTS schema_versions (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            schema_name   TEXT    NOT NULL,
            document_id   INTEGER NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
            version_major INTEGER NOT NULL,
            version_minor INTEGER NOT NULL,
            checksum      TEXT    NOT NULL,
            imported      INTEGER NOT NULL DEFAULT 0,
            UNIQUE (schema_name, document_id)
        );

        CREATE TABLE IF NOT EXISTS geom_parts (
            id                   INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id          INTEGER NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
            source_definition_id INTEGER NOT NULL,
            target_geom_part_id  INTEGER NOT NULL,
            fingerprint          TEXT    NOT NULL,
            UNIQUE (document_id, source_definition_id)
        );

        CREATE INDEX IF NOT EXISTS idx_geom_parts_fingerprint ON geom_parts (fingerprint);

        CREATE TABLE IF NOT EXISTS level_map (
            job_id          INTEGER NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            document_id     INTEGER NOT NULL REFERENCES documents (id) ON DELETE CASCADE,
            source_level_id INTEGER NOT NULL,
            category_id     INTEGER NOT NULL,
            PRIMARY KEY (job_id, document_id, source_level_id)
        );

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "sqlite target graph",
        r#"
        CREATE TABLE IF NOT EXISTS target_subjects (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS target_models (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id     INTEGER REFERENCES target_subjects (id) ON DELETE SET NULL,
            name           TEXT NOT NULL,
            kind           TEXT NOT NULL,
            dimensionality TEXT NOT NULL,
            created_at     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS target_definitions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            model_id    INTEGER NOT NULL REFERENCES target_models (id) ON DELETE CASCADE,
            kind        TEXT NOT NULL,
            name        TEXT NOT NULL,
            appearance  TEXT,
            UNIQUE (model_id, kind, name)
        );

        CREATE TABLE IF NOT EXISTS target_geom_parts (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL,
            geometry    TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS target_elements (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            model_id      INTEGER NOT NULL REFERENCES target_models (id) ON DELETE CASCADE,
            class_name    TEXT NOT NULL,
            category_id   INTEGER,
            line_style_id INTEGER,
            code          TEXT,
            placement     TEXT NOT NULL,
            geom_part_id  INTEGER,
            geometry      TEXT NOT NULL,
            properties    TEXT,
            updated_at    TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_target_elements_code
            ON target_elements (model_id, code) WHERE code IS NOT NULL;

        CREATE TABLE IF NOT EXISTS target_schemas (
            name          TEXT PRIMARY KEY,
            version_major INTEGER NOT NULL,
            version_minor INTEGER NOT NULL,
            body          TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS target_fonts (
            name        TEXT PRIMARY KEY,
            embedded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS target_properties (
            name        TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
];

/// Tables the identity store cannot run without.
pub const IDENTITY_TABLES: &[&str] = &[
    "runs",
    "run_log",
    "documents",
    "jobs",
    "job_documents",
    "models",
    "elements",
    "discards",
    "schema_versions",
    "geom_parts",
    "level_map",
    "kv_state",
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in IDENTITY_TABLES {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
        assert!(tables.contains(&"target_elements".to_string()));
        assert!(tables.contains(&"target_schemas".to_string()));
    }
}
