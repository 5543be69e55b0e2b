//! SQLite-backed pipeline store implementation.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    CreatePipelineRequest, Pipeline, PipelineError, PipelineFilter, PipelineStore, ProcessorRef,
};
use crate::sqlite::{self, enum_column, json_column, parse_timestamp};

const SELECT_COLUMNS: &str = "SELECT id, tenant_id, name, pipeline_type, is_standard, description, processors, created_at, updated_at FROM pipelines";

/// SQLite-backed pipeline store.
pub struct SqlitePipelineStore {
    conn: Mutex<Connection>,
}

impl SqlitePipelineStore {
    /// Create a new SQLite pipeline store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, PipelineError> {
        let conn = sqlite::open_file(path, sqlite::DEFAULT_BUSY_TIMEOUT)
            .map_err(|e| PipelineError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite pipeline store (useful for testing).
    pub fn in_memory() -> Result<Self, PipelineError> {
        let conn = sqlite::open_in_memory().map_err(|e| PipelineError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), PipelineError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pipelines (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                pipeline_type TEXT NOT NULL,
                is_standard INTEGER NOT NULL DEFAULT 0,
                description TEXT,
                processors TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, name)
            );

            CREATE INDEX IF NOT EXISTS idx_pipelines_tenant_type
                ON pipelines(tenant_id, pipeline_type, is_standard);
            "#,
        )
        .map_err(|e| PipelineError::Database(e.to_string()))?;

        Ok(())
    }

    fn row_to_pipeline(row: &rusqlite::Row) -> rusqlite::Result<Pipeline> {
        let pipeline_type: String = row.get(3)?;
        let processors_json: String = row.get(6)?;
        let created_at: String = row.get(7)?;
        let updated_at: String = row.get(8)?;

        Ok(Pipeline {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            name: row.get(2)?,
            pipeline_type: enum_column(3, &pipeline_type)?,
            is_standard: row.get(4)?,
            description: row.get(5)?,
            processors: json_column(6, &processors_json)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    fn fetch_by_name(
        conn: &Connection,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<Pipeline>, PipelineError> {
        conn.query_row(
            &format!("{} WHERE tenant_id = ? AND name = ?", SELECT_COLUMNS),
            params![tenant_id, name],
            Self::row_to_pipeline,
        )
        .optional()
        .map_err(|e| PipelineError::Database(e.to_string()))
    }

    fn build_where_clause(
        tenant_id: &str,
        filter: &PipelineFilter,
    ) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = vec!["tenant_id = ?"];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(tenant_id.to_string())];

        if let Some(pipeline_type) = filter.pipeline_type {
            conditions.push("pipeline_type = ?");
            params.push(Box::new(pipeline_type.as_str()));
        }

        if filter.standard_only {
            conditions.push("is_standard = 1");
        }

        (format!("WHERE {}", conditions.join(" AND ")), params)
    }
}

impl PipelineStore for SqlitePipelineStore {
    fn create(&self, request: CreatePipelineRequest) -> Result<Pipeline, PipelineError> {
        if request.name.trim().is_empty() {
            return Err(PipelineError::Invalid("name cannot be empty".to_string()));
        }

        let conn = self.conn.lock().unwrap();

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let processors_json = serde_json::to_string(&request.processors)
            .map_err(|e| PipelineError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO pipelines (id, tenant_id, name, pipeline_type, is_standard, description, processors, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                id,
                request.tenant_id,
                request.name,
                request.pipeline_type.as_str(),
                request.is_standard,
                request.description,
                processors_json,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| {
            if sqlite::is_constraint_violation(&e) {
                PipelineError::AlreadyExists(request.name.clone())
            } else {
                PipelineError::Database(e.to_string())
            }
        })?;

        Ok(Pipeline {
            id,
            tenant_id: request.tenant_id,
            name: request.name,
            pipeline_type: request.pipeline_type,
            is_standard: request.is_standard,
            description: request.description,
            processors: request.processors,
            created_at: now,
            updated_at: now,
        })
    }

    fn get(&self, tenant_id: &str, name: &str) -> Result<Option<Pipeline>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        Self::fetch_by_name(&conn, tenant_id, name)
    }

    fn get_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Pipeline>, PipelineError> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            &format!("{} WHERE tenant_id = ? AND id = ?", SELECT_COLUMNS),
            params![tenant_id, id],
            Self::row_to_pipeline,
        )
        .optional()
        .map_err(|e| PipelineError::Database(e.to_string()))
    }

    fn exists(&self, tenant_id: &str, name: &str) -> Result<bool, PipelineError> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pipelines WHERE tenant_id = ? AND name = ?",
                params![tenant_id, name],
                |row| row.get(0),
            )
            .map_err(|e| PipelineError::Database(e.to_string()))?;

        Ok(count > 0)
    }

    fn count(&self, tenant_id: &str) -> Result<i64, PipelineError> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            "SELECT COUNT(*) FROM pipelines WHERE tenant_id = ?",
            params![tenant_id],
            |row| row.get(0),
        )
        .map_err(|e| PipelineError::Database(e.to_string()))
    }

    fn list(
        &self,
        tenant_id: &str,
        filter: &PipelineFilter,
    ) -> Result<Vec<Pipeline>, PipelineError> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, mut all_params) = Self::build_where_clause(tenant_id, filter);
        let sql = format!(
            "{} {} ORDER BY name ASC LIMIT ? OFFSET ?",
            SELECT_COLUMNS, where_clause
        );

        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| PipelineError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_pipeline)
            .map_err(|e| PipelineError::Database(e.to_string()))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PipelineError::Database(e.to_string()))
    }

    fn update_processors(
        &self,
        tenant_id: &str,
        name: &str,
        processors: Vec<ProcessorRef>,
    ) -> Result<Pipeline, PipelineError> {
        let conn = self.conn.lock().unwrap();

        let processors_json = serde_json::to_string(&processors)
            .map_err(|e| PipelineError::Serialization(e.to_string()))?;

        let updated = conn
            .execute(
                "UPDATE pipelines SET processors = ?, updated_at = ? WHERE tenant_id = ? AND name = ?",
                params![processors_json, Utc::now().to_rfc3339(), tenant_id, name],
            )
            .map_err(|e| PipelineError::Database(e.to_string()))?;

        if updated == 0 {
            return Err(PipelineError::NotFound(name.to_string()));
        }

        Self::fetch_by_name(&conn, tenant_id, name)?
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))
    }

    fn set_standard(
        &self,
        tenant_id: &str,
        name: &str,
        is_standard: bool,
    ) -> Result<Pipeline, PipelineError> {
        let conn = self.conn.lock().unwrap();

        let updated = conn
            .execute(
                "UPDATE pipelines SET is_standard = ?, updated_at = ? WHERE tenant_id = ? AND name = ?",
                params![is_standard, Utc::now().to_rfc3339(), tenant_id, name],
            )
            .map_err(|e| PipelineError::Database(e.to_string()))?;

        if updated == 0 {
            return Err(PipelineError::NotFound(name.to_string()));
        }

        Self::fetch_by_name(&conn, tenant_id, name)?
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineType;

    const TENANT: &str = "5f0c3d2e-8a41-4c8e-9b7a-1d2e3f4a5b6c";

    fn create_test_store() -> SqlitePipelineStore {
        SqlitePipelineStore::in_memory().unwrap()
    }

    fn create_test_request(name: &str) -> CreatePipelineRequest {
        CreatePipelineRequest::new(
            TENANT,
            name,
            PipelineType::Import,
            vec![
                ProcessorRef::new("plugins.core.FileImporter"),
                ProcessorRef::new("plugins.image.Thumbnailer").with_arg("size", 256),
            ],
        )
    }

    #[test]
    fn test_create_pipeline() {
        let store = create_test_store();

        let pipeline = store.create(create_test_request("ingest")).unwrap();

        assert!(!pipeline.id.is_empty());
        assert_eq!(pipeline.name, "ingest");
        assert_eq!(pipeline.pipeline_type, PipelineType::Import);
        assert!(!pipeline.is_standard);
        assert_eq!(pipeline.processors.len(), 2);
    }

    #[test]
    fn test_get_by_name_and_id() {
        let store = create_test_store();
        let created = store.create(create_test_request("ingest")).unwrap();

        let by_name = store.get(TENANT, "ingest").unwrap().unwrap();
        assert_eq!(by_name.id, created.id);
        assert_eq!(by_name.processors, created.processors);

        let by_id = store.get_by_id(TENANT, &created.id).unwrap().unwrap();
        assert_eq!(by_id.name, "ingest");
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let store = create_test_store();
        store.create(create_test_request("Ingest")).unwrap();

        assert!(store.get(TENANT, "ingest").unwrap().is_none());
        assert!(store.exists(TENANT, "Ingest").unwrap());
        assert!(!store.exists(TENANT, "ingest").unwrap());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let store = create_test_store();
        store.create(create_test_request("ingest")).unwrap();

        let result = store.create(create_test_request("ingest"));
        assert!(matches!(result, Err(PipelineError::AlreadyExists(_))));
    }

    #[test]
    fn test_same_name_in_other_tenant_allowed() {
        let store = create_test_store();
        store.create(create_test_request("ingest")).unwrap();

        let mut other = create_test_request("ingest");
        other.tenant_id = "other-tenant".to_string();
        store.create(other).unwrap();

        assert_eq!(store.count(TENANT).unwrap(), 1);
        assert_eq!(store.count("other-tenant").unwrap(), 1);
        assert!(store.get("other-tenant", "ingest").unwrap().is_some());
    }

    #[test]
    fn test_empty_name_rejected() {
        let store = create_test_store();
        let result = store.create(create_test_request("  "));
        assert!(matches!(result, Err(PipelineError::Invalid(_))));
    }

    #[test]
    fn test_list_with_filters() {
        let store = create_test_store();
        store.create(create_test_request("b-import")).unwrap();
        store
            .create(create_test_request("a-import").standard())
            .unwrap();
        let mut export = create_test_request("c-export");
        export.pipeline_type = PipelineType::Export;
        store.create(export.standard()).unwrap();

        let all = store.list(TENANT, &PipelineFilter::new()).unwrap();
        let names: Vec<_> = all.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a-import", "b-import", "c-export"]);

        let imports = store
            .list(TENANT, &PipelineFilter::new().with_type(PipelineType::Import))
            .unwrap();
        assert_eq!(imports.len(), 2);

        let standard_imports = store
            .list(
                TENANT,
                &PipelineFilter::new()
                    .with_type(PipelineType::Import)
                    .standard_only(),
            )
            .unwrap();
        assert_eq!(standard_imports.len(), 1);
        assert_eq!(standard_imports[0].name, "a-import");

        let paged = store
            .list(TENANT, &PipelineFilter::new().with_limit(1).with_offset(1))
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].name, "b-import");
    }

    #[test]
    fn test_update_processors() {
        let store = create_test_store();
        store.create(create_test_request("ingest")).unwrap();

        let updated = store
            .update_processors(TENANT, "ingest", vec![ProcessorRef::new("plugins.core.Noop")])
            .unwrap();
        assert_eq!(updated.processors, vec![ProcessorRef::new("plugins.core.Noop")]);

        let result = store.update_processors(TENANT, "missing", vec![]);
        assert!(matches!(result, Err(PipelineError::NotFound(_))));
    }

    #[test]
    fn test_set_standard() {
        let store = create_test_store();
        store.create(create_test_request("ingest")).unwrap();

        let updated = store.set_standard(TENANT, "ingest", true).unwrap();
        assert!(updated.is_standard);

        let fetched = store.get(TENANT, "ingest").unwrap().unwrap();
        assert!(fetched.is_standard);
    }

    #[test]
    fn test_file_based_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("pipelines.db");

        let store = SqlitePipelineStore::new(&db_path).unwrap();
        store.create(create_test_request("ingest")).unwrap();

        assert!(db_path.exists());
        assert!(store.exists(TENANT, "ingest").unwrap());
    }
}
