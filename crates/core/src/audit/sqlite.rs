use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use super::{AuditError, AuditEvent, AuditFilter, AuditRecord, AuditStore};
use crate::sqlite::{self, json_column, parse_timestamp};

/// Audit trail kept in an `audit_events` table.
///
/// Events are stored as their tagged JSON form next to the columns used for
/// lookups (event type, job ID, acting user).
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    pub fn new(path: &Path) -> Result<Self, AuditError> {
        Self::with_connection(sqlite::open_file(path, sqlite::DEFAULT_BUSY_TIMEOUT)?)
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        Self::with_connection(sqlite::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, AuditError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                event_type TEXT NOT NULL,
                job_id TEXT,
                user_id TEXT,
                event TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_events_job ON audit_events(job_id, seq);
            CREATE INDEX IF NOT EXISTS idx_audit_events_type ON audit_events(event_type, seq);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<AuditRecord> {
        let recorded_at: String = row.get(1)?;
        let event: String = row.get(5)?;
        let data: AuditEvent = json_column(5, &event)?;

        Ok(AuditRecord {
            id: row.get(0)?,
            timestamp: parse_timestamp(&recorded_at),
            event_type: row.get(2)?,
            job_id: row.get(3)?,
            user_id: row.get(4)?,
            data,
        })
    }
}

impl AuditStore for SqliteAuditStore {
    fn insert(&self, record: &AuditRecord) -> Result<i64, AuditError> {
        let event = serde_json::to_string(&record.data)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO audit_events (recorded_at, event_type, job_id, user_id, event) \
             VALUES (?, ?, ?, ?, ?)",
            params![
                record.timestamp.to_rfc3339(),
                record.event_type,
                record.job_id,
                record.user_id,
                event,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        // NULL matches everything, so one statement serves every filter.
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, recorded_at, event_type, job_id, user_id, event FROM audit_events \
             WHERE (?1 IS NULL OR job_id = ?1) AND (?2 IS NULL OR event_type = ?2) \
             ORDER BY seq LIMIT ?3",
        )?;

        let rows = stmt.query_map(
            params![filter.job_id, filter.event_type, filter.limit],
            Self::row_to_record,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn record(event: AuditEvent) -> AuditRecord {
        AuditRecord {
            id: 0,
            timestamp: Utc::now(),
            event_type: event.event_type().to_string(),
            job_id: event.job_id().map(String::from),
            user_id: event.user_id().map(String::from),
            data: event,
        }
    }

    fn job_created(job_id: &str, user_id: &str) -> AuditRecord {
        record(AuditEvent::JobCreated {
            job_id: job_id.to_string(),
            tenant_id: "tenant".to_string(),
            entity_id: "entity".to_string(),
            name: "ingest".to_string(),
            pipelines: vec!["standard".to_string()],
            processors: 1,
            priority: 100,
            created_by: user_id.to_string(),
        })
    }

    fn task_changed(job_id: &str, task_id: &str) -> AuditRecord {
        record(AuditEvent::TaskStateChanged {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
            from_state: "running".to_string(),
            to_state: "success".to_string(),
            exit_status: Some(0),
        })
    }

    #[test]
    fn test_insert_and_read_back() {
        let store = SqliteAuditStore::in_memory().unwrap();

        let seq = store.insert(&job_created("job-1", "user-1")).unwrap();
        assert!(seq > 0);

        let records = store.query(&AuditFilter::new()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, seq);
        assert_eq!(records[0].event_type, "job_created");
        assert_eq!(records[0].user_id.as_deref(), Some("user-1"));
        assert!(matches!(records[0].data, AuditEvent::JobCreated { .. }));
    }

    #[test]
    fn test_query_by_job_and_type() {
        let store = SqliteAuditStore::in_memory().unwrap();

        store.insert(&job_created("job-1", "user-1")).unwrap();
        store.insert(&task_changed("job-1", "task-1")).unwrap();
        store.insert(&task_changed("job-2", "task-2")).unwrap();

        let job_one = store.query(&AuditFilter::new().with_job_id("job-1")).unwrap();
        assert_eq!(job_one.len(), 2);

        let changes = store
            .query(
                &AuditFilter::new()
                    .with_job_id("job-1")
                    .with_event_type("task_state_changed"),
            )
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            &changes[0].data,
            AuditEvent::TaskStateChanged { task_id, .. } if task_id == "task-1"
        ));
    }

    #[test]
    fn test_records_come_back_in_write_order() {
        let store = SqliteAuditStore::in_memory().unwrap();

        for i in 0..5 {
            store
                .insert(&task_changed("job-1", &format!("task-{}", i)))
                .unwrap();
        }

        let first_two = store.query(&AuditFilter::new().with_limit(2)).unwrap();
        let task_ids: Vec<_> = first_two
            .iter()
            .filter_map(|r| match &r.data {
                AuditEvent::TaskStateChanged { task_id, .. } => Some(task_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(task_ids, vec!["task-0", "task-1"]);
    }

    #[test]
    fn test_file_based_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("audit.db");

        let store = SqliteAuditStore::new(&db_path).unwrap();
        store.insert(&job_created("job-1", "user-1")).unwrap();
        drop(store);

        let reopened = SqliteAuditStore::new(&db_path).unwrap();
        assert_eq!(reopened.query(&AuditFilter::new()).unwrap().len(), 1);
    }
}
