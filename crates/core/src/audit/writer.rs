use std::sync::Arc;

use tokio::sync::mpsc;

use super::{AuditEventEnvelope, AuditHandle, AuditRecord, AuditStore};

/// Background task that drains the audit channel into storage
pub struct AuditWriter {
    rx: mpsc::Receiver<AuditEventEnvelope>,
    store: Arc<dyn AuditStore>,
}

impl AuditWriter {
    pub fn new(rx: mpsc::Receiver<AuditEventEnvelope>, store: Arc<dyn AuditStore>) -> Self {
        Self { rx, store }
    }

    /// Run until every `AuditHandle` has been dropped.
    ///
    /// Insert failures are logged and skipped; the writer keeps going.
    pub async fn run(mut self) {
        tracing::info!("Audit writer started");

        let mut written: u64 = 0;
        while let Some(envelope) = self.rx.recv().await {
            let record = AuditRecord::from_envelope(envelope);

            match self.store.insert(&record) {
                Ok(_) => written += 1,
                Err(e) => tracing::error!(
                    event_type = %record.event_type,
                    job_id = ?record.job_id,
                    "Failed to write audit event: {}",
                    e
                ),
            }
        }

        tracing::info!(written, "Audit writer shutting down");
    }
}

impl AuditRecord {
    /// Build an unsaved record (id 0) from an emitted event.
    pub fn from_envelope(envelope: AuditEventEnvelope) -> Self {
        Self {
            id: 0,
            timestamp: envelope.timestamp,
            event_type: envelope.event.event_type().to_string(),
            job_id: envelope.event.job_id().map(String::from),
            user_id: envelope.event.user_id().map(String::from),
            data: envelope.event,
        }
    }
}

/// Create a connected handle/writer pair.
///
/// Spawn the writer with `tokio::spawn(writer.run())` and clone the handle
/// into every component that emits events. `buffer_size` bounds the number of
/// events in flight; `try_emit` drops events once it is reached.
pub fn create_audit_system(
    store: Arc<dyn AuditStore>,
    buffer_size: usize,
) -> (AuditHandle, AuditWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let handle = AuditHandle::new(tx);
    let writer = AuditWriter::new(rx, store);
    (handle, writer)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::audit::{AuditError, AuditEvent, AuditFilter, SqliteAuditStore};

    /// Store that fails every insert
    struct FailingStore {
        attempts: Mutex<usize>,
    }

    impl AuditStore for FailingStore {
        fn insert(&self, _record: &AuditRecord) -> Result<i64, AuditError> {
            *self.attempts.lock().unwrap() += 1;
            Err(AuditError::Database("disk full".to_string()))
        }

        fn query(&self, _filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
            Ok(Vec::new())
        }
    }

    fn job_state_changed(job_id: &str, from: &str, to: &str) -> AuditEvent {
        AuditEvent::JobStateChanged {
            job_id: job_id.to_string(),
            from_state: from.to_string(),
            to_state: to.to_string(),
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_writer_persists_events_in_order() {
        let store = Arc::new(SqliteAuditStore::in_memory().unwrap());
        let (handle, writer) = create_audit_system(store.clone(), 16);
        let writer_task = tokio::spawn(writer.run());

        handle
            .emit(AuditEvent::ServiceStarted {
                version: "0.1.0".to_string(),
                config_hash: "abc123".to_string(),
            })
            .await;
        handle.emit(job_state_changed("job-1", "waiting", "active")).await;
        handle.emit(job_state_changed("job-1", "active", "finished")).await;
        drop(handle);
        writer_task.await.unwrap();

        let records = store.query(&AuditFilter::new().with_job_id("job-1")).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(
            &records[1].data,
            AuditEvent::JobStateChanged { to_state, .. } if to_state == "finished"
        ));
        assert_eq!(store.query(&AuditFilter::new()).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_writer_extracts_job_and_user_ids() {
        let store = Arc::new(SqliteAuditStore::in_memory().unwrap());
        let (handle, writer) = create_audit_system(store.clone(), 16);
        let writer_task = tokio::spawn(writer.run());

        handle
            .emit(AuditEvent::JobCreated {
                job_id: "job-123".to_string(),
                tenant_id: "tenant".to_string(),
                entity_id: "entity".to_string(),
                name: "ingest".to_string(),
                pipelines: vec![],
                processors: 0,
                priority: 100,
                created_by: "user-456".to_string(),
            })
            .await;
        drop(handle);
        writer_task.await.unwrap();

        let records = store.query(&AuditFilter::new()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].job_id.as_deref(), Some("job-123"));
        assert_eq!(records[0].user_id.as_deref(), Some("user-456"));
    }

    #[tokio::test]
    async fn test_writer_continues_on_insert_failure() {
        let store = Arc::new(FailingStore {
            attempts: Mutex::new(0),
        });
        let (handle, writer) = create_audit_system(store.clone(), 16);
        let writer_task = tokio::spawn(writer.run());

        handle.emit(job_state_changed("job-1", "waiting", "active")).await;
        handle.emit(job_state_changed("job-1", "active", "cancelled")).await;
        drop(handle);

        writer_task.await.unwrap();
        assert_eq!(*store.attempts.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_writer_waits_for_all_handles_to_drop() {
        let store = Arc::new(SqliteAuditStore::in_memory().unwrap());
        let (main_handle, writer) = create_audit_system(store.clone(), 16);
        let engine_handle = main_handle.clone();
        let writer_task = tokio::spawn(writer.run());

        main_handle
            .emit(AuditEvent::ServiceStopped {
                reason: "graceful_shutdown".to_string(),
            })
            .await;
        drop(main_handle);

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(
            !writer_task.is_finished(),
            "Writer should still be running while the engine holds a handle"
        );

        engine_handle.try_emit(job_state_changed("job-9", "active", "finished"));
        drop(engine_handle);

        let result = tokio::time::timeout(tokio::time::Duration::from_secs(1), writer_task).await;
        assert!(result.is_ok(), "Writer should exit after all handles dropped");
        assert_eq!(store.query(&AuditFilter::new()).unwrap().len(), 2);
    }
}
