use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::AuditEvent;

/// An audit event stamped with the time it was emitted
#[derive(Debug, Clone)]
pub struct AuditEventEnvelope {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
}

impl AuditEventEnvelope {
    fn now(event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Cloneable sender side of the audit trail.
///
/// Emitting never fails the caller: a full or closed channel is logged and
/// the event is dropped.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditEventEnvelope>,
}

impl AuditHandle {
    pub fn new(tx: mpsc::Sender<AuditEventEnvelope>) -> Self {
        Self { tx }
    }

    /// Emit an event, waiting for channel capacity.
    pub async fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.tx.send(AuditEventEnvelope::now(event)).await {
            tracing::error!(
                event_type = e.0.event.event_type(),
                "Failed to emit audit event: channel closed"
            );
        }
    }

    /// Emit an event from synchronous code outside the runtime.
    pub fn emit_blocking(&self, event: AuditEvent) {
        if let Err(e) = self.tx.blocking_send(AuditEventEnvelope::now(event)) {
            tracing::error!(
                event_type = e.0.event.event_type(),
                "Failed to emit audit event: channel closed"
            );
        }
    }

    /// Emit an event without waiting.
    ///
    /// Used on the engine's synchronous paths. Returns false when the event
    /// was dropped.
    pub fn try_emit(&self, event: AuditEvent) -> bool {
        match self.tx.try_send(AuditEventEnvelope::now(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                tracing::warn!(
                    event_type = envelope.event.event_type(),
                    "Audit channel full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                tracing::error!(
                    event_type = envelope.event.event_type(),
                    "Failed to emit audit event: channel closed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancelled(job_id: &str) -> AuditEvent {
        AuditEvent::JobCancelled {
            job_id: job_id.to_string(),
            previous_state: "active".to_string(),
            skipped_tasks: 2,
        }
    }

    #[tokio::test]
    async fn test_emit_event() {
        let (tx, mut rx) = mpsc::channel(10);
        let handle = AuditHandle::new(tx);

        handle.emit(cancelled("job-1")).await;

        let envelope = rx.recv().await.expect("Should receive event");
        assert_eq!(envelope.event.job_id(), Some("job-1"));
    }

    #[test]
    fn test_try_emit_stamps_time() {
        let (tx, mut rx) = mpsc::channel(10);
        let handle = AuditHandle::new(tx);

        let before = Utc::now();
        assert!(handle.try_emit(cancelled("job-1")));
        let after = Utc::now();

        let envelope = rx.try_recv().expect("Should receive event");
        assert!(envelope.timestamp >= before && envelope.timestamp <= after);
    }

    #[test]
    fn test_try_emit_full_channel_drops() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = AuditHandle::new(tx);

        assert!(handle.try_emit(cancelled("job-1")));
        assert!(!handle.try_emit(cancelled("job-2")));

        assert_eq!(rx.try_recv().unwrap().event.job_id(), Some("job-1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_does_not_panic() {
        let (tx, rx) = mpsc::channel::<AuditEventEnvelope>(10);
        let handle = AuditHandle::new(tx);
        drop(rx);

        handle.emit(cancelled("job-1")).await;
        assert!(!handle.try_emit(cancelled("job-1")));
    }
}
