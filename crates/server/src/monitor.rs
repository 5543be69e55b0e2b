//! Stall monitor.
//!
//! Periodically fails queued or running tasks whose worker stopped pinging,
//! so their jobs can still finish (or be retried by an operator). Each sweep
//! also refreshes the daemon's job-state gauges.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use conveyor_core::{EngineError, JobEngine, MonitorConfig, TaskState};

use crate::metrics::{collect_dynamic_metrics, MONITOR_RUNNING, MONITOR_SWEEPS};

pub struct StallMonitor {
    config: MonitorConfig,
    engine: Arc<JobEngine>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StallMonitor {
    pub fn new(config: MonitorConfig, engine: Arc<JobEngine>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            engine,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Spawn the sweep loop. Returns `None` if it is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Stall monitor already running");
            return None;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            stall_timeout_secs = self.config.stall_timeout_secs,
            "Starting stall monitor"
        );
        MONITOR_RUNNING.set(1);

        let running = Arc::clone(&self.running);
        let engine = Arc::clone(&self.engine);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Stall monitor received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)) => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        let engine = Arc::clone(&engine);
                        let sweep_config = config.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            let swept = sweep_once(&engine, &sweep_config);
                            collect_dynamic_metrics(&engine);
                            swept
                        })
                        .await;

                        match result {
                            Ok(Ok(_)) => MONITOR_SWEEPS.with_label_values(&["ok"]).inc(),
                            Ok(Err(e)) => {
                                MONITOR_SWEEPS.with_label_values(&["error"]).inc();
                                warn!("Stall sweep failed: {}", e);
                            }
                            Err(e) => {
                                MONITOR_SWEEPS.with_label_values(&["error"]).inc();
                                warn!("Stall sweep panicked: {}", e);
                            }
                        }
                    }
                }
            }
            MONITOR_RUNNING.set(0);
            info!("Stall monitor stopped");
        }))
    }

    /// Signal the loop to stop. Await the handle from [`StallMonitor::start`]
    /// to wait for an in-flight sweep.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Stall monitor not running");
            return;
        }

        info!("Stopping stall monitor");
        let _ = self.shutdown_tx.send(());
    }
}

/// Fail every queued or running task not pinged within the stall timeout.
/// Returns how many were failed by this sweep.
pub fn sweep_once(engine: &JobEngine, config: &MonitorConfig) -> Result<usize, EngineError> {
    let stalled = engine.orphaned_tasks(
        Duration::from_secs(config.stall_timeout_secs),
        config.batch_size,
    )?;
    if stalled.is_empty() {
        debug!("No stalled tasks");
        return Ok(0);
    }

    let mut failed = 0;
    for task in stalled {
        // A worker may report between the query and this call; such reports win.
        match engine.report_task_state(&task.id, TaskState::Failure) {
            Ok(report) if report.applied => {
                failed += 1;
                conveyor_core::metrics::STALLED_TASKS.inc();
                warn!(
                    task_id = %task.id,
                    job_id = %task.job_id,
                    host = ?task.host,
                    state = %task.state,
                    last_ping = %task.pinged_at,
                    "Failed stalled task"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(task_id = %task.id, "Failed to fail stalled task: {}", e),
        }
    }

    info!(failed, "Stall sweep complete");
    Ok(failed)
}
