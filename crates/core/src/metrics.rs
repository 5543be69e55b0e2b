//! Prometheus metrics for the job engine.
//!
//! This module provides metrics for:
//! - Job lifecycle (creation, state transitions, cancellations)
//! - Task reporting (transitions, ignored reports, retries, durations)
//! - Dispatch and contention (batch sizes, optimistic-concurrency retries)

use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Job Metrics
// =============================================================================

/// Jobs created total by job type.
pub static JOBS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("conveyor_jobs_created_total", "Total jobs created"),
        &["job_type"], // "import", "export", "batch"
    )
    .unwrap()
});

/// Job state transitions total.
pub static JOB_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "conveyor_job_transitions_total",
            "Total job state transitions",
        ),
        &["from", "to"],
    )
    .unwrap()
});

// =============================================================================
// Task Metrics
// =============================================================================

/// Task state transitions total by target state.
pub static TASK_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "conveyor_task_transitions_total",
            "Total task state transitions applied",
        ),
        &["state"],
    )
    .unwrap()
});

/// Reports absorbed without effect.
pub static IGNORED_REPORTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "conveyor_ignored_reports_total",
            "Task state reports that changed nothing",
        ),
        &["reason"], // "already_terminal", "already_in_state"
    )
    .unwrap()
});

/// Tasks retried after failure.
pub static TASK_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("conveyor_task_retries_total", "Total task retries").unwrap()
});

/// Time from a task starting to reaching a terminal state.
pub static TASK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "conveyor_task_duration_seconds",
            "Duration of task execution",
        )
        .buckets(vec![
            0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0, 14400.0,
        ]),
        &["state"], // "success", "failure"
    )
    .unwrap()
});

/// Tasks added to started jobs.
pub static TASKS_EXPANDED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "conveyor_tasks_expanded_total",
        "Tasks added to jobs after they started",
    )
    .unwrap()
});

/// Task errors reported by workers.
pub static TASK_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("conveyor_task_errors_total", "Task errors reported by workers"),
        &["fatal"], // "true", "false"
    )
    .unwrap()
});

/// Tasks failed by the stall monitor.
pub static STALLED_TASKS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "conveyor_stalled_tasks_total",
        "Tasks failed because their worker stopped reporting",
    )
    .unwrap()
});

// =============================================================================
// Dispatch and contention
// =============================================================================

/// Tasks handed out per dispatch call.
pub static DISPATCH_BATCH_SIZE: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "conveyor_dispatch_batch_size",
            "Number of tasks claimed per queue request",
        )
        .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
    )
    .unwrap()
});

/// Operations re-run after losing a concurrent update.
pub static CONFLICT_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "conveyor_conflict_retries_total",
            "Operations retried after a concurrent update conflict",
        ),
        &["operation"],
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Jobs
        Box::new(JOBS_CREATED.clone()),
        Box::new(JOB_TRANSITIONS.clone()),
        // Tasks
        Box::new(TASK_TRANSITIONS.clone()),
        Box::new(IGNORED_REPORTS.clone()),
        Box::new(TASK_RETRIES.clone()),
        Box::new(TASK_DURATION.clone()),
        Box::new(TASKS_EXPANDED.clone()),
        Box::new(TASK_ERRORS.clone()),
        Box::new(STALLED_TASKS.clone()),
        // Dispatch
        Box::new(DISPATCH_BATCH_SIZE.clone()),
        Box::new(CONFLICT_RETRIES.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_register_once() {
        let registry = prometheus::Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }

        JOBS_CREATED.with_label_values(&["import"]).inc();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "conveyor_jobs_created_total"));
    }
}
