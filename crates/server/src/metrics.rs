//! Prometheus metrics for the daemon.
//!
//! The registry holds the core engine metrics plus daemon-level gauges:
//! - Jobs by current state (refreshed after every stall monitor sweep)
//! - Stall monitor status and sweep outcomes

use once_cell::sync::Lazy;
use prometheus::{self, Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{debug, warn};

use conveyor_core::{JobEngine, JobFilter, JobState};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// Job Metrics (collected dynamically)
// =============================================================================

/// Jobs by current state.
pub static JOBS_BY_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("conveyor_jobs_by_state", "Current job count by state"),
        &["state"],
    )
    .unwrap()
});

// =============================================================================
// Monitor Metrics
// =============================================================================

/// Stall monitor running state (1 = running, 0 = stopped).
pub static MONITOR_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "conveyor_monitor_running",
        "Whether the stall monitor is running (1) or stopped (0)",
    )
    .unwrap()
});

/// Monitor sweeps by outcome.
pub static MONITOR_SWEEPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("conveyor_monitor_sweeps_total", "Stall monitor sweeps"),
        &["outcome"], // "ok", "error"
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(JOBS_BY_STATE.clone()))
        .unwrap();
    registry
        .register(Box::new(MONITOR_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(MONITOR_SWEEPS.clone()))
        .unwrap();

    // Core engine metrics
    for metric in conveyor_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

const JOB_STATES: [JobState; 4] = [
    JobState::Waiting,
    JobState::Active,
    JobState::Finished,
    JobState::Cancelled,
];

/// Count jobs in each state. States whose count could not be read are left out.
pub fn job_state_counts(engine: &JobEngine) -> Vec<(JobState, i64)> {
    JOB_STATES
        .iter()
        .filter_map(|state| match engine.count_jobs(&JobFilter::new().with_state(*state)) {
            Ok(count) => Some((*state, count)),
            Err(e) => {
                warn!(state = %state, "Failed to count jobs: {}", e);
                None
            }
        })
        .collect()
}

/// Refresh gauges from the job store and log the job-state summary.
pub fn collect_dynamic_metrics(engine: &JobEngine) {
    let counts = job_state_counts(engine);
    for (state, count) in &counts {
        JOBS_BY_STATE.with_label_values(&[state.as_str()]).set(*count);
    }

    let summary: Vec<String> = counts
        .iter()
        .map(|(state, count)| format!("{}={}", state, count))
        .collect();
    debug!(jobs = %summary.join(" "), "Job states");
}
