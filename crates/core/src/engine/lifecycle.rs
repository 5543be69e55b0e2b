//! The job engine: lifecycle operations over the pipeline and job stores.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{EngineConfig, EngineError, JobSpec, TaskGrouping, TaskReport};
use crate::audit::{AuditEvent, AuditHandle};
use crate::job::{
    Job, JobError, JobFilter, JobState, JobStore, NewJob, StartOutcome, Task, TaskError,
    TaskErrorFilter, TaskErrorSpec, TaskFilter, TaskSpec, TaskState, TaskTransition,
    TransitionOutcome,
};
use crate::metrics;
use crate::pipeline::{
    CreatePipelineRequest, Pipeline, PipelineResolver, PipelineStore, PipelineType, ProcessorRef,
};

/// Result of one attempt at a report.
enum Reported {
    Applied(TransitionOutcome),
    Ignored(Task, &'static str),
}

/// Result of one attempt at a start.
enum Started {
    Now(StartOutcome),
    Unchanged(Job),
}

/// Job/task lifecycle API.
///
/// All methods are synchronous and safe to call from many threads. Each
/// state change is one atomic store operation; operations that lose a race
/// with a concurrent writer are re-read and retried up to
/// `max_conflict_retries` times.
pub struct JobEngine {
    jobs: Arc<dyn JobStore>,
    pipelines: Arc<dyn PipelineStore>,
    resolver: PipelineResolver,
    config: EngineConfig,
    audit: Option<AuditHandle>,
}

impl JobEngine {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        pipelines: Arc<dyn PipelineStore>,
        config: EngineConfig,
    ) -> Self {
        let resolver = PipelineResolver::new(Arc::clone(&pipelines));
        Self {
            jobs,
            pipelines,
            resolver,
            config,
            audit: None,
        }
    }

    /// Emit audit events for lifecycle changes.
    pub fn with_audit(mut self, audit: AuditHandle) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn emit(&self, event: AuditEvent) {
        if let Some(ref audit) = self.audit {
            audit.try_emit(event);
        }
    }

    /// Run `attempt` until it stops reporting a conflict or the retry budget
    /// is spent. Each attempt must re-read whatever it depends on.
    fn retry_on_conflict<T>(
        &self,
        operation: &'static str,
        mut attempt: impl FnMut() -> Result<T, JobError>,
    ) -> Result<T, EngineError> {
        let attempts = self.config.max_conflict_retries.saturating_add(1);
        let mut last = String::new();

        for n in 1..=attempts {
            match attempt() {
                Err(JobError::Conflict(msg)) => {
                    metrics::CONFLICT_RETRIES
                        .with_label_values(&[operation])
                        .inc();
                    debug!(operation, attempt = n, "Concurrent update conflict: {}", msg);
                    last = msg;
                    std::thread::yield_now();
                }
                other => return other.map_err(EngineError::from),
            }
        }

        warn!(operation, attempts, "Giving up after repeated conflicts: {}", last);
        Err(EngineError::Transient { attempts, last })
    }

    fn record_job_transition(&self, job: &Job, from: JobState, reason: &str) {
        if from == job.state {
            return;
        }
        metrics::JOB_TRANSITIONS
            .with_label_values(&[from.as_str(), job.state.as_str()])
            .inc();
        info!(
            job_id = %job.id,
            from = %from,
            to = %job.state,
            done = job.counts.done(),
            total = job.counts.total,
            "Job state changed"
        );
        self.emit(AuditEvent::JobStateChanged {
            job_id: job.id.clone(),
            from_state: from.to_string(),
            to_state: job.state.to_string(),
            reason: Some(reason.to_string()),
        });
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Register a pipeline definition.
    pub fn create_pipeline(&self, request: CreatePipelineRequest) -> Result<Pipeline, EngineError> {
        let pipeline = self.pipelines.create(request)?;

        info!(
            tenant_id = %pipeline.tenant_id,
            name = %pipeline.name,
            pipeline_type = %pipeline.pipeline_type,
            standard = pipeline.is_standard,
            "Pipeline created"
        );
        self.emit(AuditEvent::PipelineCreated {
            tenant_id: pipeline.tenant_id.clone(),
            pipeline_id: pipeline.id.clone(),
            name: pipeline.name.clone(),
            pipeline_type: pipeline.pipeline_type.to_string(),
            is_standard: pipeline.is_standard,
            processors: pipeline.processors.len(),
        });

        Ok(pipeline)
    }

    /// Concatenated processors of the named pipelines, in order.
    pub fn resolve_execute(
        &self,
        tenant_id: &str,
        names: &[String],
    ) -> Result<Vec<ProcessorRef>, EngineError> {
        Ok(self.resolver.resolve_execute(tenant_id, names)?)
    }

    /// Names of the tenant's standard pipelines for a type.
    pub fn default_pipeline_names(
        &self,
        tenant_id: &str,
        pipeline_type: PipelineType,
    ) -> Result<BTreeSet<String>, EngineError> {
        Ok(self
            .resolver
            .default_pipeline_names(tenant_id, pipeline_type)?)
    }

    // =========================================================================
    // Job lifecycle
    // =========================================================================

    /// Create a job in `Waiting`.
    ///
    /// Pipelines are resolved immediately; an unknown name fails the call
    /// and nothing is written.
    pub fn create(&self, spec: JobSpec) -> Result<Job, EngineError> {
        if spec.name.trim().is_empty() {
            return Err(EngineError::Validation("job name cannot be empty".to_string()));
        }
        if uuid::Uuid::parse_str(&spec.tenant_id).is_err() {
            return Err(EngineError::Validation(format!(
                "tenant id is not a UUID: {}",
                spec.tenant_id
            )));
        }
        if spec.entity_id.trim().is_empty() {
            return Err(EngineError::Validation("entity id cannot be empty".to_string()));
        }

        let resolved =
            self.resolver
                .resolve_or_default(&spec.tenant_id, spec.job_type, &spec.pipelines)?;

        if resolved.processors.is_empty() && !self.config.allow_empty_script {
            return Err(EngineError::Validation(format!(
                "pipelines {:?} resolve to no processors",
                resolved.pipelines
            )));
        }

        let job = self.jobs.create_job(NewJob {
            tenant_id: spec.tenant_id,
            entity_id: spec.entity_id,
            name: spec.name,
            job_type: spec.job_type,
            pipelines: resolved.pipelines,
            script: resolved.processors,
            priority: spec.priority.unwrap_or(self.config.default_priority),
            created_by: spec.created_by,
        })?;

        metrics::JOBS_CREATED
            .with_label_values(&[job.job_type.as_str()])
            .inc();
        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            processors = job.script.len(),
            priority = job.priority,
            "Job created"
        );
        self.emit(AuditEvent::JobCreated {
            job_id: job.id.clone(),
            tenant_id: job.tenant_id.clone(),
            entity_id: job.entity_id.clone(),
            name: job.name.clone(),
            pipelines: job.pipelines.clone(),
            processors: job.script.len(),
            priority: job.priority,
            created_by: job.created_by.clone(),
        });

        Ok(job)
    }

    fn plan_tasks(&self, job: &Job) -> Vec<TaskSpec> {
        match self.config.task_grouping {
            TaskGrouping::WholeScript => vec![TaskSpec {
                name: job.name.clone(),
                script: job.script.clone(),
                assets: Vec::new(),
            }],
            TaskGrouping::PerProcessor => job
                .script
                .iter()
                .enumerate()
                .map(|(i, processor)| TaskSpec {
                    name: format!("{} [{}] {}", job.name, i, processor.class_name),
                    script: vec![processor.clone()],
                    assets: Vec::new(),
                })
                .collect(),
        }
    }

    fn start_with(
        &self,
        job_id: &str,
        grouping: &str,
        plan: impl Fn(&Job) -> Vec<TaskSpec>,
    ) -> Result<Job, EngineError> {
        let started = self.retry_on_conflict("start", || {
            let job = self
                .jobs
                .get_job(job_id)?
                .ok_or_else(|| JobError::job_not_found(job_id))?;
            if job.state != JobState::Waiting {
                return Ok(Started::Unchanged(job));
            }

            match self.jobs.start_job(job_id, plan(&job)) {
                Ok(outcome) => Ok(Started::Now(outcome)),
                // Someone else started or cancelled it between the read and the write.
                Err(JobError::InvalidState { .. }) => self
                    .jobs
                    .get_job(job_id)?
                    .map(Started::Unchanged)
                    .ok_or_else(|| JobError::job_not_found(job_id)),
                Err(e) => Err(e),
            }
        })?;

        match started {
            Started::Unchanged(job) => {
                debug!(job_id = %job.id, state = %job.state, "Start ignored, job already past waiting");
                Ok(job)
            }
            Started::Now(outcome) => {
                info!(job_id = %outcome.job.id, tasks = outcome.tasks.len(), grouping, "Tasks created");
                self.emit(AuditEvent::TasksCreated {
                    job_id: outcome.job.id.clone(),
                    count: outcome.tasks.len(),
                    grouping: grouping.to_string(),
                });
                self.record_job_transition(&outcome.job, JobState::Waiting, "started");
                Ok(outcome.job)
            }
        }
    }

    /// Materialize the job's tasks and move it to `Active`.
    ///
    /// A job that already left `Waiting` is returned unchanged.
    pub fn start(&self, job_id: &str) -> Result<Job, EngineError> {
        self.start_with(job_id, self.config.task_grouping.as_str(), |job| {
            self.plan_tasks(job)
        })
    }

    /// Start a job with one task per asset batch, each running the full script.
    pub fn start_with_assets(
        &self,
        job_id: &str,
        batches: Vec<Vec<String>>,
    ) -> Result<Job, EngineError> {
        if batches.is_empty() || batches.iter().any(|b| b.is_empty()) {
            return Err(EngineError::Validation(
                "asset batches must be non-empty".to_string(),
            ));
        }

        self.start_with(job_id, "per_asset_batch", |job| {
            batches
                .iter()
                .enumerate()
                .map(|(i, assets)| TaskSpec {
                    name: format!("{} [{}]", job.name, i),
                    script: job.script.clone(),
                    assets: assets.clone(),
                })
                .collect()
        })
    }

    /// Cancel a job, skipping every task that has not finished.
    ///
    /// Cancelling a cancelled job is a no-op; a finished job cannot be
    /// cancelled.
    pub fn cancel(&self, job_id: &str) -> Result<Job, EngineError> {
        let outcome = self.retry_on_conflict("cancel", || self.jobs.cancel_job(job_id))?;

        if outcome.previous_state == JobState::Cancelled {
            debug!(job_id = %job_id, "Job already cancelled");
            return Ok(outcome.job);
        }

        metrics::TASK_TRANSITIONS
            .with_label_values(&[TaskState::Skipped.as_str()])
            .inc_by(outcome.skipped_task_ids.len() as u64);
        info!(
            job_id = %outcome.job.id,
            skipped = outcome.skipped_task_ids.len(),
            "Job cancelled"
        );
        self.emit(AuditEvent::JobCancelled {
            job_id: outcome.job.id.clone(),
            previous_state: outcome.previous_state.to_string(),
            skipped_tasks: outcome.skipped_task_ids.len(),
        });
        self.record_job_transition(&outcome.job, outcome.previous_state, "cancelled");

        Ok(outcome.job)
    }

    /// Add a task to a started job, reopening it if it had finished.
    ///
    /// A task without a script inherits the job's script.
    pub fn expand_job(&self, job_id: &str, task: TaskSpec) -> Result<TaskReport, EngineError> {
        if task.name.trim().is_empty() {
            return Err(EngineError::Validation("task name cannot be empty".to_string()));
        }

        let outcome = self.retry_on_conflict("expand_job", || {
            let mut task = task.clone();
            if task.script.is_empty() {
                task.script = self
                    .jobs
                    .get_job(job_id)?
                    .ok_or_else(|| JobError::job_not_found(job_id))?
                    .script;
            }
            self.jobs.expand_job(job_id, task)
        })?;

        metrics::TASKS_EXPANDED.inc();
        info!(
            job_id = %outcome.job.id,
            task_id = %outcome.task.id,
            ordinal = outcome.task.ordinal,
            total = outcome.job.counts.total,
            "Job expanded"
        );
        self.emit(AuditEvent::TaskExpanded {
            job_id: outcome.job.id.clone(),
            task_id: outcome.task.id.clone(),
            name: outcome.task.name.clone(),
        });
        self.record_job_transition(&outcome.job, outcome.previous_job_state, "task added");

        Ok(TaskReport {
            task: outcome.task,
            job: outcome.job,
            applied: true,
        })
    }

    /// Put a failed task back to `Waiting`, reopening its job if it had finished.
    pub fn retry_task(&self, task_id: &str) -> Result<Task, EngineError> {
        let outcome = self.retry_on_conflict("retry_task", || {
            let task = self
                .jobs
                .get_task(task_id)?
                .ok_or_else(|| JobError::task_not_found(task_id))?;
            if task.state != TaskState::Failure {
                return Err(JobError::invalid_state(task_id, task.state, "retry task"));
            }

            self.jobs.apply_task_transition(&TaskTransition {
                task_id: task_id.to_string(),
                expected: TaskState::Failure,
                target: TaskState::Waiting,
                exit_status: None,
            })
        })?;

        metrics::TASK_RETRIES.inc();
        info!(
            task_id = %outcome.task.id,
            job_id = %outcome.job.id,
            retry_count = outcome.task.retry_count,
            "Task retried"
        );
        self.emit(AuditEvent::TaskRetried {
            job_id: outcome.job.id.clone(),
            task_id: outcome.task.id.clone(),
            retry_count: outcome.task.retry_count,
        });
        self.record_job_transition(&outcome.job, outcome.previous_job_state, "task retried");

        Ok(outcome.task)
    }

    // =========================================================================
    // Task reporting
    // =========================================================================

    /// Record a state reported by a worker.
    ///
    /// Reports for tasks that are already terminal are absorbed with
    /// `applied = false`, so duplicate and late deliveries are harmless.
    /// A report of the state the task is already in is absorbed the same
    /// way. `Waiting` and `Queued` cannot be reported: use
    /// [`JobEngine::retry_task`] and [`JobEngine::queue_tasks`].
    pub fn report_task_state(
        &self,
        task_id: &str,
        state: TaskState,
    ) -> Result<TaskReport, EngineError> {
        self.report(task_id, state, None)
    }

    /// Record a worker's exit status: 0 is success, anything else failure.
    pub fn complete_task(&self, task_id: &str, exit_status: i32) -> Result<TaskReport, EngineError> {
        let state = if exit_status == 0 {
            TaskState::Success
        } else {
            TaskState::Failure
        };
        self.report(task_id, state, Some(exit_status))
    }

    fn report(
        &self,
        task_id: &str,
        state: TaskState,
        exit_status: Option<i32>,
    ) -> Result<TaskReport, EngineError> {
        match state {
            TaskState::Waiting => {
                return Err(EngineError::InvalidState(format!(
                    "Cannot report task {} as waiting; retry it instead",
                    task_id
                )))
            }
            TaskState::Queued => {
                return Err(EngineError::InvalidState(format!(
                    "Cannot report task {} as queued; only dispatch queues tasks",
                    task_id
                )))
            }
            _ => {}
        }

        let reported = self.retry_on_conflict("report_task_state", || {
            let task = self
                .jobs
                .get_task(task_id)?
                .ok_or_else(|| JobError::task_not_found(task_id))?;

            if task.state.is_terminal() {
                return Ok(Reported::Ignored(task, "already_terminal"));
            }
            if task.state == state {
                return Ok(Reported::Ignored(task, "already_in_state"));
            }

            self.jobs
                .apply_task_transition(&TaskTransition {
                    task_id: task_id.to_string(),
                    expected: task.state,
                    target: state,
                    exit_status,
                })
                .map(Reported::Applied)
        })?;

        match reported {
            Reported::Ignored(task, reason) => {
                metrics::IGNORED_REPORTS.with_label_values(&[reason]).inc();
                debug!(
                    task_id = %task.id,
                    current = %task.state,
                    reported = %state,
                    reason,
                    "Task report ignored"
                );
                let job = self
                    .jobs
                    .get_job(&task.job_id)?
                    .ok_or_else(|| JobError::job_not_found(&task.job_id))?;
                Ok(TaskReport {
                    task,
                    job,
                    applied: false,
                })
            }
            Reported::Applied(outcome) => {
                let TransitionOutcome {
                    task,
                    job,
                    previous_task_state,
                    previous_job_state,
                } = outcome;

                metrics::TASK_TRANSITIONS
                    .with_label_values(&[task.state.as_str()])
                    .inc();
                if let (Some(started), Some(stopped)) = (task.started_at, task.stopped_at) {
                    let seconds = (stopped - started).num_milliseconds().max(0) as f64 / 1000.0;
                    metrics::TASK_DURATION
                        .with_label_values(&[task.state.as_str()])
                        .observe(seconds);
                }
                debug!(
                    task_id = %task.id,
                    job_id = %job.id,
                    state = %task.state,
                    done = job.counts.done(),
                    total = job.counts.total,
                    "Task state applied"
                );
                self.emit(AuditEvent::TaskStateChanged {
                    job_id: job.id.clone(),
                    task_id: task.id.clone(),
                    from_state: previous_task_state.to_string(),
                    to_state: task.state.to_string(),
                    exit_status: task.exit_status,
                });
                self.record_job_transition(&job, previous_job_state, "task reported");

                Ok(TaskReport {
                    task,
                    job,
                    applied: true,
                })
            }
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Hand up to `limit` waiting tasks to `host`.
    pub fn queue_tasks(&self, host: &str, limit: i64) -> Result<Vec<Task>, EngineError> {
        if host.trim().is_empty() {
            return Err(EngineError::Validation("host cannot be empty".to_string()));
        }

        let tasks = self.retry_on_conflict("queue_tasks", || self.jobs.queue_tasks(host, limit))?;

        metrics::DISPATCH_BATCH_SIZE.observe(tasks.len() as f64);
        if !tasks.is_empty() {
            metrics::TASK_TRANSITIONS
                .with_label_values(&[TaskState::Queued.as_str()])
                .inc_by(tasks.len() as u64);
            debug!(host, count = tasks.len(), "Tasks queued");
            self.emit(AuditEvent::TasksQueued {
                host: host.to_string(),
                task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            });
        }

        Ok(tasks)
    }

    /// Heartbeat from a worker for the tasks it is running.
    ///
    /// Returns how many of them were still queued or running.
    pub fn ping_tasks(&self, task_ids: &[String]) -> Result<usize, EngineError> {
        let pinged = self.retry_on_conflict("ping_tasks", || self.jobs.ping_tasks(task_ids))?;
        if pinged < task_ids.len() {
            debug!(
                requested = task_ids.len(),
                pinged,
                "Ping skipped tasks that are no longer in flight"
            );
        }
        Ok(pinged)
    }

    /// Queued or running tasks that have not been pinged for `stalled_for`.
    pub fn orphaned_tasks(&self, stalled_for: Duration, limit: i64) -> Result<Vec<Task>, EngineError> {
        let age = chrono::Duration::from_std(stalled_for)
            .map_err(|e| EngineError::Validation(format!("stall age out of range: {}", e)))?;
        Ok(self.jobs.orphaned_tasks(Utc::now() - age, limit)?)
    }

    /// Record an error a worker hit while running a task. Task and job
    /// state are left alone.
    pub fn report_task_error(
        &self,
        task_id: &str,
        error: TaskErrorSpec,
    ) -> Result<TaskError, EngineError> {
        if error.message.trim().is_empty() {
            return Err(EngineError::Validation(
                "task error message cannot be empty".to_string(),
            ));
        }

        let recorded = self.retry_on_conflict("report_task_error", || {
            self.jobs.record_task_error(task_id, error.clone())
        })?;

        metrics::TASK_ERRORS
            .with_label_values(&[if recorded.fatal { "true" } else { "false" }])
            .inc();
        warn!(
            task_id = %recorded.task_id,
            job_id = %recorded.job_id,
            asset_id = ?recorded.asset_id,
            processor = ?recorded.processor,
            fatal = recorded.fatal,
            "Task error: {}",
            recorded.message
        );
        self.emit(AuditEvent::TaskErrorReported {
            job_id: recorded.job_id.clone(),
            task_id: recorded.task_id.clone(),
            message: recorded.message.clone(),
            fatal: recorded.fatal,
        });

        Ok(recorded)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn check_consistency(job: Job) -> Result<Job, EngineError> {
        if let Some(detail) = job.counts.violation() {
            tracing::error!(job_id = %job.id, detail = %detail, "Job task counters are inconsistent");
            return Err(EngineError::Consistency(format!(
                "Counter inconsistency on job {}: {}",
                job.id, detail
            )));
        }
        Ok(job)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job, EngineError> {
        let job = self
            .jobs
            .get_job(job_id)?
            .ok_or_else(|| JobError::job_not_found(job_id))?;
        Self::check_consistency(job)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Task, EngineError> {
        Ok(self
            .jobs
            .get_task(task_id)?
            .ok_or_else(|| JobError::task_not_found(task_id))?)
    }

    /// List jobs, newest first. Fails if any listed job has broken counters.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, EngineError> {
        self.jobs
            .list_jobs(filter)?
            .into_iter()
            .map(Self::check_consistency)
            .collect()
    }

    pub fn count_jobs(&self, filter: &JobFilter) -> Result<i64, EngineError> {
        Ok(self.jobs.count_jobs(filter)?)
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, EngineError> {
        Ok(self.jobs.list_tasks(filter)?)
    }

    pub fn list_task_errors(&self, filter: &TaskErrorFilter) -> Result<Vec<TaskError>, EngineError> {
        Ok(self.jobs.list_task_errors(filter)?)
    }
}
