//! SQLite-backed job store implementation.
//!
//! Every mutation runs in an `IMMEDIATE` transaction: the task row is updated
//! only if it is still in the expected state, and the job row only if its
//! `version` still matches what was read. Either guard failing rolls the
//! whole unit back with [`JobError::Conflict`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::error;

use super::aggregator::next_job_state;
use super::{
    CancelOutcome, ExpandOutcome, Job, JobCounts, JobError, JobFilter, JobState, JobStore, NewJob,
    StartOutcome, Task, TaskError, TaskErrorFilter, TaskErrorSpec, TaskFilter, TaskSpec, TaskState,
    TaskTransition, TransitionOutcome,
};
use crate::sqlite::{self, enum_column, json_column, parse_optional_timestamp, parse_timestamp};

const JOB_COLUMNS: &str = "j.id, j.tenant_id, j.entity_id, j.name, j.job_type, j.pipelines, j.script, j.state, j.priority, \
     j.task_total_count, j.task_waiting_count, j.task_queued_count, j.task_running_count, \
     j.task_success_count, j.task_failure_count, j.task_skipped_count, \
     j.created_by, j.created_at, j.updated_at, j.started_at, j.stopped_at, j.version, j.error_count";

const TASK_COLUMNS: &str = "t.id, t.job_id, t.ordinal, t.name, t.state, t.script, t.assets, t.host, t.exit_status, \
     t.run_count, t.retry_count, t.created_at, t.started_at, t.stopped_at, t.state_changed_at, \
     t.pinged_at, t.error_count";

const TASK_ERROR_COLUMNS: &str =
    "e.id, e.task_id, e.job_id, e.asset_id, e.path, e.message, e.processor, e.fatal, e.phase, e.created_at";

const NON_TERMINAL_STATES: &str = "('waiting', 'queued', 'running')";

/// States in which a worker holds the task.
const IN_FLIGHT_STATES: &str = "('queued', 'running')";

fn db_err(e: rusqlite::Error) -> JobError {
    if sqlite::is_busy(&e) {
        JobError::Conflict(e.to_string())
    } else {
        JobError::Database(e.to_string())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, JobError> {
    serde_json::to_string(value).map_err(|e| JobError::Database(e.to_string()))
}

fn optional_rfc3339(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|dt| dt.to_rfc3339())
}

/// SQLite-backed job and task store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open (or create) a file-backed store with the default busy timeout.
    pub fn new(path: &Path) -> Result<Self, JobError> {
        Self::with_busy_timeout(path, sqlite::DEFAULT_BUSY_TIMEOUT)
    }

    /// Open (or create) a file-backed store.
    ///
    /// Writers blocked by another connection wait up to `busy_timeout`
    /// before the operation fails with [`JobError::Conflict`].
    pub fn with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, JobError> {
        let conn = sqlite::open_file(path, busy_timeout).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite job store (useful for testing).
    pub fn in_memory() -> Result<Self, JobError> {
        let conn = sqlite::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                name TEXT NOT NULL,
                job_type TEXT NOT NULL,
                pipelines TEXT NOT NULL,
                script TEXT NOT NULL,
                state TEXT NOT NULL,
                priority INTEGER NOT NULL,
                task_total_count INTEGER NOT NULL DEFAULT 0,
                task_waiting_count INTEGER NOT NULL DEFAULT 0,
                task_queued_count INTEGER NOT NULL DEFAULT 0,
                task_running_count INTEGER NOT NULL DEFAULT 0,
                task_success_count INTEGER NOT NULL DEFAULT 0,
                task_failure_count INTEGER NOT NULL DEFAULT 0,
                task_skipped_count INTEGER NOT NULL DEFAULT 0,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                stopped_at TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_tenant ON jobs(tenant_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs(state, priority DESC, created_at);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                ordinal INTEGER NOT NULL,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                script TEXT NOT NULL,
                assets TEXT NOT NULL,
                host TEXT,
                exit_status INTEGER,
                run_count INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                stopped_at TEXT,
                state_changed_at TEXT NOT NULL,
                pinged_at TEXT NOT NULL,
                error_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE (job_id, ordinal)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_job_state ON tasks(job_id, state);
            CREATE INDEX IF NOT EXISTS idx_tasks_ping ON tasks(state, pinged_at);

            CREATE TABLE IF NOT EXISTS task_errors (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                job_id TEXT NOT NULL REFERENCES jobs(id),
                asset_id TEXT,
                path TEXT,
                message TEXT NOT NULL,
                processor TEXT,
                fatal INTEGER NOT NULL,
                phase TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_task_errors_job ON task_errors(job_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_task_errors_task ON task_errors(task_id, created_at);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let job_type: String = row.get(4)?;
        let pipelines_json: String = row.get(5)?;
        let script_json: String = row.get(6)?;
        let state: String = row.get(7)?;
        let created_at: String = row.get(17)?;
        let updated_at: String = row.get(18)?;

        Ok(Job {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            entity_id: row.get(2)?,
            name: row.get(3)?,
            job_type: enum_column(4, &job_type)?,
            pipelines: json_column(5, &pipelines_json)?,
            script: json_column(6, &script_json)?,
            state: enum_column(7, &state)?,
            priority: row.get(8)?,
            counts: JobCounts {
                total: row.get(9)?,
                waiting: row.get(10)?,
                queued: row.get(11)?,
                running: row.get(12)?,
                success: row.get(13)?,
                failure: row.get(14)?,
                skipped: row.get(15)?,
            },
            created_by: row.get(16)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
            started_at: parse_optional_timestamp(row.get(19)?),
            stopped_at: parse_optional_timestamp(row.get(20)?),
            version: row.get(21)?,
            error_count: row.get(22)?,
        })
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let state: String = row.get(4)?;
        let script_json: String = row.get(5)?;
        let assets_json: String = row.get(6)?;
        let created_at: String = row.get(11)?;
        let state_changed_at: String = row.get(14)?;
        let pinged_at: String = row.get(15)?;

        Ok(Task {
            id: row.get(0)?,
            job_id: row.get(1)?,
            ordinal: row.get(2)?,
            name: row.get(3)?,
            state: enum_column(4, &state)?,
            script: json_column(5, &script_json)?,
            assets: json_column(6, &assets_json)?,
            host: row.get(7)?,
            exit_status: row.get(8)?,
            run_count: row.get(9)?,
            retry_count: row.get(10)?,
            created_at: parse_timestamp(&created_at),
            started_at: parse_optional_timestamp(row.get(12)?),
            stopped_at: parse_optional_timestamp(row.get(13)?),
            state_changed_at: parse_timestamp(&state_changed_at),
            pinged_at: parse_timestamp(&pinged_at),
            error_count: row.get(16)?,
        })
    }

    fn row_to_task_error(row: &rusqlite::Row) -> rusqlite::Result<TaskError> {
        let created_at: String = row.get(9)?;

        Ok(TaskError {
            id: row.get(0)?,
            task_id: row.get(1)?,
            job_id: row.get(2)?,
            asset_id: row.get(3)?,
            path: row.get(4)?,
            message: row.get(5)?,
            processor: row.get(6)?,
            fatal: row.get(7)?,
            phase: row.get(8)?,
            created_at: parse_timestamp(&created_at),
        })
    }

    fn fetch_job(conn: &Connection, id: &str) -> Result<Option<Job>, JobError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs j WHERE j.id = ?", JOB_COLUMNS),
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(db_err)
    }

    fn fetch_task(conn: &Connection, id: &str) -> Result<Option<Task>, JobError> {
        conn.query_row(
            &format!("SELECT {} FROM tasks t WHERE t.id = ?", TASK_COLUMNS),
            params![id],
            Self::row_to_task,
        )
        .optional()
        .map_err(db_err)
    }

    /// Fail with `Consistency` when the job's counters are broken.
    fn check_counts(job: &Job) -> Result<(), JobError> {
        if let Some(detail) = job.counts.violation() {
            error!(job_id = %job.id, detail = %detail, "Job task counters are inconsistent");
            return Err(JobError::Consistency {
                job_id: job.id.clone(),
                detail,
            });
        }
        Ok(())
    }

    /// Persist the job's state and counters if nobody else changed the row
    /// since it was read. Returns the job with its new version.
    fn write_job(conn: &Connection, mut job: Job, now: DateTime<Utc>) -> Result<Job, JobError> {
        Self::check_counts(&job)?;

        let updated = conn
            .execute(
                "UPDATE jobs SET state = ?, task_total_count = ?, task_waiting_count = ?, task_queued_count = ?, \
                 task_running_count = ?, task_success_count = ?, task_failure_count = ?, task_skipped_count = ?, \
                 updated_at = ?, started_at = ?, stopped_at = ?, version = version + 1 \
                 WHERE id = ? AND version = ?",
                params![
                    job.state.as_str(),
                    job.counts.total,
                    job.counts.waiting,
                    job.counts.queued,
                    job.counts.running,
                    job.counts.success,
                    job.counts.failure,
                    job.counts.skipped,
                    now.to_rfc3339(),
                    optional_rfc3339(job.started_at),
                    optional_rfc3339(job.stopped_at),
                    job.id,
                    job.version,
                ],
            )
            .map_err(db_err)?;

        if updated == 0 {
            return Err(JobError::Conflict(format!(
                "job {} changed since version {}",
                job.id, job.version
            )));
        }

        job.version += 1;
        job.updated_at = now;
        Ok(job)
    }

    /// Persist a task's mutable columns if it is still in `expected`.
    fn write_task(conn: &Connection, task: &Task, expected: TaskState) -> Result<(), JobError> {
        let updated = conn
            .execute(
                "UPDATE tasks SET state = ?, host = ?, exit_status = ?, run_count = ?, retry_count = ?, \
                 started_at = ?, stopped_at = ?, state_changed_at = ?, pinged_at = ? \
                 WHERE id = ? AND state = ?",
                params![
                    task.state.as_str(),
                    task.host,
                    task.exit_status,
                    task.run_count,
                    task.retry_count,
                    optional_rfc3339(task.started_at),
                    optional_rfc3339(task.stopped_at),
                    task.state_changed_at.to_rfc3339(),
                    task.pinged_at.to_rfc3339(),
                    task.id,
                    expected.as_str(),
                ],
            )
            .map_err(db_err)?;

        if updated == 0 {
            return Err(JobError::Conflict(format!(
                "task {} is no longer {}",
                task.id, expected
            )));
        }
        Ok(())
    }

    /// Task-level side effects of entering `target`.
    fn enter_state(task: &mut Task, transition: &TaskTransition, now: DateTime<Utc>) {
        task.state = transition.target;
        task.state_changed_at = now;
        task.pinged_at = now;

        match transition.target {
            TaskState::Waiting => {
                task.retry_count += 1;
                task.host = None;
                task.exit_status = None;
                task.started_at = None;
                task.stopped_at = None;
            }
            TaskState::Queued => {}
            TaskState::Running => {
                if task.started_at.is_none() {
                    task.started_at = Some(now);
                }
            }
            TaskState::Success | TaskState::Failure | TaskState::Skipped => {
                task.stopped_at = Some(now);
                if transition.exit_status.is_some() {
                    task.exit_status = transition.exit_status;
                }
            }
        }
    }

    /// Record the time the job stopped or clear it when it reopens.
    fn stamp_stop(job: &mut Job, previous: JobState, now: DateTime<Utc>) {
        match (previous, job.state) {
            (p, JobState::Finished) if p != JobState::Finished => job.stopped_at = Some(now),
            (JobState::Finished, JobState::Active) => job.stopped_at = None,
            _ => {}
        }
    }

    fn new_task(job_id: &str, ordinal: i64, spec: TaskSpec, now: DateTime<Utc>) -> Task {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            ordinal,
            name: spec.name,
            state: TaskState::Waiting,
            script: spec.script,
            assets: spec.assets,
            host: None,
            exit_status: None,
            run_count: 0,
            retry_count: 0,
            created_at: now,
            started_at: None,
            stopped_at: None,
            state_changed_at: now,
            pinged_at: now,
            error_count: 0,
        }
    }

    fn insert_task(conn: &Connection, task: &Task) -> Result<(), JobError> {
        conn.execute(
            "INSERT INTO tasks (id, job_id, ordinal, name, state, script, assets, created_at, state_changed_at, pinged_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                task.id,
                task.job_id,
                task.ordinal,
                task.name,
                task.state.as_str(),
                to_json(&task.script)?,
                to_json(&task.assets)?,
                task.created_at.to_rfc3339(),
                task.state_changed_at.to_rfc3339(),
                task.pinged_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn build_job_where(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref tenant_id) = filter.tenant_id {
            conditions.push("j.tenant_id = ?");
            params.push(Box::new(tenant_id.clone()));
        }

        if let Some(ref entity_id) = filter.entity_id {
            conditions.push("j.entity_id = ?");
            params.push(Box::new(entity_id.clone()));
        }

        if let Some(state) = filter.state {
            conditions.push("j.state = ?");
            params.push(Box::new(state.as_str()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn build_task_where(filter: &TaskFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref job_id) = filter.job_id {
            conditions.push("t.job_id = ?");
            params.push(Box::new(job_id.clone()));
        }

        if let Some(state) = filter.state {
            conditions.push("t.state = ?");
            params.push(Box::new(state.as_str()));
        }

        if let Some(ref host) = filter.host {
            conditions.push("t.host = ?");
            params.push(Box::new(host.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn query_tasks(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Task>, JobError> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt.query_map(params, Self::row_to_task).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

impl JobStore for SqliteJobStore {
    fn create_job(&self, new_job: NewJob) -> Result<Job, JobError> {
        let conn = self.conn.lock().unwrap();

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO jobs (id, tenant_id, entity_id, name, job_type, pipelines, script, state, priority, created_by, created_at, updated_at, version) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
            params![
                id,
                new_job.tenant_id,
                new_job.entity_id,
                new_job.name,
                new_job.job_type.as_str(),
                to_json(&new_job.pipelines)?,
                to_json(&new_job.script)?,
                JobState::Waiting.as_str(),
                new_job.priority,
                new_job.created_by,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        Ok(Job {
            id,
            tenant_id: new_job.tenant_id,
            entity_id: new_job.entity_id,
            name: new_job.name,
            job_type: new_job.job_type,
            pipelines: new_job.pipelines,
            script: new_job.script,
            state: JobState::Waiting,
            priority: new_job.priority,
            counts: JobCounts::default(),
            created_by: new_job.created_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
            version: 0,
            error_count: 0,
        })
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, JobError> {
        let conn = self.conn.lock().unwrap();
        Self::fetch_job(&conn, id)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, mut all_params) = Self::build_job_where(filter);
        let sql = format!(
            "SELECT {} FROM jobs j {} ORDER BY j.created_at DESC, j.id LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_clause
        );

        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, JobError> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, params) = Self::build_job_where(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs j {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(db_err)
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>, JobError> {
        let conn = self.conn.lock().unwrap();
        Self::fetch_task(&conn, id)
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, JobError> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, mut all_params) = Self::build_task_where(filter);
        let sql = format!(
            "SELECT {} FROM tasks t {} ORDER BY t.job_id, t.ordinal LIMIT ? OFFSET ?",
            TASK_COLUMNS, where_clause
        );

        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        Self::query_tasks(&conn, &sql, param_refs.as_slice())
    }

    fn start_job(&self, job_id: &str, specs: Vec<TaskSpec>) -> Result<StartOutcome, JobError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut job =
            Self::fetch_job(&tx, job_id)?.ok_or_else(|| JobError::job_not_found(job_id))?;
        if job.state != JobState::Waiting {
            return Err(JobError::invalid_state(job_id, job.state, "start job"));
        }
        Self::check_counts(&job)?;

        let now = Utc::now();
        let mut tasks = Vec::with_capacity(specs.len());

        for (ordinal, spec) in specs.into_iter().enumerate() {
            let task = Self::new_task(&job.id, ordinal as i64, spec, now);
            Self::insert_task(&tx, &task)?;
            tasks.push(task);
        }

        job.counts.add_waiting(tasks.len() as i64);
        job.started_at = Some(now);
        job.state = next_job_state(JobState::Active, &job.counts);
        let job = Self::write_job(&tx, job, now)?;

        tx.commit().map_err(db_err)?;

        Ok(StartOutcome { job, tasks })
    }

    fn expand_job(&self, job_id: &str, spec: TaskSpec) -> Result<ExpandOutcome, JobError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut job =
            Self::fetch_job(&tx, job_id)?.ok_or_else(|| JobError::job_not_found(job_id))?;
        if !matches!(job.state, JobState::Active | JobState::Finished) {
            return Err(JobError::invalid_state(job_id, job.state, "expand job"));
        }
        Self::check_counts(&job)?;

        let ordinal: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(ordinal) + 1, 0) FROM tasks WHERE job_id = ?",
                params![job_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let now = Utc::now();
        let task = Self::new_task(&job.id, ordinal, spec, now);
        Self::insert_task(&tx, &task)?;

        let previous_job_state = job.state;
        job.counts.add_waiting(1);
        job.state = next_job_state(job.state, &job.counts);
        Self::stamp_stop(&mut job, previous_job_state, now);
        let job = Self::write_job(&tx, job, now)?;

        tx.commit().map_err(db_err)?;

        Ok(ExpandOutcome {
            job,
            task,
            previous_job_state,
        })
    }

    fn apply_task_transition(
        &self,
        transition: &TaskTransition,
    ) -> Result<TransitionOutcome, JobError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut task = Self::fetch_task(&tx, &transition.task_id)?
            .ok_or_else(|| JobError::task_not_found(&transition.task_id))?;
        if task.state != transition.expected {
            return Err(JobError::Conflict(format!(
                "task {} is {}, expected {}",
                task.id, task.state, transition.expected
            )));
        }

        let mut job = Self::fetch_job(&tx, &task.job_id)?
            .ok_or_else(|| JobError::job_not_found(&task.job_id))?;
        if job.state == JobState::Cancelled {
            return Err(JobError::invalid_state(
                &task.id,
                format!("{} (job cancelled)", task.state),
                format!("move task to {}", transition.target),
            ));
        }
        Self::check_counts(&job)?;

        let now = Utc::now();
        Self::enter_state(&mut task, transition, now);
        Self::write_task(&tx, &task, transition.expected)?;

        let previous_job_state = job.state;
        job.counts.shift(transition.expected, transition.target, 1);
        job.state = next_job_state(job.state, &job.counts);
        Self::stamp_stop(&mut job, previous_job_state, now);
        let job = Self::write_job(&tx, job, now)?;

        tx.commit().map_err(db_err)?;

        Ok(TransitionOutcome {
            task,
            job,
            previous_task_state: transition.expected,
            previous_job_state,
        })
    }

    fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome, JobError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut job =
            Self::fetch_job(&tx, job_id)?.ok_or_else(|| JobError::job_not_found(job_id))?;
        let previous_state = job.state;

        match previous_state {
            JobState::Cancelled => {
                return Ok(CancelOutcome {
                    job,
                    previous_state,
                    skipped_task_ids: Vec::new(),
                })
            }
            JobState::Finished => {
                return Err(JobError::invalid_state(job_id, previous_state, "cancel job"))
            }
            JobState::Waiting | JobState::Active => {}
        }
        Self::check_counts(&job)?;

        let pending: Vec<(String, String)> = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT id, state FROM tasks WHERE job_id = ? AND state IN {} ORDER BY ordinal",
                    NON_TERMINAL_STATES
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![job_id], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        for (task_id, state) in &pending {
            let state: TaskState = state.parse().map_err(|e: String| JobError::Consistency {
                job_id: job_id.to_string(),
                detail: format!("task {}: {}", task_id, e),
            })?;
            job.counts.shift(state, TaskState::Skipped, 1);
        }

        let now = Utc::now();
        tx.execute(
            &format!(
                "UPDATE tasks SET state = ?, stopped_at = ?, state_changed_at = ?, pinged_at = ? \
                 WHERE job_id = ? AND state IN {}",
                NON_TERMINAL_STATES
            ),
            params![
                TaskState::Skipped.as_str(),
                now.to_rfc3339(),
                now.to_rfc3339(),
                now.to_rfc3339(),
                job_id
            ],
        )
        .map_err(db_err)?;

        job.state = JobState::Cancelled;
        job.stopped_at = Some(now);
        let job = Self::write_job(&tx, job, now)?;

        tx.commit().map_err(db_err)?;

        Ok(CancelOutcome {
            job,
            previous_state,
            skipped_task_ids: pending.into_iter().map(|(id, _)| id).collect(),
        })
    }

    fn queue_tasks(&self, host: &str, limit: i64) -> Result<Vec<Task>, JobError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let sql = format!(
            "SELECT {} FROM tasks t JOIN jobs j ON j.id = t.job_id \
             WHERE t.state = ? AND j.state = ? \
             ORDER BY j.priority DESC, j.created_at ASC, j.id, t.ordinal ASC LIMIT ?",
            TASK_COLUMNS
        );
        let mut tasks = Self::query_tasks(
            &tx,
            &sql,
            params![TaskState::Waiting.as_str(), JobState::Active.as_str(), limit],
        )?;

        if tasks.is_empty() {
            return Ok(tasks);
        }

        let now = Utc::now();
        let mut jobs: HashMap<String, Job> = HashMap::new();

        for task in tasks.iter_mut() {
            task.state = TaskState::Queued;
            task.host = Some(host.to_string());
            task.run_count += 1;
            task.state_changed_at = now;
            task.pinged_at = now;
            Self::write_task(&tx, task, TaskState::Waiting)?;

            if !jobs.contains_key(&task.job_id) {
                let job = Self::fetch_job(&tx, &task.job_id)?
                    .ok_or_else(|| JobError::job_not_found(&task.job_id))?;
                Self::check_counts(&job)?;
                jobs.insert(task.job_id.clone(), job);
            }
            if let Some(job) = jobs.get_mut(&task.job_id) {
                job.counts.shift(TaskState::Waiting, TaskState::Queued, 1);
            }
        }

        for (_, mut job) in jobs {
            let previous = job.state;
            job.state = next_job_state(job.state, &job.counts);
            Self::stamp_stop(&mut job, previous, now);
            Self::write_job(&tx, job, now)?;
        }

        tx.commit().map_err(db_err)?;

        Ok(tasks)
    }

    fn ping_tasks(&self, task_ids: &[String]) -> Result<usize, JobError> {
        if task_ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let now = Utc::now().to_rfc3339();
        let mut pinged = 0;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "UPDATE tasks SET pinged_at = ? WHERE id = ? AND state IN {}",
                    IN_FLIGHT_STATES
                ))
                .map_err(db_err)?;
            for task_id in task_ids {
                pinged += stmt.execute(params![now, task_id]).map_err(db_err)?;
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(pinged)
    }

    fn orphaned_tasks(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, JobError> {
        let conn = self.conn.lock().unwrap();

        let sql = format!(
            "SELECT {} FROM tasks t JOIN jobs j ON j.id = t.job_id \
             WHERE t.state IN {} AND j.state = ? AND t.pinged_at < ? \
             ORDER BY t.pinged_at ASC LIMIT ?",
            TASK_COLUMNS, IN_FLIGHT_STATES
        );

        Self::query_tasks(
            &conn,
            &sql,
            params![JobState::Active.as_str(), older_than.to_rfc3339(), limit],
        )
    }

    fn record_task_error(
        &self,
        task_id: &str,
        spec: TaskErrorSpec,
    ) -> Result<TaskError, JobError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let task =
            Self::fetch_task(&tx, task_id)?.ok_or_else(|| JobError::task_not_found(task_id))?;

        let error = TaskError {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task.id,
            job_id: task.job_id,
            asset_id: spec.asset_id,
            path: spec.path,
            message: spec.message,
            processor: spec.processor,
            fatal: spec.fatal,
            phase: spec.phase,
            created_at: Utc::now(),
        };

        tx.execute(
            "INSERT INTO task_errors (id, task_id, job_id, asset_id, path, message, processor, fatal, phase, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                error.id,
                error.task_id,
                error.job_id,
                error.asset_id,
                error.path,
                error.message,
                error.processor,
                error.fatal,
                error.phase,
                error.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tx.execute(
            "UPDATE tasks SET error_count = error_count + 1 WHERE id = ?",
            params![error.task_id],
        )
        .map_err(db_err)?;
        tx.execute(
            "UPDATE jobs SET error_count = error_count + 1 WHERE id = ?",
            params![error.job_id],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(error)
    }

    fn list_task_errors(&self, filter: &TaskErrorFilter) -> Result<Vec<TaskError>, JobError> {
        let conn = self.conn.lock().unwrap();

        let mut conditions = Vec::new();
        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(ref job_id) = filter.job_id {
            conditions.push("e.job_id = ?");
            all_params.push(Box::new(job_id.clone()));
        }
        if let Some(ref task_id) = filter.task_id {
            conditions.push("e.task_id = ?");
            all_params.push(Box::new(task_id.clone()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT {} FROM task_errors e {} ORDER BY e.created_at ASC, e.rowid ASC LIMIT ?",
            TASK_ERROR_COLUMNS, where_clause
        );
        all_params.push(Box::new(filter.limit));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_task_error)
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
