//! Job lifecycle integration tests.
//!
//! These tests drive the engine over file-backed stores:
//! waiting -> active -> finished, with retries, cancellation and dispatch.

use std::sync::Arc;

use tempfile::TempDir;

use conveyor_core::{
    create_audit_system, AuditEvent, AuditFilter, AuditStore, CreatePipelineRequest,
    EngineConfig, JobEngine, JobFilter, JobSpec, JobState, JobStore, PipelineStore,
    PipelineType, ProcessorRef, SqliteAuditStore, SqliteJobStore, SqlitePipelineStore,
    TaskErrorFilter, TaskErrorSpec, TaskFilter, TaskGrouping, TaskSpec, TaskState,
};

const TENANT: &str = "3a7e1c90-5b2d-4f6e-8a1c-0d9e8f7a6b5c";

/// Engine over stores in a temporary database file.
struct TestHarness {
    jobs: Arc<SqliteJobStore>,
    pipelines: Arc<SqlitePipelineStore>,
    temp_dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.db");

        let jobs = Arc::new(SqliteJobStore::new(&db_path).expect("Failed to create job store"));
        let pipelines = Arc::new(
            SqlitePipelineStore::new(&db_path).expect("Failed to create pipeline store"),
        );

        Self {
            jobs,
            pipelines,
            temp_dir,
        }
    }

    fn engine(&self, grouping: TaskGrouping) -> JobEngine {
        JobEngine::new(
            Arc::clone(&self.jobs) as Arc<dyn JobStore>,
            Arc::clone(&self.pipelines) as Arc<dyn PipelineStore>,
            EngineConfig {
                task_grouping: grouping,
                ..Default::default()
            },
        )
    }

    fn add_pipeline(&self, engine: &JobEngine, name: &str, processors: &[&str], standard: bool) {
        let mut request = CreatePipelineRequest::new(
            TENANT,
            name,
            PipelineType::Import,
            processors.iter().map(|p| ProcessorRef::new(*p)).collect(),
        );
        if standard {
            request = request.standard();
        }
        engine
            .create_pipeline(request)
            .expect("Failed to create pipeline");
    }

    fn spec(&self, name: &str) -> JobSpec {
        JobSpec::new(TENANT, "entity-1", name, PipelineType::Import)
    }
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_single_processor_job_runs_to_finished() {
    let harness = TestHarness::new();
    let engine = harness.engine(TaskGrouping::PerProcessor);
    harness.add_pipeline(&engine, "standard", &["thumbnail"], false);

    let job = engine
        .create(harness.spec("thumbs").with_pipelines(["standard"]))
        .unwrap();
    let job = engine.start(&job.id).unwrap();

    assert_eq!(job.state, JobState::Active);
    assert_eq!(job.counts.total, 1);

    let tasks = engine.list_tasks(&TaskFilter::new().with_job(&job.id)).unwrap();
    assert_eq!(tasks.len(), 1);

    let report = engine
        .report_task_state(&tasks[0].id, TaskState::Success)
        .unwrap();
    assert!(report.applied);
    assert_eq!(report.job.state, JobState::Finished);
    assert_eq!(report.job.counts.success, 1);

    let stored = engine.get_job(&job.id).unwrap();
    assert_eq!(stored.state, JobState::Finished);
    assert!(stored.stopped_at.is_some());
}

#[test]
fn test_completion_in_any_arrival_order() {
    let harness = TestHarness::new();
    let engine = harness.engine(TaskGrouping::PerProcessor);
    harness.add_pipeline(&engine, "ingest", &["a", "b", "c", "d"], true);

    for order in [[0, 1, 2, 3], [3, 1, 0, 2], [2, 3, 1, 0]] {
        let job = engine.create(harness.spec("ordered")).unwrap();
        engine.start(&job.id).unwrap();
        let tasks = engine.list_tasks(&TaskFilter::new().with_job(&job.id)).unwrap();

        let mut finished_reports = 0;
        for (n, &i) in order.iter().enumerate() {
            let state = match n {
                0 => TaskState::Failure,
                1 => TaskState::Skipped,
                _ => TaskState::Success,
            };
            let report = engine.report_task_state(&tasks[i].id, state).unwrap();
            if report.job.state == JobState::Finished {
                finished_reports += 1;
                assert_eq!(n, order.len() - 1, "job finished before its last task");
            }
        }

        assert_eq!(finished_reports, 1);
        let job = engine.get_job(&job.id).unwrap();
        assert_eq!(job.counts.failure, 1);
        assert_eq!(job.counts.skipped, 1);
        assert_eq!(job.counts.success, 2);
        assert_eq!(job.counts.pending(), 0);
    }
}

#[test]
fn test_counters_conserved_through_every_state() {
    let harness = TestHarness::new();
    let engine = harness.engine(TaskGrouping::PerProcessor);
    harness.add_pipeline(&engine, "ingest", &["a", "b", "c"], true);

    let job = engine.create(harness.spec("conserve")).unwrap();
    engine.start(&job.id).unwrap();
    let tasks = engine.list_tasks(&TaskFilter::new().with_job(&job.id)).unwrap();

    let steps = [
        (0, TaskState::Queued),
        (0, TaskState::Running),
        (1, TaskState::Running),
        (0, TaskState::Failure),
        (2, TaskState::Skipped),
        (1, TaskState::Success),
    ];
    for (i, state) in steps {
        let report = engine.report_task_state(&tasks[i].id, state).unwrap();
        let counts = report.job.counts;
        let sum = counts.waiting
            + counts.queued
            + counts.running
            + counts.success
            + counts.failure
            + counts.skipped;
        assert_eq!(sum, counts.total);
        assert!(counts.violation().is_none());
    }

    engine.retry_task(&tasks[0].id).unwrap();
    let job = engine.get_job(&job.id).unwrap();
    assert_eq!(job.state, JobState::Active);
    assert_eq!(job.counts.waiting, 1);
    assert_eq!(job.counts.done(), 2);
}

#[test]
fn test_retry_reopens_finished_job_until_task_completes_again() {
    let harness = TestHarness::new();
    let engine = harness.engine(TaskGrouping::WholeScript);
    harness.add_pipeline(&engine, "ingest", &["fetch", "parse"], true);

    let job = engine.create(harness.spec("flaky")).unwrap();
    engine.start(&job.id).unwrap();
    let task_id = engine.list_tasks(&TaskFilter::new().with_job(&job.id)).unwrap()[0]
        .id
        .clone();

    engine.queue_tasks("worker-1", 10).unwrap();
    engine.report_task_state(&task_id, TaskState::Running).unwrap();
    let report = engine.complete_task(&task_id, 137).unwrap();
    assert_eq!(report.job.state, JobState::Finished);
    assert_eq!(report.job.counts.failure, 1);

    engine.retry_task(&task_id).unwrap();
    assert_eq!(engine.get_job(&job.id).unwrap().state, JobState::Active);

    let queued = engine.queue_tasks("worker-2", 10).unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].run_count, 2);
    assert_eq!(queued[0].retry_count, 1);
    assert_eq!(queued[0].host.as_deref(), Some("worker-2"));

    engine.report_task_state(&task_id, TaskState::Running).unwrap();
    let report = engine.complete_task(&task_id, 0).unwrap();
    assert_eq!(report.job.state, JobState::Finished);
    assert_eq!(report.job.counts.success, 1);
    assert_eq!(report.job.counts.failure, 0);
}

#[test]
fn test_cancel_skips_in_flight_tasks_and_absorbs_late_reports() {
    let harness = TestHarness::new();
    let engine = harness.engine(TaskGrouping::PerProcessor);
    harness.add_pipeline(&engine, "ingest", &["a", "b", "c"], true);

    let job = engine.create(harness.spec("doomed")).unwrap();
    engine.start(&job.id).unwrap();
    let queued = engine.queue_tasks("worker-1", 2).unwrap();
    engine
        .report_task_state(&queued[0].id, TaskState::Running)
        .unwrap();

    let cancelled = engine.cancel(&job.id).unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);
    assert_eq!(cancelled.counts.skipped, 3);

    let skipped = engine
        .list_tasks(
            &TaskFilter::new()
                .with_job(&job.id)
                .with_state(TaskState::Skipped),
        )
        .unwrap();
    assert_eq!(skipped.len(), 3);

    for task in &queued {
        let late = engine.complete_task(&task.id, 0).unwrap();
        assert!(!late.applied);
        assert_eq!(late.job.state, JobState::Cancelled);
    }

    assert!(engine.queue_tasks("worker-1", 10).unwrap().is_empty());
    assert_eq!(engine.get_job(&job.id).unwrap().counts.success, 0);
}

#[test]
fn test_dispatch_by_priority_then_age() {
    let harness = TestHarness::new();
    let engine = harness.engine(TaskGrouping::WholeScript);
    harness.add_pipeline(&engine, "ingest", &["a"], true);

    let first = engine.create(harness.spec("first")).unwrap();
    let urgent = engine
        .create(harness.spec("urgent").with_priority(500))
        .unwrap();
    let second = engine.create(harness.spec("second")).unwrap();
    let unstarted = engine.create(harness.spec("unstarted")).unwrap();
    for job in [&second, &urgent, &first] {
        engine.start(&job.id).unwrap();
    }

    let queued = engine.queue_tasks("worker-1", 10).unwrap();
    let order: Vec<_> = queued.iter().map(|t| t.job_id.as_str()).collect();
    assert_eq!(
        order,
        vec![urgent.id.as_str(), first.id.as_str(), second.id.as_str()]
    );
    assert!(!order.contains(&unstarted.id.as_str()));

    let on_host = engine
        .list_tasks(&TaskFilter::new().with_host("worker-1"))
        .unwrap();
    assert_eq!(on_host.len(), 3);
}

#[test]
fn test_orphaned_tasks_only_from_active_jobs() {
    let harness = TestHarness::new();
    let engine = harness.engine(TaskGrouping::WholeScript);
    harness.add_pipeline(&engine, "ingest", &["a"], true);

    let live = engine.create(harness.spec("live")).unwrap();
    let dead = engine.create(harness.spec("dead")).unwrap();
    engine.start(&live.id).unwrap();
    engine.start(&dead.id).unwrap();
    engine.queue_tasks("worker-1", 10).unwrap();
    engine.cancel(&dead.id).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(20));
    let orphans = engine
        .orphaned_tasks(std::time::Duration::from_millis(1), 10)
        .unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].job_id, live.id);

    let report = engine
        .report_task_state(&orphans[0].id, TaskState::Failure)
        .unwrap();
    assert_eq!(report.job.state, JobState::Finished);
    assert!(engine
        .orphaned_tasks(std::time::Duration::from_millis(1), 10)
        .unwrap()
        .is_empty());
}

#[test]
fn test_pinging_worker_survives_stall_sweeps() {
    let harness = TestHarness::new();
    let engine = harness.engine(TaskGrouping::WholeScript);
    harness.add_pipeline(&engine, "ingest", &["a"], true);

    let busy = engine.create(harness.spec("busy")).unwrap();
    let silent = engine.create(harness.spec("silent")).unwrap();
    engine.start(&busy.id).unwrap();
    engine.start(&silent.id).unwrap();

    let claimed = engine.queue_tasks("worker-1", 10).unwrap();
    assert_eq!(claimed.len(), 2);
    let busy_task = claimed.iter().find(|t| t.job_id == busy.id).unwrap().id.clone();
    for task in &claimed {
        engine.report_task_state(&task.id, TaskState::Running).unwrap();
    }

    // Only the busy worker keeps pinging while the sweeps run.
    let stall = std::time::Duration::from_millis(25);
    let mut failed = Vec::new();
    for _ in 0..6 {
        std::thread::sleep(std::time::Duration::from_millis(10));
        engine.ping_tasks(&[busy_task.clone()]).unwrap();
        for orphan in engine.orphaned_tasks(stall, 10).unwrap() {
            let report = engine
                .report_task_state(&orphan.id, TaskState::Failure)
                .unwrap();
            assert!(report.applied);
            failed.push(orphan.job_id);
        }
    }
    assert_eq!(failed, vec![silent.id.clone()]);

    let report = engine.complete_task(&busy_task, 0).unwrap();
    assert!(report.applied);
    assert_eq!(report.job.state, JobState::Finished);
    assert_eq!(report.job.counts.success, 1);
    assert_eq!(report.job.counts.failure, 0);
}

#[test]
fn test_running_task_fans_out_child_tasks() {
    let harness = TestHarness::new();
    let engine = harness.engine(TaskGrouping::WholeScript);
    harness.add_pipeline(&engine, "ingest", &["scan", "index"], true);

    let job = engine.create(harness.spec("crawl")).unwrap();
    engine.start(&job.id).unwrap();
    let parent = engine.queue_tasks("worker-1", 1).unwrap().remove(0);
    engine.report_task_state(&parent.id, TaskState::Running).unwrap();

    for i in 0..3 {
        let child = TaskSpec {
            name: format!("crawl [batch {}]", i),
            script: Vec::new(),
            assets: vec![format!("asset-{}", i)],
        };
        engine.expand_job(&job.id, child).unwrap();
    }
    engine
        .report_task_error(
            &parent.id,
            TaskErrorSpec::new("skipped unreadable file").with_asset("asset-x", "/in/x.bin"),
        )
        .unwrap();

    let report = engine.complete_task(&parent.id, 0).unwrap();
    assert_eq!(report.job.state, JobState::Active);
    assert_eq!(report.job.counts.total, 4);
    assert_eq!(report.job.counts.waiting, 3);

    let children = engine.queue_tasks("worker-2", 10).unwrap();
    let ordinals: Vec<_> = children.iter().map(|t| t.ordinal).collect();
    assert_eq!(ordinals, vec![1, 2, 3]);
    assert!(children.iter().all(|t| t.script == job.script));

    let mut last = None;
    for child in &children {
        last = Some(engine.complete_task(&child.id, 0).unwrap());
    }
    let last = last.unwrap();
    assert_eq!(last.job.state, JobState::Finished);
    assert_eq!(last.job.counts.success, 4);
    assert_eq!(last.job.error_count, 1);

    let errors = engine
        .list_task_errors(&TaskErrorFilter::new().with_job(&job.id))
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].task_id, parent.id);
}

#[test]
fn test_list_jobs_by_state_and_entity() {
    let harness = TestHarness::new();
    let engine = harness.engine(TaskGrouping::WholeScript);
    harness.add_pipeline(&engine, "ingest", &["a"], true);

    let a = engine.create(harness.spec("a")).unwrap();
    engine.create(harness.spec("b")).unwrap();
    engine
        .create(JobSpec::new(TENANT, "entity-2", "c", PipelineType::Import))
        .unwrap();
    engine.start(&a.id).unwrap();

    let waiting = JobFilter::new().with_state(JobState::Waiting);
    assert_eq!(engine.count_jobs(&waiting).unwrap(), 2);

    let entity = JobFilter::new().with_entity("entity-2");
    let jobs = engine.list_jobs(&entity).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].name, "c");

    let tenant = JobFilter::new().with_tenant(TENANT).with_limit(2);
    assert_eq!(engine.list_jobs(&tenant).unwrap().len(), 2);
}

#[tokio::test]
async fn test_audit_trail_records_job_lifecycle() {
    let harness = TestHarness::new();
    let audit_store = Arc::new(
        SqliteAuditStore::new(&harness.temp_dir.path().join("audit.db"))
            .expect("Failed to create audit store"),
    );
    let (handle, writer) = create_audit_system(audit_store.clone(), 256);
    let writer_task = tokio::spawn(writer.run());

    let engine = harness.engine(TaskGrouping::WholeScript).with_audit(handle);
    harness.add_pipeline(&engine, "ingest", &["a"], true);

    let job = engine.create(harness.spec("audited").created_by("alice")).unwrap();
    engine.start(&job.id).unwrap();
    let tasks = engine.list_tasks(&TaskFilter::new().with_job(&job.id)).unwrap();
    engine.complete_task(&tasks[0].id, 2).unwrap();
    engine.retry_task(&tasks[0].id).unwrap();
    engine.cancel(&job.id).unwrap();

    drop(engine);
    writer_task.await.unwrap();

    let transitions = audit_store
        .query(
            &AuditFilter::new()
                .with_job_id(&job.id)
                .with_event_type("job_state_changed"),
        )
        .unwrap();
    let moves: Vec<_> = transitions
        .iter()
        .filter_map(|r| match &r.data {
            AuditEvent::JobStateChanged {
                from_state,
                to_state,
                ..
            } => Some(format!("{}->{}", from_state, to_state)),
            _ => None,
        })
        .collect();
    assert_eq!(
        moves,
        vec![
            "waiting->active",
            "active->finished",
            "finished->active",
            "active->cancelled"
        ]
    );

    let created = audit_store
        .query(
            &AuditFilter::new()
                .with_job_id(&job.id)
                .with_event_type("job_created"),
        )
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].user_id.as_deref(), Some("alice"));
}
