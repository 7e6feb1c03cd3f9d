mod common;

use run_gate::coordinator::{spawn_coordinator, CoordinatorHandle, CHANNEL_CAPACITY};
use run_gate::error::GateError;
use run_gate::expression::TemplateEvaluator;
use run_gate::memory::MemoryStore;
use run_gate::types::{JobReport, Status};

const CI: &str = r#"
jobs:
  build: {}
  test:
    needs: build
"#;

fn spawn() -> (CoordinatorHandle, tokio::task::JoinHandle<MemoryStore>) {
    spawn_coordinator(MemoryStore::new(), TemplateEvaluator, CHANNEL_CAPACITY, 255)
}

async fn job_id(handle: &CoordinatorHandle, run_id: i64, job_id: &str) -> i64 {
    handle
        .get_run_jobs(run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.job_id == job_id)
        .unwrap()
        .id
}

// --- Insert and check ---

#[tokio::test]
async fn insert_then_check_through_handle() {
    let (handle, _task) = spawn();
    let outcome = handle
        .insert_run(common::make_run(1), common::workflows(CI))
        .await
        .unwrap();
    assert_eq!(outcome.status, Status::Waiting);

    let build = job_id(&handle, outcome.run_id, "build").await;
    handle
        .report_job(build, JobReport::status(Status::Running))
        .await
        .unwrap();
    let run_id = handle
        .report_job(build, JobReport::status(Status::Success))
        .await
        .unwrap();
    assert_eq!(run_id, outcome.run_id);

    let report = handle.check_run(run_id).await.unwrap();
    let test = job_id(&handle, run_id, "test").await;
    assert_eq!(report.transitions.get(&test), Some(&Status::Waiting));
    assert_eq!(handle.get_run(run_id).await.unwrap().status, Status::Waiting);
}

#[tokio::test]
async fn concurrent_handles_are_serialized() {
    let (handle, task) = spawn();
    let mut joins = Vec::new();
    for _ in 0..8 {
        let handle = handle.clone();
        joins.push(tokio::spawn(async move {
            handle
                .insert_run(common::make_run(1), common::workflows(CI))
                .await
                .unwrap()
                .index
        }));
    }
    let mut indexes = Vec::new();
    for join in joins {
        indexes.push(join.await.unwrap());
    }
    indexes.sort();
    assert_eq!(indexes, (1..=8).collect::<Vec<i64>>());

    drop(handle);
    let store = task.await.unwrap();
    assert_eq!(store.repo_run_counters(1).num_runs, 8);
}

// --- Lifecycle commands ---

#[tokio::test]
async fn invalid_report_leaves_job_untouched() {
    let (handle, _task) = spawn();
    let run = handle
        .insert_run(common::make_run(1), common::workflows(CI))
        .await
        .unwrap()
        .run_id;
    let build = job_id(&handle, run, "build").await;

    let err = handle
        .report_job(build, JobReport::status(Status::Failure))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());

    let jobs = handle.get_run_jobs(run).await.unwrap();
    let build_job = jobs.iter().find(|j| j.id == build).unwrap();
    assert_eq!(build_job.status, Status::Waiting);
    assert!(build_job.started.is_none());
}

#[tokio::test]
async fn report_stamps_start_and_stop_times() {
    let (handle, _task) = spawn();
    let run = handle
        .insert_run(common::make_run(1), common::workflows(CI))
        .await
        .unwrap()
        .run_id;
    let build = job_id(&handle, run, "build").await;

    handle
        .report_job(build, JobReport::status(Status::Running))
        .await
        .unwrap();
    handle
        .report_job(build, JobReport::status(Status::Failure))
        .await
        .unwrap();

    let jobs = handle.get_run_jobs(run).await.unwrap();
    let build_job = jobs.iter().find(|j| j.id == build).unwrap();
    assert!(build_job.started.is_some());
    assert!(build_job.stopped.is_some());
}

#[tokio::test]
async fn approve_is_idempotent() {
    let (handle, _task) = spawn();
    let mut run = common::make_run(1);
    run.need_approval = true;
    let run = handle
        .insert_run(run, common::workflows(CI))
        .await
        .unwrap()
        .run_id;

    handle.approve_run(run).await.unwrap();
    handle.approve_run(run).await.unwrap();
    assert!(!handle.get_run(run).await.unwrap().need_approval);
}

#[tokio::test]
async fn cancel_finished_run_keeps_its_status() {
    let (handle, _task) = spawn();
    let run = handle
        .insert_run(common::make_run(1), Vec::new())
        .await
        .unwrap()
        .run_id;
    assert_eq!(handle.cancel_run(run).await.unwrap(), Status::Success);
}

#[tokio::test]
async fn cancel_run_cancels_every_unfinished_job() {
    let (handle, _task) = spawn();
    let run = handle
        .insert_run(common::make_run(1), common::workflows(CI))
        .await
        .unwrap()
        .run_id;

    assert_eq!(handle.cancel_run(run).await.unwrap(), Status::Cancelled);
    let jobs = handle.get_run_jobs(run).await.unwrap();
    assert!(jobs.iter().all(|j| j.status == Status::Cancelled));
}

// --- Errors ---

#[tokio::test]
async fn unknown_run_check_is_not_found() {
    let (handle, _task) = spawn();
    assert!(matches!(
        handle.check_run(7).await,
        Err(GateError::RunNotFound(7))
    ));
    assert!(matches!(
        handle.approve_run(7).await,
        Err(GateError::RunNotFound(7))
    ));
}

#[tokio::test]
async fn stopped_coordinator_reports_shutdown() {
    let (handle, task) = spawn();
    task.abort();
    let _ = task.await;

    let err = handle.get_run(1).await.unwrap_err();
    assert!(matches!(err, GateError::CoordinatorShutdown));
}
