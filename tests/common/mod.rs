#![allow(dead_code)]

use run_gate::emitter::check_jobs_by_run_id;
use run_gate::expression::TemplateEvaluator;
use run_gate::filter::JobFilter;
use run_gate::memory::MemoryStore;
use run_gate::run::{insert_run, report_job_status};
use run_gate::store::Store;
use run_gate::types::{CheckReport, InsertOutcome, JobReport, Status, WorkflowRun, WorkflowRunJob};
use run_gate::workflow::{parse_workflow, SingleWorkflow};

pub const MAX_NAME_LEN: usize = 255;

/// Creates a `WorkflowRun` for `repo_id` owned by owner 1 on `refs/heads/main`.
pub fn make_run(repo_id: i64) -> WorkflowRun {
    WorkflowRun {
        repo_id,
        owner_id: 1,
        repository: "acme/api".to_string(),
        workflow_id: "ci.yml".to_string(),
        title: "Test run".to_string(),
        event: "push".to_string(),
        ref_name: "refs/heads/main".to_string(),
        commit_sha: "abc123".to_string(),
        ..Default::default()
    }
}

/// Creates a run carrying a run-level concurrency group.
pub fn make_grouped_run(repo_id: i64, group: &str, cancel: bool) -> WorkflowRun {
    WorkflowRun {
        concurrency_group: group.to_string(),
        concurrency_cancel: cancel,
        ..make_run(repo_id)
    }
}

/// Splits a workflow file into single-job workflows, panicking on bad YAML.
pub fn workflows(yaml: &str) -> Vec<SingleWorkflow> {
    parse_workflow(yaml).expect("parse workflow")
}

/// A workflow with one job `id` in concurrency group `group`.
pub fn grouped_job(id: &str, group: &str, cancel: bool) -> Vec<SingleWorkflow> {
    workflows(&format!(
        "jobs:\n  {id}:\n    runs-on: ubuntu-latest\n    concurrency:\n      group: {group}\n      cancel-in-progress: {cancel}\n"
    ))
}

pub fn insert(store: &mut MemoryStore, run: WorkflowRun, wfs: Vec<SingleWorkflow>) -> InsertOutcome {
    insert_run(store, &TemplateEvaluator, MAX_NAME_LEN, run, wfs).expect("insert run")
}

pub fn check(store: &mut MemoryStore, run_id: i64) -> CheckReport {
    check_jobs_by_run_id(store, &TemplateEvaluator, run_id).expect("check run")
}

pub fn run_jobs(store: &MemoryStore, run_id: i64) -> Vec<WorkflowRunJob> {
    store.find_jobs(&JobFilter::run(run_id)).expect("find jobs")
}

/// The first job of the run with symbolic id `job_id`.
pub fn job(store: &MemoryStore, run_id: i64, job_id: &str) -> WorkflowRunJob {
    run_jobs(store, run_id)
        .into_iter()
        .find(|j| j.job_id == job_id)
        .unwrap_or_else(|| panic!("job {} not found in run {}", job_id, run_id))
}

pub fn job_status(store: &MemoryStore, run_id: i64, job_id: &str) -> Status {
    job(store, run_id, job_id).status
}

pub fn run_status(store: &MemoryStore, run_id: i64) -> Status {
    store.get_run(run_id).expect("get run").status
}

/// Moves a Waiting job through Running to `status`.
pub fn finish(store: &mut MemoryStore, job_id: i64, status: Status) {
    report_job_status(store, job_id, &JobReport::status(Status::Running)).expect("report running");
    report_job_status(store, job_id, &JobReport::status(status)).expect("report final");
}

/// Count of jobs in `group` that are Waiting or Running, across all runs.
pub fn active_in_group(store: &MemoryStore, repo_id: i64, group: &str) -> usize {
    store
        .find_jobs(
            &JobFilter::repo(repo_id)
                .group(group)
                .statuses(&[Status::Waiting, Status::Running]),
        )
        .expect("find jobs")
        .len()
}
