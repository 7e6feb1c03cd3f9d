use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::GateError;
use crate::filter::{JobFilter, RunFilter};
use crate::types::{aggregate_job_status, Status, WorkflowRun, WorkflowRunJob};

// --- Patches ---

/// Column set written by [`Store::update_job`]. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<Status>,
    /// Evaluated concurrency group and cancel flag; also marks the job evaluated.
    pub concurrency: Option<(String, bool)>,
    pub outputs: Option<BTreeMap<String, String>>,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn concurrency(group: &str, cancel: bool) -> Self {
        Self {
            concurrency: Some((group.to_string(), cancel)),
            ..Default::default()
        }
    }

    pub fn apply(&self, job: &mut WorkflowRunJob, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some((group, cancel)) = &self.concurrency {
            job.concurrency_group = group.clone();
            job.concurrency_cancel = *cancel;
            job.concurrency_evaluated = true;
        }
        if let Some(outputs) = &self.outputs {
            job.outputs = outputs.clone();
        }
        if self.started.is_some() {
            job.started = self.started;
        }
        if self.stopped.is_some() {
            job.stopped = self.stopped;
        }
        job.updated = now;
    }
}

/// Column set written by [`Store::update_run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub status: Option<Status>,
    pub need_approval: Option<bool>,
    pub started: Option<DateTime<Utc>>,
    pub stopped: Option<DateTime<Utc>>,
}

impl RunPatch {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, run: &mut WorkflowRun, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(need_approval) = self.need_approval {
            run.need_approval = need_approval;
        }
        if self.started.is_some() {
            run.started = self.started;
        }
        if self.stopped.is_some() {
            run.stopped = self.stopped;
        }
        run.updated = now;
    }
}

/// Per-repository run counters shown next to the repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepoRunCounters {
    pub num_runs: usize,
    pub num_closed_runs: usize,
}

// --- Store trait ---

/// Transactional run/job storage.
///
/// Every call happens on the coordinator task, so implementations need no
/// internal locking. `find_*` results are ordered by ascending id, which is
/// also submission order.
pub trait Store: Send + 'static {
    fn find_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, GateError>;

    fn count_runs(&self, filter: &RunFilter) -> Result<usize, GateError> {
        Ok(self.find_runs(filter)?.len())
    }

    fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<WorkflowRunJob>, GateError>;

    fn get_run(&self, id: i64) -> Result<WorkflowRun, GateError>;

    fn get_job(&self, id: i64) -> Result<WorkflowRunJob, GateError>;

    /// Persist a new run and assign its id.
    fn insert_run(&mut self, run: &mut WorkflowRun) -> Result<(), GateError>;

    /// Persist new jobs in one batch and assign their ids.
    fn insert_jobs(&mut self, jobs: &mut [WorkflowRunJob]) -> Result<(), GateError>;

    /// Apply `patch` to job `id` if its current status equals `expected`
    /// (or unconditionally when `expected` is `None`). Returns rows affected.
    fn update_job(
        &mut self,
        id: i64,
        expected: Option<Status>,
        patch: &JobPatch,
    ) -> Result<usize, GateError>;

    fn update_run(&mut self, id: i64, patch: &RunPatch) -> Result<usize, GateError>;

    /// Allocate the next per-repository run index, starting at 1.
    fn next_run_index(&mut self, repo_id: i64) -> Result<i64, GateError>;

    fn update_repo_run_counters(&mut self, repo_id: i64) -> Result<RepoRunCounters, GateError>;

    /// Bump the "new work available" version for a scope. Returns the new version.
    fn increase_task_version(&mut self, owner_id: i64, repo_id: i64) -> Result<i64, GateError>;

    /// Variables visible to a run: owner-level values overridden by repo-level ones.
    fn variables_of_run(&self, run: &WorkflowRun) -> Result<BTreeMap<String, String>, GateError>;

    /// Run `f` atomically: on error nothing it wrote stays visible. Nests.
    fn with_transaction<T, F>(&mut self, f: F) -> Result<T, GateError>
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> Result<T, GateError>;
}

// --- Shared writes ---

/// Write a job status guarded by the status it is expected to hold.
///
/// Zero affected rows means someone else moved the job first, which aborts
/// the enclosing transaction.
pub fn transition_job<S: Store>(
    store: &mut S,
    job_id: i64,
    expected: Status,
    patch: &JobPatch,
) -> Result<(), GateError> {
    let affected = store.update_job(job_id, Some(expected), patch)?;
    if affected != 1 {
        return Err(GateError::StatusConflict { job_id, expected });
    }
    Ok(())
}

/// Recompute a run's status from its persisted jobs and store it.
///
/// A run that is Blocked and whose jobs are all still Blocked keeps its
/// status. Stamps started/stopped and refreshes the repository counters when
/// the run closes.
pub fn update_run_status_from_jobs<S: Store>(
    store: &mut S,
    run_id: i64,
) -> Result<Status, GateError> {
    let run = store.get_run(run_id)?;
    let jobs = store.find_jobs(&JobFilter::run(run_id))?;
    let status = aggregate_job_status(jobs.iter().map(|j| j.status));

    if status == run.status {
        return Ok(status);
    }

    let now = Utc::now();
    let mut patch = RunPatch::status(status);
    if run.started.is_none() && status != Status::Blocked && status != Status::Waiting {
        patch.started = Some(now);
    }
    if status.is_done() {
        patch.stopped = Some(now);
    }
    store.update_run(run_id, &patch)?;

    if status.is_done() {
        store.update_repo_run_counters(run.repo_id)?;
    }

    info!(run_id, from = %run.status, to = %status, "run status changed");
    Ok(status)
}

/// Cancel every job in `jobs` that has not finished yet.
///
/// Returns the distinct run ids whose jobs were cancelled, after refreshing
/// each of those runs' aggregate status.
pub fn cancel_jobs<S: Store>(
    store: &mut S,
    jobs: &[WorkflowRunJob],
) -> Result<Vec<i64>, GateError> {
    let now = Utc::now();
    let mut run_ids: Vec<i64> = Vec::new();

    for job in jobs.iter().filter(|j| !j.status.is_done()) {
        let patch = JobPatch {
            status: Some(Status::Cancelled),
            stopped: Some(now),
            ..Default::default()
        };
        transition_job(store, job.id, job.status, &patch)?;
        debug!(job_id = job.id, run_id = job.run_id, "job cancelled");
        if !run_ids.contains(&job.run_id) {
            run_ids.push(job.run_id);
        }
    }

    for run_id in &run_ids {
        update_run_status_from_jobs(store, *run_id)?;
    }
    Ok(run_ids)
}

/// Cancel every run matched by `filter`, together with its unfinished jobs.
pub fn cancel_runs<S: Store>(store: &mut S, filter: &RunFilter) -> Result<Vec<i64>, GateError> {
    let runs = store.find_runs(filter)?;
    let mut cancelled = Vec::with_capacity(runs.len());

    for run in runs {
        let jobs = store.find_jobs(&JobFilter::run(run.id))?;
        cancel_jobs(store, &jobs)?;
        // A run without unfinished jobs would otherwise keep its old status
        let current = store.get_run(run.id)?;
        if !current.status.is_done() {
            let patch = RunPatch {
                status: Some(Status::Cancelled),
                stopped: Some(Utc::now()),
                ..Default::default()
            };
            store.update_run(run.id, &patch)?;
            store.update_repo_run_counters(run.repo_id)?;
        }
        info!(run_id = run.id, group = %run.concurrency_group, "run cancelled");
        cancelled.push(run.id);
    }
    Ok(cancelled)
}
