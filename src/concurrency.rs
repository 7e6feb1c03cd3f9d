use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::error::GateError;
use crate::expression::{git_context, ConcurrencyEvaluator, EvalContext, JobResult};
use crate::filter::{JobFilter, RunFilter};
use crate::needs::find_task_needs;
use crate::store::{cancel_jobs, cancel_runs, transition_job, JobPatch, Store};
use crate::types::{Status, WorkflowRun, WorkflowRunJob};
use crate::workflow::{RawConcurrency, SingleWorkflow};

// --- Evaluation ---

/// Evaluate a job's raw concurrency into `(group, cancel_in_progress)`.
///
/// `job_results` may be empty when no need has produced anything yet; the
/// evaluator then receives a single placeholder entry for the job itself.
/// Fails only when the stored job definition cannot be read.
pub fn evaluate_job_concurrency<E: ConcurrencyEvaluator + ?Sized>(
    evaluator: &E,
    run: &WorkflowRun,
    job: &WorkflowRunJob,
    vars: &BTreeMap<String, String>,
    job_results: BTreeMap<String, JobResult>,
) -> Result<(String, bool), GateError> {
    let workflow =
        SingleWorkflow::parse(&job.workflow_payload).map_err(|message| GateError::DefinitionParse {
            job_id: job.id,
            message,
        })?;

    let job_results = if job_results.is_empty() {
        BTreeMap::from([(job.job_id.clone(), JobResult::default())])
    } else {
        job_results
    };

    let raw = RawConcurrency {
        group: job.raw_concurrency_group.clone(),
        cancel_in_progress: job.raw_concurrency_cancel.clone(),
    };
    let github = git_context(run, job);
    let ctx = EvalContext {
        job_id: &job.job_id,
        job: workflow.jobs.get(&job.job_id),
        github: &github,
        vars,
        needs: &job_results,
    };
    Ok(evaluator.evaluate_concurrency(&raw, &ctx))
}

// --- Job gate ---

/// Outcome of admitting one job into its concurrency group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateDecision {
    /// Another job occupies the group; the job stays Blocked.
    pub blocked: bool,
    /// Jobs cancelled to make room, by row id.
    pub cancelled_job_ids: Vec<i64>,
    /// Runs owning the cancelled jobs.
    pub cancelled_run_ids: Vec<i64>,
}

/// Concurrency checks consulted by the job status resolver.
pub trait JobGate {
    /// Make sure the job's concurrency is evaluated, evaluating it now if needed.
    fn prepare(&mut self, job: &mut WorkflowRunJob) -> Result<(), GateError>;

    /// Decide whether the job may leave Blocked as far as its group is concerned.
    fn admit(&mut self, job: &WorkflowRunJob) -> Result<GateDecision, GateError>;
}

/// [`JobGate`] backed by the store, used inside a re-check transaction.
pub struct StoreGate<'a, S, E: ?Sized> {
    pub store: &'a mut S,
    pub evaluator: &'a E,
    pub run: &'a WorkflowRun,
    pub vars: &'a BTreeMap<String, String>,
}

impl<S: Store, E: ConcurrencyEvaluator + ?Sized> JobGate for StoreGate<'_, S, E> {
    fn prepare(&mut self, job: &mut WorkflowRunJob) -> Result<(), GateError> {
        ensure_job_concurrency_evaluated(self.store, self.evaluator, self.run, job, self.vars)
    }

    fn admit(&mut self, job: &WorkflowRunJob) -> Result<GateDecision, GateError> {
        admit_job(self.store, job)
    }
}

/// Evaluate and persist a job's concurrency the first time it is needed.
///
/// Needs results feed the evaluation, so this runs only once every need is
/// done. The evaluated values are written once and never recomputed, even
/// when the group comes out empty.
pub fn ensure_job_concurrency_evaluated<S, E>(
    store: &mut S,
    evaluator: &E,
    run: &WorkflowRun,
    job: &mut WorkflowRunJob,
    vars: &BTreeMap<String, String>,
) -> Result<(), GateError>
where
    S: Store,
    E: ConcurrencyEvaluator + ?Sized,
{
    if !job.has_raw_concurrency() || job.concurrency_evaluated {
        return Ok(());
    }

    let job_results = find_task_needs(store, job)?
        .iter()
        .map(|(id, need)| (id.clone(), need.to_job_result()))
        .collect();
    let (group, cancel) = evaluate_job_concurrency(evaluator, run, job, vars, job_results)?;

    let patch = JobPatch::concurrency(&group, cancel);
    transition_job(store, job.id, job.status, &patch)?;

    debug!(job_id = job.id, run_id = job.run_id, group = %group, cancel, "job concurrency evaluated");
    job.concurrency_group = group;
    job.concurrency_cancel = cancel;
    job.concurrency_evaluated = true;
    Ok(())
}

/// Apply the job-level concurrency rule to a job about to leave Blocked.
///
/// - No group: never blocked.
/// - cancel-in-progress: every other unfinished job in the group is
///   cancelled and the job proceeds.
/// - Otherwise: blocked while another job of the group is Waiting or Running.
pub fn admit_job<S: Store>(store: &mut S, job: &WorkflowRunJob) -> Result<GateDecision, GateError> {
    if !job.has_raw_concurrency() || job.concurrency_group.is_empty() {
        return Ok(GateDecision::default());
    }

    if job.concurrency_cancel {
        let filter = JobFilter::repo(job.repo_id)
            .group(&job.concurrency_group)
            .statuses(&[Status::Running, Status::Waiting, Status::Blocked])
            .excluding(job.id);
        let occupants = store.find_jobs(&filter)?;
        let cancelled_run_ids = cancel_jobs(store, &occupants)?;
        if !occupants.is_empty() {
            info!(
                job_id = job.id,
                group = %job.concurrency_group,
                cancelled = occupants.len(),
                "cancelled jobs in progress for concurrency group"
            );
        }
        return Ok(GateDecision {
            blocked: false,
            cancelled_job_ids: occupants.iter().map(|j| j.id).collect(),
            cancelled_run_ids,
        });
    }

    Ok(GateDecision {
        blocked: should_job_be_blocked(store, job)?,
        ..Default::default()
    })
}

/// True while another job of the same group is Waiting or Running.
pub fn should_job_be_blocked<S: Store>(store: &S, job: &WorkflowRunJob) -> Result<bool, GateError> {
    if job.concurrency_group.is_empty() {
        return Ok(false);
    }
    let filter = JobFilter::repo(job.repo_id)
        .group(&job.concurrency_group)
        .statuses(&[Status::Waiting, Status::Running])
        .excluding(job.id);
    Ok(!store.find_jobs(&filter)?.is_empty())
}

// --- Run gate ---

/// Apply the run-level concurrency rule to a run about to be inserted.
///
/// With cancel-in-progress, every other Running, Waiting or Blocked run of
/// the group is cancelled and their ids returned. Otherwise the run starts
/// Blocked when another run of the group is Waiting or Running.
pub fn admit_run<S: Store>(store: &mut S, run: &mut WorkflowRun) -> Result<Vec<i64>, GateError> {
    if run.concurrency_group.is_empty() {
        return Ok(Vec::new());
    }

    let filter = RunFilter::repo(run.repo_id)
        .group(&run.concurrency_group)
        .excluding(run.id);

    if run.concurrency_cancel {
        let filter = filter.statuses(&[Status::Running, Status::Waiting, Status::Blocked]);
        return cancel_runs(store, &filter);
    }

    let active = store.count_runs(&filter.statuses(&[Status::Waiting, Status::Running]))?;
    if active > 0 {
        debug!(group = %run.concurrency_group, active, "run starts blocked by concurrency group");
        run.status = Status::Blocked;
    }
    Ok(Vec::new())
}

/// True when a Blocked run must stay Blocked because its group is occupied.
pub fn run_blocked_by_concurrency<S: Store>(store: &S, run: &WorkflowRun) -> Result<bool, GateError> {
    if run.concurrency_group.is_empty() || run.concurrency_cancel {
        return Ok(false);
    }
    let filter = RunFilter::repo(run.repo_id)
        .group(&run.concurrency_group)
        .statuses(&[Status::Waiting, Status::Running])
        .excluding(run.id);
    Ok(store.count_runs(&filter)? > 0)
}
