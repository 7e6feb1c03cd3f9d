use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use tracing::{debug, info};

use crate::concurrency::{admit_job, admit_run, evaluate_job_concurrency};
use crate::error::GateError;
use crate::expression::ConcurrencyEvaluator;
use crate::filter::JobFilter;
use crate::store::{
    cancel_jobs, transition_job, update_run_status_from_jobs, JobPatch, RunPatch, Store,
};
use crate::types::{InsertOutcome, JobReport, Status, WorkflowRun, WorkflowRunJob};
use crate::workflow::SingleWorkflow;

// --- Insertion ---

/// Insert a run and its jobs atomically.
///
/// Each entry of `workflows` holds exactly one job. Jobs with needs, jobs of
/// a run awaiting approval, and jobs of a run held by its concurrency group
/// start Blocked; the others start Waiting unless their own concurrency
/// group is occupied. Nothing is written when any step fails.
pub fn insert_run<S, E>(
    store: &mut S,
    evaluator: &E,
    max_name_len: usize,
    mut run: WorkflowRun,
    workflows: Vec<SingleWorkflow>,
) -> Result<InsertOutcome, GateError>
where
    S: Store,
    E: ConcurrencyEvaluator + ?Sized,
{
    store.with_transaction(|store| {
        run.index = store.next_run_index(run.repo_id)?;
        run.title = truncate_at_boundary(&run.title, max_name_len);

        let mut cancelled_run_ids = admit_run(store, &mut run)?;

        store.insert_run(&mut run)?;
        store.update_repo_run_counters(run.repo_id)?;
        let vars = store.variables_of_run(&run)?;

        let mut jobs: Vec<WorkflowRunJob> = Vec::with_capacity(workflows.len());
        let mut claimed_groups: HashSet<String> = HashSet::new();
        for workflow in workflows {
            let mut job = new_job(&run, workflow, max_name_len)?;
            if job.has_raw_concurrency() && job.status != Status::Blocked {
                let (group, cancel) =
                    evaluate_job_concurrency(evaluator, &run, &job, &vars, BTreeMap::new())?;
                job.concurrency_group = group;
                job.concurrency_cancel = cancel;
                job.concurrency_evaluated = true;

                if !job.concurrency_group.is_empty() {
                    if job.concurrency_cancel {
                        // Earlier jobs of this batch are not stored yet
                        for sibling in jobs.iter_mut().filter(|j| {
                            j.concurrency_group == job.concurrency_group && !j.status.is_done()
                        }) {
                            debug!(job_id = %sibling.job_id, group = %job.concurrency_group, "job cancelled by sibling in progress");
                            sibling.status = Status::Cancelled;
                        }
                    }
                    if claimed_groups.contains(&job.concurrency_group) && !job.concurrency_cancel {
                        job.status = Status::Blocked;
                    } else {
                        let decision = admit_job(store, &job)?;
                        for run_id in decision.cancelled_run_ids {
                            if !cancelled_run_ids.contains(&run_id) {
                                cancelled_run_ids.push(run_id);
                            }
                        }
                        if decision.blocked {
                            job.status = Status::Blocked;
                        }
                    }
                    if job.status == Status::Waiting {
                        claimed_groups.insert(job.concurrency_group.clone());
                    }
                }
            }
            debug!(job_id = %job.job_id, status = %job.status, group = %job.concurrency_group, "job prepared");
            jobs.push(job);
        }

        store.insert_jobs(&mut jobs)?;
        let status = update_run_status_from_jobs(store, run.id)?;

        let has_waiting = jobs.iter().any(|j| j.status == Status::Waiting);
        if has_waiting {
            store.increase_task_version(run.owner_id, run.repo_id)?;
        }

        info!(
            run_id = run.id,
            index = run.index,
            repo_id = run.repo_id,
            jobs = jobs.len(),
            status = %status,
            "run inserted"
        );
        Ok(InsertOutcome {
            run_id: run.id,
            index: run.index,
            status,
            has_waiting,
            cancelled_run_ids,
        })
    })
}

/// Build the job row for one single-job workflow, with its needs erased from the payload.
fn new_job(
    run: &WorkflowRun,
    mut workflow: SingleWorkflow,
    max_name_len: usize,
) -> Result<WorkflowRunJob, GateError> {
    let (job_id, definition) = workflow
        .job()
        .map(|(id, def)| (id.to_string(), def.clone()))
        .ok_or_else(|| GateError::DefinitionParse {
            job_id: 0,
            message: "workflow holds no job".to_string(),
        })?;

    let needs = definition.needs.clone();
    let runs_on = definition.runs_on.clone();
    let raw = definition.concurrency.clone().unwrap_or_default();
    let name = if definition.name.is_empty() {
        job_id.clone()
    } else {
        definition.name.clone()
    };

    workflow.set_job(&job_id, definition.erase_needs());
    let payload = workflow
        .marshal()
        .map_err(|message| GateError::DefinitionParse { job_id: 0, message })?;

    let status = if !needs.is_empty() || run.need_approval || run.status == Status::Blocked {
        Status::Blocked
    } else {
        Status::Waiting
    };

    Ok(WorkflowRunJob {
        run_id: run.id,
        repo_id: run.repo_id,
        owner_id: run.owner_id,
        commit_sha: run.commit_sha.clone(),
        is_fork_pull_request: run.is_fork_pull_request,
        name: truncate_at_boundary(&name, max_name_len),
        job_id,
        workflow_payload: payload,
        needs,
        runs_on,
        status,
        raw_concurrency_group: raw.group,
        raw_concurrency_cancel: raw.cancel_in_progress,
        ..Default::default()
    })
}

/// Cut `s` to at most `max` bytes without splitting a character.
pub fn truncate_at_boundary(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

// --- Lifecycle ---

/// Apply a status report from the executor side. Returns the job's run id.
pub fn report_job_status<S: Store>(
    store: &mut S,
    job_id: i64,
    report: &JobReport,
) -> Result<i64, GateError> {
    store.with_transaction(|store| {
        let job = store.get_job(job_id)?;
        if !job.status.can_transition_to(report.status) {
            return Err(GateError::InvalidTransition {
                job_id,
                from: job.status,
                to: report.status,
            });
        }

        let now = Utc::now();
        let patch = JobPatch {
            status: Some(report.status),
            outputs: (!report.outputs.is_empty()).then(|| report.outputs.clone()),
            started: (report.status == Status::Running).then_some(now),
            stopped: report.status.is_done().then_some(now),
            ..Default::default()
        };
        transition_job(store, job_id, job.status, &patch)?;
        info!(job_id, run_id = job.run_id, from = %job.status, to = %report.status, "job status reported");

        update_run_status_from_jobs(store, job.run_id)?;
        Ok(job.run_id)
    })
}

/// Clear the approval requirement of a run so its jobs may be resolved.
pub fn approve_run<S: Store>(store: &mut S, run_id: i64) -> Result<(), GateError> {
    store.with_transaction(|store| {
        let run = store.get_run(run_id)?;
        if !run.need_approval {
            return Ok(());
        }
        let patch = RunPatch {
            need_approval: Some(false),
            ..Default::default()
        };
        store.update_run(run_id, &patch)?;
        info!(run_id, "run approved");
        Ok(())
    })
}

/// Cancel every unfinished job of a run. Returns the final run status.
pub fn cancel_run<S: Store>(store: &mut S, run_id: i64) -> Result<Status, GateError> {
    store.with_transaction(|store| {
        let run = store.get_run(run_id)?;
        if run.status.is_done() {
            return Ok(run.status);
        }
        let jobs = store.find_jobs(&JobFilter::run(run_id))?;
        cancel_jobs(store, &jobs)?;
        let status = update_run_status_from_jobs(store, run_id)?;
        info!(run_id, status = %status, "run cancelled on request");
        Ok(status)
    })
}
