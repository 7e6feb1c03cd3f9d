use std::collections::HashSet;

use tracing::{debug, error, info};

use crate::concurrency::{run_blocked_by_concurrency, StoreGate};
use crate::coordinator::CoordinatorHandle;
use crate::error::GateError;
use crate::expression::ConcurrencyEvaluator;
use crate::filter::{JobFilter, RunFilter};
use crate::queue::{PushOutcome, RecheckHandler, RecheckQueue};
use crate::resolver::JobStatusResolver;
use crate::store::{transition_job, update_run_status_from_jobs, JobPatch, Store};
use crate::types::{CheckReport, Status, WorkflowRun};

// --- Transactional re-check ---

/// Re-check one run, then the runs and jobs waiting on its concurrency groups.
///
/// Steps, in one transaction:
/// 1. Resolve the run's own Blocked jobs.
/// 2. When the run has a group, walk the group's Blocked runs oldest first,
///    skipping runs awaiting approval, and stop at the first one that becomes
///    Waiting.
/// 3. For every finished job of the run holding a group, walk the Blocked
///    jobs of that group (skipping runs seen in step 2 or awaiting approval)
///    and stop once one becomes Waiting.
///
/// The scans run whatever the finished run's cancel-in-progress flag: runs
/// and jobs queued behind it may not cancel in progress themselves.
pub fn check_jobs_by_run_id<S, E>(
    store: &mut S,
    evaluator: &E,
    run_id: i64,
) -> Result<CheckReport, GateError>
where
    S: Store,
    E: ConcurrencyEvaluator + ?Sized,
{
    store.with_transaction(|store| {
        let run = store.get_run(run_id)?;
        let mut report = CheckReport {
            run_id,
            ..Default::default()
        };

        check_jobs_of_run(store, evaluator, &run, &mut report)?;

        let mut scanned_runs: HashSet<i64> = HashSet::new();
        if !run.concurrency_group.is_empty() {
            let filter = RunFilter::repo(run.repo_id)
                .group(&run.concurrency_group)
                .statuses(&[Status::Blocked]);
            for candidate in store.find_runs(&filter)? {
                scanned_runs.insert(candidate.id);
                if candidate.need_approval {
                    continue;
                }
                check_jobs_of_run(store, evaluator, &candidate, &mut report)?;
                if store.get_run(candidate.id)?.status == Status::Waiting {
                    debug!(run_id = candidate.id, group = %run.concurrency_group, "run unblocked from group");
                    break;
                }
            }
        }

        let finished = store
            .find_jobs(&JobFilter::run(run_id))?
            .into_iter()
            .filter(|j| j.status.is_done() && !j.concurrency_group.is_empty());
        for job in finished {
            let filter = JobFilter::repo(job.repo_id)
                .group(&job.concurrency_group)
                .statuses(&[Status::Blocked]);
            for candidate in store.find_jobs(&filter)? {
                if scanned_runs.contains(&candidate.run_id) {
                    continue;
                }
                let candidate_run = store.get_run(candidate.run_id)?;
                if candidate_run.need_approval {
                    continue;
                }
                check_jobs_of_run(store, evaluator, &candidate_run, &mut report)?;
                if store.get_job(candidate.id)?.status == Status::Waiting {
                    debug!(job_id = candidate.id, group = %job.concurrency_group, "job unblocked from group");
                    break;
                }
            }
        }

        Ok(report)
    })
}

/// Resolve the Blocked jobs of one run and persist the outcome.
///
/// A run awaiting approval is left alone, as is a Blocked run whose
/// concurrency group is still occupied by another run.
pub fn check_jobs_of_run<S, E>(
    store: &mut S,
    evaluator: &E,
    run: &WorkflowRun,
    report: &mut CheckReport,
) -> Result<(), GateError>
where
    S: Store,
    E: ConcurrencyEvaluator + ?Sized,
{
    if run.need_approval {
        debug!(run_id = run.id, "run awaits approval, not resolving");
        return Ok(());
    }
    if run.status == Status::Blocked && run_blocked_by_concurrency(store, run)? {
        debug!(run_id = run.id, group = %run.concurrency_group, "run still held by its concurrency group");
        return Ok(());
    }

    store.with_transaction(|store| {
        let jobs = store.find_jobs(&JobFilter::run(run.id))?;
        let vars = store.variables_of_run(run)?;

        let mut resolver = JobStatusResolver::new(jobs);
        let resolution = {
            let mut gate = StoreGate {
                store: &mut *store,
                evaluator,
                run,
                vars: &vars,
            };
            resolver.resolve(&mut gate)?
        };

        for (job_id, status) in &resolution.updates {
            transition_job(store, *job_id, Status::Blocked, &JobPatch::status(*status))?;
            report.transitions.insert(*job_id, *status);
        }
        if !resolution.updates.is_empty() {
            update_run_status_from_jobs(store, run.id)?;
        }
        if resolution.updates.values().any(|s| *s == Status::Waiting) {
            store.increase_task_version(run.owner_id, run.repo_id)?;
        }

        for stuck in resolution.stuck {
            if !report.stuck.iter().any(|s| s.job_id == stuck.job_id) {
                report.stuck.push(stuck);
            }
        }
        for cancelled in resolution.cancelled_run_ids {
            if !report.cancelled_run_ids.contains(&cancelled) {
                report.cancelled_run_ids.push(cancelled);
            }
        }
        Ok(())
    })
}

// --- Queue handler ---

/// Queue handler running re-checks through the coordinator.
///
/// Runs touched by a cancel-in-progress are queued for their own re-check.
pub struct JobEmitter {
    coordinator: CoordinatorHandle,
    queue: std::sync::Arc<RecheckQueue>,
}

impl JobEmitter {
    pub fn new(coordinator: CoordinatorHandle, queue: std::sync::Arc<RecheckQueue>) -> Self {
        Self { coordinator, queue }
    }
}

impl RecheckHandler for JobEmitter {
    async fn process(&self, batch: Vec<i64>) -> Vec<i64> {
        let mut failed = Vec::new();
        for run_id in batch {
            match self.coordinator.check_run(run_id).await {
                Ok(report) => {
                    if !report.transitions.is_empty() {
                        info!(run_id, transitions = report.transitions.len(), "re-check applied transitions");
                    }
                    for cancelled in report.cancelled_run_ids {
                        if cancelled != run_id {
                            if let Err(e) = emit_jobs_if_ready(&self.queue, cancelled) {
                                debug!(run_id = cancelled, error = %e, "follow-up re-check not queued");
                            }
                        }
                    }
                }
                // The run is gone; retrying cannot help
                Err(GateError::RunNotFound(_)) => {
                    debug!(run_id, "re-check for unknown run dropped");
                }
                Err(e) => {
                    error!(run_id, error = %e, "re-check failed");
                    failed.push(run_id);
                }
            }
        }
        failed
    }
}

/// Queue a re-check for `run_id`. A request already pending counts as success.
pub fn emit_jobs_if_ready(queue: &RecheckQueue, run_id: i64) -> Result<(), GateError> {
    match queue.push(run_id)? {
        PushOutcome::Queued => debug!(run_id, "re-check queued"),
        PushOutcome::AlreadyQueued => debug!(run_id, "re-check already queued"),
    }
    Ok(())
}
