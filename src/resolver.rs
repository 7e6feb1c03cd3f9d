use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::concurrency::JobGate;
use crate::error::{ErrorKind, GateError};
use crate::types::{Status, StuckJob, WorkflowRunJob};
use crate::workflow::has_if_condition;

/// Status changes computed for one run, not yet persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Blocked jobs that may leave Blocked, keyed by job row id.
    pub updates: BTreeMap<i64, Status>,
    /// Jobs left Blocked because their concurrency could not be evaluated.
    pub stuck: Vec<StuckJob>,
    /// Runs touched by a cancel-in-progress while resolving.
    pub cancelled_run_ids: Vec<i64>,
}

/// Decides which Blocked jobs of one run may proceed.
///
/// Works on an in-memory snapshot of the run's jobs. Each pass considers
/// every Blocked job whose needs are all done; later passes see the
/// transitions of earlier ones, so a chain of skips settles in one call.
pub struct JobStatusResolver {
    jobs: BTreeMap<i64, WorkflowRunJob>,
    statuses: BTreeMap<i64, Status>,
    /// Job id -> ids of the jobs it needs. A symbolic need may name several jobs.
    needs: BTreeMap<i64, Vec<i64>>,
    stuck: HashSet<i64>,
}

impl JobStatusResolver {
    pub fn new(jobs: Vec<WorkflowRunJob>) -> Self {
        let mut ids_by_job_id: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
        for job in &jobs {
            ids_by_job_id.entry(job.job_id.as_str()).or_default().push(job.id);
        }

        let mut needs = BTreeMap::new();
        for job in &jobs {
            let need_ids: Vec<i64> = job
                .needs
                .iter()
                .filter_map(|need| ids_by_job_id.get(need.as_str()))
                .flatten()
                .copied()
                .collect();
            needs.insert(job.id, need_ids);
        }

        let statuses = jobs.iter().map(|j| (j.id, j.status)).collect();
        let jobs = jobs.into_iter().map(|j| (j.id, j)).collect();
        Self {
            jobs,
            statuses,
            needs,
            stuck: HashSet::new(),
        }
    }

    /// The job as last seen, including concurrency evaluated while resolving.
    pub fn job(&self, id: i64) -> Option<&WorkflowRunJob> {
        self.jobs.get(&id)
    }

    /// Run passes until nothing changes, at most once per job.
    ///
    /// An unreadable job definition leaves the job Blocked and is reported
    /// as stuck. Any other error, store failures included, aborts the
    /// resolution so the re-check is retried.
    pub fn resolve<G: JobGate>(&mut self, gate: &mut G) -> Result<Resolution, GateError> {
        let mut resolution = Resolution::default();
        // A group is claimed once a job of it is moved to Waiting in this call;
        // the store cannot see that yet, so same-group siblings wait here
        // unless they cancel in progress.
        let mut claimed_groups: HashSet<String> = HashSet::new();

        for _ in 0..self.statuses.len() {
            let changed = self.resolve_pass(gate, &mut claimed_groups, &mut resolution)?;
            if changed.is_empty() {
                break;
            }
            for (id, status) in changed {
                self.statuses.insert(id, status);
                resolution.updates.insert(id, status);
            }
        }
        Ok(resolution)
    }

    fn resolve_pass<G: JobGate>(
        &mut self,
        gate: &mut G,
        claimed_groups: &mut HashSet<String>,
        resolution: &mut Resolution,
    ) -> Result<BTreeMap<i64, Status>, GateError> {
        let mut changed = BTreeMap::new();
        let blocked: Vec<i64> = self
            .statuses
            .iter()
            .filter(|(_, status)| **status == Status::Blocked)
            .map(|(id, _)| *id)
            .collect();

        for id in blocked {
            // A cancel-in-progress earlier in this pass may have taken it
            if self.statuses.get(&id) != Some(&Status::Blocked) || self.stuck.contains(&id) {
                continue;
            }
            let Some((all_done, all_succeed)) = self.needs_state(id) else {
                continue;
            };
            if !all_done {
                continue;
            }

            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if let Err(e) = gate.prepare(job) {
                match e.kind() {
                    ErrorKind::Definition => {
                        warn!(job_id = id, run_id = job.run_id, error = %e, "job stays blocked: concurrency cannot be evaluated");
                        self.stuck.insert(id);
                        resolution.stuck.push(StuckJob {
                            job_id: id,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                    _ => return Err(e),
                }
            }

            let group = job.concurrency_group.clone();
            // A cancel-in-progress job pre-empts a sibling that claimed the group earlier
            if !group.is_empty() && !job.concurrency_cancel && claimed_groups.contains(&group) {
                debug!(job_id = id, group = %group, "job stays blocked: group taken earlier in this resolution");
                continue;
            }

            let decision = gate.admit(job)?;
            let has_if = has_if_condition(&job.workflow_payload);
            for cancelled in &decision.cancelled_job_ids {
                if self.statuses.contains_key(cancelled) {
                    self.statuses.insert(*cancelled, Status::Cancelled);
                    changed.remove(cancelled);
                    resolution.updates.remove(cancelled);
                }
            }
            for run_id in decision.cancelled_run_ids {
                if !resolution.cancelled_run_ids.contains(&run_id) {
                    resolution.cancelled_run_ids.push(run_id);
                }
            }
            if decision.blocked {
                debug!(job_id = id, group = %group, "job stays blocked by concurrency group");
                continue;
            }

            let status = if all_succeed || has_if {
                Status::Waiting
            } else {
                Status::Skipped
            };
            if status == Status::Waiting && !group.is_empty() {
                claimed_groups.insert(group);
            }
            debug!(job_id = id, to = %status, "job unblocked");
            changed.insert(id, status);
        }
        Ok(changed)
    }

    /// `(all needs done, all needs succeeded)` for job `id`.
    fn needs_state(&self, id: i64) -> Option<(bool, bool)> {
        let need_ids = self.needs.get(&id)?;
        let mut all_done = true;
        let mut all_succeed = true;
        for need_id in need_ids {
            let status = self.statuses.get(need_id).copied().unwrap_or(Status::Blocked);
            if !status.is_done() {
                all_done = false;
                break;
            }
            if matches!(status, Status::Failure | Status::Cancelled | Status::Skipped) {
                all_succeed = false;
            }
        }
        Some((all_done, all_succeed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::GateDecision;
    use crate::workflow::{JobDefinition, SingleWorkflow};

    /// Gate with a fixed set of occupied groups and no store behind it.
    #[derive(Default)]
    struct FakeGate {
        occupied: HashSet<String>,
        broken_payloads: HashSet<i64>,
        store_down: bool,
        prepared: Vec<i64>,
        /// Jobs admitted so far, as (group, id).
        admitted: Vec<(String, i64)>,
    }

    impl JobGate for FakeGate {
        fn prepare(&mut self, job: &mut WorkflowRunJob) -> Result<(), GateError> {
            if self.broken_payloads.contains(&job.id) {
                return Err(GateError::DefinitionParse {
                    job_id: job.id,
                    message: "bad yaml".to_string(),
                });
            }
            if self.store_down {
                return Err(GateError::Store("connection reset".to_string()));
            }
            if job.has_raw_concurrency() && !job.concurrency_evaluated {
                job.concurrency_group = job.raw_concurrency_group.clone();
                job.concurrency_cancel = job.raw_concurrency_cancel == "true";
                job.concurrency_evaluated = true;
                self.prepared.push(job.id);
            }
            Ok(())
        }

        fn admit(&mut self, job: &WorkflowRunJob) -> Result<GateDecision, GateError> {
            let group = job.concurrency_group.clone();
            if job.concurrency_cancel {
                let cancelled_job_ids = self
                    .admitted
                    .iter()
                    .filter(|(g, _)| *g == group)
                    .map(|(_, id)| *id)
                    .collect();
                self.admitted.push((group, job.id));
                return Ok(GateDecision {
                    cancelled_job_ids,
                    ..Default::default()
                });
            }
            self.admitted.push((group.clone(), job.id));
            Ok(GateDecision {
                blocked: self.occupied.contains(&group),
                ..Default::default()
            })
        }
    }

    fn job(id: i64, job_id: &str, needs: &[&str], status: Status) -> WorkflowRunJob {
        WorkflowRunJob {
            id,
            run_id: 1,
            job_id: job_id.to_string(),
            needs: needs.iter().map(|n| n.to_string()).collect(),
            status,
            ..Default::default()
        }
    }

    fn with_if(mut job: WorkflowRunJob) -> WorkflowRunJob {
        let def = JobDefinition {
            if_condition: "always()".to_string(),
            ..Default::default()
        };
        job.workflow_payload = SingleWorkflow::new("ci", &job.job_id.clone(), def)
            .marshal()
            .unwrap();
        job
    }

    fn with_group(mut job: WorkflowRunJob, group: &str) -> WorkflowRunJob {
        job.raw_concurrency_group = group.to_string();
        job
    }

    fn cancelling(mut job: WorkflowRunJob) -> WorkflowRunJob {
        job.raw_concurrency_cancel = "true".to_string();
        job
    }

    #[test]
    fn unblocks_when_all_needs_succeed() {
        let mut resolver = JobStatusResolver::new(vec![
            job(1, "a", &[], Status::Success),
            job(2, "b", &["a"], Status::Blocked),
        ]);
        let res = resolver.resolve(&mut FakeGate::default()).unwrap();
        assert_eq!(res.updates, BTreeMap::from([(2, Status::Waiting)]));
    }

    #[test]
    fn failed_need_skips_transitively() {
        let mut resolver = JobStatusResolver::new(vec![
            job(1, "a", &[], Status::Failure),
            job(2, "b", &["a"], Status::Blocked),
            job(3, "c", &["b"], Status::Blocked),
        ]);
        let res = resolver.resolve(&mut FakeGate::default()).unwrap();
        assert_eq!(
            res.updates,
            BTreeMap::from([(2, Status::Skipped), (3, Status::Skipped)])
        );
    }

    #[test]
    fn if_condition_defers_skip_to_executor() {
        let mut resolver = JobStatusResolver::new(vec![
            job(1, "a", &[], Status::Cancelled),
            with_if(job(2, "cleanup", &["a"], Status::Blocked)),
        ]);
        let res = resolver.resolve(&mut FakeGate::default()).unwrap();
        assert_eq!(res.updates[&2], Status::Waiting);
    }

    #[test]
    fn matrix_fan_in_waits_for_every_leg() {
        let mut resolver = JobStatusResolver::new(vec![
            job(1, "test", &[], Status::Success),
            job(2, "test", &[], Status::Running),
            job(3, "report", &["test"], Status::Blocked),
        ]);
        let res = resolver.resolve(&mut FakeGate::default()).unwrap();
        assert!(res.updates.is_empty());
    }

    #[test]
    fn occupied_group_keeps_job_blocked() {
        let mut resolver = JobStatusResolver::new(vec![
            job(1, "a", &[], Status::Success),
            with_group(job(2, "deploy", &["a"], Status::Blocked), "prod"),
        ]);
        let mut gate = FakeGate {
            occupied: HashSet::from(["prod".to_string()]),
            ..Default::default()
        };
        let res = resolver.resolve(&mut gate).unwrap();
        assert!(res.updates.is_empty());
        assert_eq!(gate.prepared, vec![2]);
        assert!(resolver.job(2).unwrap().concurrency_evaluated);
    }

    #[test]
    fn only_one_sibling_claims_a_group() {
        let mut resolver = JobStatusResolver::new(vec![
            job(1, "a", &[], Status::Success),
            with_group(job(2, "x", &["a"], Status::Blocked), "prod"),
            with_group(job(3, "y", &["a"], Status::Blocked), "prod"),
        ]);
        let res = resolver.resolve(&mut FakeGate::default()).unwrap();
        assert_eq!(res.updates, BTreeMap::from([(2, Status::Waiting)]));
    }

    #[test]
    fn cancel_in_progress_sibling_takes_claimed_group() {
        let mut resolver = JobStatusResolver::new(vec![
            job(1, "a", &[], Status::Success),
            with_group(job(2, "x", &["a"], Status::Blocked), "prod"),
            cancelling(with_group(job(3, "y", &["a"], Status::Blocked), "prod")),
        ]);
        let res = resolver.resolve(&mut FakeGate::default()).unwrap();
        assert_eq!(res.updates, BTreeMap::from([(3, Status::Waiting)]));
    }

    #[test]
    fn store_failure_while_preparing_aborts_resolution() {
        let mut resolver = JobStatusResolver::new(vec![
            job(1, "a", &[], Status::Success),
            with_group(job(2, "b", &["a"], Status::Blocked), "prod"),
        ]);
        let mut gate = FakeGate {
            store_down: true,
            ..Default::default()
        };
        let err = resolver.resolve(&mut gate).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn unreadable_definition_is_reported_stuck_once() {
        let mut resolver = JobStatusResolver::new(vec![
            job(1, "a", &[], Status::Success),
            with_group(job(2, "b", &["a"], Status::Blocked), "prod"),
            job(3, "c", &["a"], Status::Blocked),
        ]);
        let mut gate = FakeGate {
            broken_payloads: HashSet::from([2]),
            ..Default::default()
        };
        let res = resolver.resolve(&mut gate).unwrap();
        assert_eq!(res.updates, BTreeMap::from([(3, Status::Waiting)]));
        assert_eq!(res.stuck.len(), 1);
        assert_eq!(res.stuck[0].job_id, 2);
    }

    #[test]
    fn second_resolution_is_a_fixed_point() {
        let jobs = vec![
            job(1, "a", &[], Status::Failure),
            job(2, "b", &["a"], Status::Blocked),
        ];
        let mut resolver = JobStatusResolver::new(jobs.clone());
        let first = resolver.resolve(&mut FakeGate::default()).unwrap();

        let applied: Vec<WorkflowRunJob> = jobs
            .into_iter()
            .map(|mut j| {
                if let Some(status) = first.updates.get(&j.id) {
                    j.status = *status;
                }
                j
            })
            .collect();
        let second = JobStatusResolver::new(applied)
            .resolve(&mut FakeGate::default())
            .unwrap();
        assert!(second.updates.is_empty());
    }

    #[test]
    fn unknown_need_counts_as_done() {
        let mut resolver = JobStatusResolver::new(vec![job(1, "b", &["ghost"], Status::Blocked)]);
        let res = resolver.resolve(&mut FakeGate::default()).unwrap();
        assert_eq!(res.updates[&1], Status::Waiting);
    }
}
