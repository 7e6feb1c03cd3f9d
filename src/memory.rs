use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use tracing::trace;

use crate::error::GateError;
use crate::filter::{JobFilter, RunFilter};
use crate::store::{JobPatch, RepoRunCounters, RunPatch, Store};
use crate::types::{Status, WorkflowRun, WorkflowRunJob};

#[derive(Debug, Clone, Default)]
struct Tables {
    runs: BTreeMap<i64, WorkflowRun>,
    jobs: BTreeMap<i64, WorkflowRunJob>,
    last_run_id: i64,
    last_job_id: i64,
    run_indexes: HashMap<i64, i64>,
    run_counters: HashMap<i64, RepoRunCounters>,
    /// Keyed by (owner_id, repo_id); `0` stands for "any".
    task_versions: HashMap<(i64, i64), i64>,
    owner_variables: HashMap<i64, BTreeMap<String, String>>,
    repo_variables: HashMap<i64, BTreeMap<String, String>>,
}

/// In-process [`Store`] backed by ordered maps.
///
/// Transactions snapshot the tables and restore the snapshot when the
/// closure fails.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Tables,
    /// Number of upcoming write calls that fail with a store error.
    failing_writes: usize,
    /// When non-zero, the `find_jobs` call at this position from now fails once.
    failing_find_jobs: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owner_variable(&mut self, owner_id: i64, name: &str, value: &str) {
        self.tables
            .owner_variables
            .entry(owner_id)
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_repo_variable(&mut self, repo_id: i64, name: &str, value: &str) {
        self.tables
            .repo_variables
            .entry(repo_id)
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    /// Make the next `count` write calls fail as if the backend were unreachable.
    pub fn fail_next_writes(&mut self, count: usize) {
        self.failing_writes = count;
    }

    /// Let `skip` more `find_jobs` calls through, then fail the next one.
    pub fn fail_find_jobs_after(&mut self, skip: usize) {
        self.failing_find_jobs = AtomicUsize::new(skip + 1);
    }

    pub fn repo_run_counters(&self, repo_id: i64) -> RepoRunCounters {
        self.tables
            .run_counters
            .get(&repo_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn task_version(&self, owner_id: i64, repo_id: i64) -> i64 {
        self.tables
            .task_versions
            .get(&(owner_id, repo_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn runs(&self) -> Vec<WorkflowRun> {
        self.tables.runs.values().cloned().collect()
    }

    pub fn jobs(&self) -> Vec<WorkflowRunJob> {
        self.tables.jobs.values().cloned().collect()
    }

    fn check_write(&mut self, op: &str) -> Result<(), GateError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(GateError::Store(format!("injected failure in {}", op)));
        }
        Ok(())
    }

    fn check_find_jobs(&self) -> Result<(), GateError> {
        let position = self.failing_find_jobs.load(Ordering::Relaxed);
        if position == 0 {
            return Ok(());
        }
        self.failing_find_jobs.store(position - 1, Ordering::Relaxed);
        if position == 1 {
            return Err(GateError::Store("injected failure in find_jobs".to_string()));
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn find_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, GateError> {
        Ok(self
            .tables
            .runs
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<WorkflowRunJob>, GateError> {
        self.check_find_jobs()?;
        Ok(self
            .tables
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect())
    }

    fn get_run(&self, id: i64) -> Result<WorkflowRun, GateError> {
        self.tables
            .runs
            .get(&id)
            .cloned()
            .ok_or(GateError::RunNotFound(id))
    }

    fn get_job(&self, id: i64) -> Result<WorkflowRunJob, GateError> {
        self.tables
            .jobs
            .get(&id)
            .cloned()
            .ok_or(GateError::JobNotFound(id))
    }

    fn insert_run(&mut self, run: &mut WorkflowRun) -> Result<(), GateError> {
        self.check_write("insert_run")?;
        self.tables.last_run_id += 1;
        run.id = self.tables.last_run_id;
        let now = Utc::now();
        run.created = now;
        run.updated = now;
        self.tables.runs.insert(run.id, run.clone());
        trace!(run_id = run.id, "run inserted");
        Ok(())
    }

    fn insert_jobs(&mut self, jobs: &mut [WorkflowRunJob]) -> Result<(), GateError> {
        self.check_write("insert_jobs")?;
        let now = Utc::now();
        for job in jobs.iter_mut() {
            self.tables.last_job_id += 1;
            job.id = self.tables.last_job_id;
            job.updated = now;
            self.tables.jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    fn update_job(
        &mut self,
        id: i64,
        expected: Option<Status>,
        patch: &JobPatch,
    ) -> Result<usize, GateError> {
        self.check_write("update_job")?;
        let Some(job) = self.tables.jobs.get_mut(&id) else {
            return Ok(0);
        };
        if expected.is_some_and(|s| s != job.status) {
            return Ok(0);
        }
        patch.apply(job, Utc::now());
        Ok(1)
    }

    fn update_run(&mut self, id: i64, patch: &RunPatch) -> Result<usize, GateError> {
        self.check_write("update_run")?;
        let Some(run) = self.tables.runs.get_mut(&id) else {
            return Ok(0);
        };
        patch.apply(run, Utc::now());
        Ok(1)
    }

    fn next_run_index(&mut self, repo_id: i64) -> Result<i64, GateError> {
        self.check_write("next_run_index")?;
        let index = self.tables.run_indexes.entry(repo_id).or_insert(0);
        *index += 1;
        Ok(*index)
    }

    fn update_repo_run_counters(&mut self, repo_id: i64) -> Result<RepoRunCounters, GateError> {
        self.check_write("update_repo_run_counters")?;
        let (num_runs, num_closed_runs) = self
            .tables
            .runs
            .values()
            .filter(|r| r.repo_id == repo_id)
            .fold((0, 0), |(total, closed), r| {
                (total + 1, closed + usize::from(r.status.is_done()))
            });
        let counters = RepoRunCounters {
            num_runs,
            num_closed_runs,
        };
        self.tables.run_counters.insert(repo_id, counters);
        Ok(counters)
    }

    fn increase_task_version(&mut self, owner_id: i64, repo_id: i64) -> Result<i64, GateError> {
        self.check_write("increase_task_version")?;
        // Runners poll at global, owner or repo scope, so every enclosing scope moves.
        let mut version = 0;
        for scope in [(0, 0), (owner_id, 0), (owner_id, repo_id)] {
            let entry = self.tables.task_versions.entry(scope).or_insert(0);
            *entry += 1;
            version = *entry;
        }
        Ok(version)
    }

    fn variables_of_run(&self, run: &WorkflowRun) -> Result<BTreeMap<String, String>, GateError> {
        let mut vars = self
            .tables
            .owner_variables
            .get(&run.owner_id)
            .cloned()
            .unwrap_or_default();
        if let Some(repo_vars) = self.tables.repo_variables.get(&run.repo_id) {
            vars.extend(repo_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(vars)
    }

    fn with_transaction<T, F>(&mut self, f: F) -> Result<T, GateError>
    where
        F: FnOnce(&mut Self) -> Result<T, GateError>,
    {
        let snapshot = self.tables.clone();
        let result = f(self);
        if result.is_err() {
            self.tables = snapshot;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(repo_id: i64) -> WorkflowRun {
        WorkflowRun {
            repo_id,
            owner_id: 1,
            ..Default::default()
        }
    }

    #[test]
    fn run_indexes_are_per_repository() {
        let mut store = MemoryStore::new();
        assert_eq!(store.next_run_index(1).unwrap(), 1);
        assert_eq!(store.next_run_index(1).unwrap(), 2);
        assert_eq!(store.next_run_index(2).unwrap(), 1);
    }

    #[test]
    fn conditional_update_requires_expected_status() {
        let mut store = MemoryStore::new();
        let mut jobs = vec![WorkflowRunJob {
            run_id: 1,
            job_id: "build".to_string(),
            status: Status::Blocked,
            ..Default::default()
        }];
        store.insert_jobs(&mut jobs).unwrap();
        let id = jobs[0].id;

        let patch = JobPatch::status(Status::Waiting);
        assert_eq!(store.update_job(id, Some(Status::Running), &patch).unwrap(), 0);
        assert_eq!(store.update_job(id, Some(Status::Blocked), &patch).unwrap(), 1);
        assert_eq!(store.get_job(id).unwrap().status, Status::Waiting);
    }

    #[test]
    fn failed_transaction_restores_tables() {
        let mut store = MemoryStore::new();
        let result: Result<(), GateError> = store.with_transaction(|s| {
            s.insert_run(&mut run(1))?;
            Err(GateError::Store("boom".to_string()))
        });
        assert!(result.is_err());
        assert!(store.runs().is_empty());

        // Ids handed out inside the failed transaction are reused
        let mut committed = run(1);
        store.insert_run(&mut committed).unwrap();
        assert_eq!(committed.id, 1);
    }

    #[test]
    fn repo_variables_override_owner_variables() {
        let mut store = MemoryStore::new();
        store.set_owner_variable(1, "ENV", "staging");
        store.set_owner_variable(1, "REGION", "eu");
        store.set_repo_variable(5, "ENV", "prod");

        let vars = store.variables_of_run(&run(5)).unwrap();
        assert_eq!(vars["ENV"], "prod");
        assert_eq!(vars["REGION"], "eu");
    }

    #[test]
    fn task_version_moves_every_enclosing_scope() {
        let mut store = MemoryStore::new();
        store.increase_task_version(3, 9).unwrap();
        assert_eq!(store.task_version(0, 0), 1);
        assert_eq!(store.task_version(3, 0), 1);
        assert_eq!(store.task_version(3, 9), 1);
        assert_eq!(store.task_version(4, 0), 0);
    }

    #[test]
    fn injected_failures_are_consumed() {
        let mut store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.insert_run(&mut run(1)).is_err());
        assert!(store.insert_run(&mut run(1)).is_ok());
    }

    #[test]
    fn find_jobs_failure_hits_the_chosen_call_once() {
        let mut store = MemoryStore::new();
        store.fail_find_jobs_after(1);
        let all = JobFilter::run(1);
        assert!(store.find_jobs(&all).is_ok());
        assert!(matches!(store.find_jobs(&all), Err(GateError::Store(_))));
        assert!(store.find_jobs(&all).is_ok());
    }
}
