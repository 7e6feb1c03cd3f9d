use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::error::GateError;
use crate::expression::JobResult;
use crate::filter::JobFilter;
use crate::store::Store;
use crate::types::{aggregate_job_status, Status, WorkflowRunJob};

/// What a job receives about one of its needs when handed to an executor.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TaskNeed {
    pub result: Status,
    pub outputs: BTreeMap<String, String>,
}

impl TaskNeed {
    pub fn to_job_result(&self) -> JobResult {
        JobResult {
            result: self.result.to_string(),
            outputs: self.outputs.clone(),
        }
    }
}

/// Collect result and outputs of every job `job` needs, keyed by symbolic id.
///
/// A symbolic id backed by several jobs (a matrix) reports their aggregate
/// status and their merged outputs. Unfinished jobs contribute no outputs.
/// Needs that name no job of the run are left out.
pub fn find_task_needs<S: Store>(
    store: &S,
    job: &WorkflowRunJob,
) -> Result<BTreeMap<String, TaskNeed>, GateError> {
    if job.needs.is_empty() {
        return Ok(BTreeMap::new());
    }

    let siblings = store.find_jobs(&JobFilter::run(job.run_id))?;

    let mut by_job_id: BTreeMap<&str, Vec<&WorkflowRunJob>> = BTreeMap::new();
    for sibling in &siblings {
        by_job_id
            .entry(sibling.job_id.as_str())
            .or_default()
            .push(sibling);
    }

    let mut needs = BTreeMap::new();
    for need in &job.needs {
        let Some(same_id) = by_job_id.get(need.as_str()) else {
            continue;
        };

        let mut outputs: BTreeMap<String, String> = BTreeMap::new();
        for done in same_id.iter().filter(|j| j.status.is_done()) {
            outputs = if outputs.is_empty() {
                done.outputs.clone()
            } else {
                merge_outputs(&done.outputs, &outputs)
            };
        }

        needs.insert(
            need.clone(),
            TaskNeed {
                result: aggregate_job_status(same_id.iter().map(|j| j.status)),
                outputs,
            },
        );
    }
    Ok(needs)
}

/// Merge outputs of two jobs sharing a symbolic id.
///
/// A non-empty value from `first` wins; otherwise the value from `second` is used.
/// Output names are expected to be unique across matrix legs.
pub fn merge_outputs(
    first: &BTreeMap<String, String>,
    second: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = second.clone();
    for (key, value) in first {
        if !value.is_empty() || !merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Needs for a job that is being handed to an executor.
///
/// A lookup failure is logged and degrades to no needs: the executor then
/// fails the job visibly, whereas failing the hand-off would strand a job
/// that is already assigned.
pub fn needs_for_handoff<S: Store>(store: &S, job: &WorkflowRunJob) -> BTreeMap<String, TaskNeed> {
    match find_task_needs(store, job) {
        Ok(needs) => needs,
        Err(e) => {
            warn!(job_id = job.id, error = %e, "cannot find needs for job, going on with empty needs");
            BTreeMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn merge_prefers_non_empty_values() {
        let first = outputs(&[("a", ""), ("b", "from-first")]);
        let second = outputs(&[("a", "from-second"), ("c", "only-second")]);
        let merged = merge_outputs(&first, &second);
        assert_eq!(merged["a"], "from-second");
        assert_eq!(merged["b"], "from-first");
        assert_eq!(merged["c"], "only-second");
    }

    #[test]
    fn task_need_converts_to_expression_result() {
        let need = TaskNeed {
            result: Status::Failure,
            outputs: outputs(&[("x", "1")]),
        };
        let result = need.to_job_result();
        assert_eq!(result.result, "failure");
        assert_eq!(result.outputs["x"], "1");
    }
}
