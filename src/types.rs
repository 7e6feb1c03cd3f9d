use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Status ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Blocked,
    #[default]
    Waiting,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl Status {
    /// Terminal statuses. A done job or run never changes status again.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Cancelled | Status::Skipped
        )
    }

    /// Statuses that occupy a concurrency group.
    pub fn is_active(self) -> bool {
        matches!(self, Status::Waiting | Status::Running)
    }

    pub fn is_in(self, statuses: &[Status]) -> bool {
        statuses.contains(&self)
    }

    /// Validates whether a job may move from this status to `to`.
    ///
    /// Rules:
    /// - Blocked -> Waiting | Skipped | Cancelled
    /// - Waiting -> Running | Cancelled
    /// - Running -> Success | Failure | Cancelled
    /// - Terminal statuses never transition
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;

        matches!(
            (self, to),
            (Blocked, Waiting)
                | (Blocked, Skipped)
                | (Blocked, Cancelled)
                | (Waiting, Running)
                | (Waiting, Cancelled)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Blocked => "blocked",
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn parse_status(s: &str) -> Result<Status, String> {
    match s.to_lowercase().as_str() {
        "blocked" => Ok(Status::Blocked),
        "waiting" => Ok(Status::Waiting),
        "running" => Ok(Status::Running),
        "success" => Ok(Status::Success),
        "failure" => Ok(Status::Failure),
        "cancelled" => Ok(Status::Cancelled),
        "skipped" => Ok(Status::Skipped),
        _ => Err(format!(
            "Invalid status '{}': expected blocked, waiting, running, success, failure, cancelled, or skipped",
            s
        )),
    }
}

/// Fold job statuses into the status of the run that owns them.
///
/// Priority: all skipped -> Skipped, all success/skipped -> Success, then
/// Failure, Cancelled, Running, Waiting, Blocked. A run without jobs has
/// nothing left to do and aggregates to Success.
pub fn aggregate_job_status<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut any = false;
    let mut all_success_or_skipped = true;
    let mut all_skipped = true;
    let (mut failure, mut cancelled, mut running, mut waiting) = (false, false, false, false);

    for status in statuses {
        any = true;
        all_success_or_skipped &= matches!(status, Status::Success | Status::Skipped);
        all_skipped &= status == Status::Skipped;
        match status {
            Status::Failure => failure = true,
            Status::Cancelled => cancelled = true,
            Status::Running => running = true,
            Status::Waiting => waiting = true,
            _ => {}
        }
    }

    if !any {
        return Status::Success;
    }
    if all_skipped {
        Status::Skipped
    } else if all_success_or_skipped {
        Status::Success
    } else if failure {
        Status::Failure
    } else if cancelled {
        Status::Cancelled
    } else if running {
        Status::Running
    } else if waiting {
        Status::Waiting
    } else {
        Status::Blocked
    }
}

// --- Runs and jobs ---

/// One execution of a workflow, triggered by an event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct WorkflowRun {
    pub id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    /// `owner/name` of the repository, exposed to expressions as `github.repository`.
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default)]
    pub title: String,
    /// Per-repository sequence number, allocated at insertion.
    #[serde(default)]
    pub index: i64,
    #[serde(default)]
    pub trigger_user: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub ref_name: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub is_fork_pull_request: bool,
    #[serde(default)]
    pub need_approval: bool,
    #[serde(default)]
    pub status: Status,
    /// Evaluated run-level concurrency group; empty means unconstrained.
    #[serde(default)]
    pub concurrency_group: String,
    #[serde(default)]
    pub concurrency_cancel: bool,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<DateTime<Utc>>,
}

/// One schedulable job within a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct WorkflowRunJob {
    pub id: i64,
    pub run_id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub is_fork_pull_request: bool,
    #[serde(default)]
    pub name: String,
    /// Symbolic job id, unique within a run except for matrix expansions.
    pub job_id: String,
    /// Single-job workflow YAML with the `needs` list erased.
    #[serde(default)]
    pub workflow_payload: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runs_on: Vec<String>,
    pub status: Status,
    #[serde(default)]
    pub raw_concurrency_group: String,
    #[serde(default)]
    pub raw_concurrency_cancel: String,
    #[serde(default)]
    pub concurrency_group: String,
    #[serde(default)]
    pub concurrency_cancel: bool,
    /// Set once the raw concurrency has been evaluated; never cleared.
    #[serde(default)]
    pub concurrency_evaluated: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped: Option<DateTime<Utc>>,
}

impl WorkflowRunJob {
    pub fn has_raw_concurrency(&self) -> bool {
        !self.raw_concurrency_group.is_empty()
    }
}

// --- Operation payloads ---

/// A status report coming back from the executor side.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobReport {
    pub status: Status,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl JobReport {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            outputs: BTreeMap::new(),
        }
    }
}

/// Result of inserting a run.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InsertOutcome {
    pub run_id: i64,
    pub index: i64,
    pub status: Status,
    /// At least one job started life Waiting.
    pub has_waiting: bool,
    /// Other runs touched by a cancel-in-progress during insertion.
    pub cancelled_run_ids: Vec<i64>,
}

/// A job left Blocked because its concurrency could not be evaluated.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StuckJob {
    pub job_id: i64,
    pub reason: String,
}

/// Result of one transactional re-check.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct CheckReport {
    pub run_id: i64,
    /// Status transitions applied, keyed by job row id, across every run touched.
    pub transitions: BTreeMap<i64, Status>,
    pub stuck: Vec<StuckJob>,
    /// Runs whose jobs were cancelled by a cancel-in-progress and need their own re-check.
    pub cancelled_run_ids: Vec<i64>,
}
