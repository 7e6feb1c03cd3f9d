use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::GateConfig;
use crate::error::GateError;
use crate::expression::TemplateEvaluator;
use crate::memory::MemoryStore;
use crate::scheduler::Scheduler;
use crate::types::{parse_status, JobReport, Status, WorkflowRun};

// --- Scenario file ---

/// A replayable sequence of submissions and executor reports.
///
/// ```toml
/// [[runs]]
/// name = "first"
/// repo_id = 1
/// workflow = """
/// jobs:
///   build: { runs-on: ubuntu-latest }
/// """
///
/// [[steps]]
/// action = "submit"
/// run = "first"
///
/// [[steps]]
/// action = "report"
/// run = "first"
/// job = "build"
/// status = "success"
/// ```
///
/// Without steps every run is submitted in file order.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Scenario {
    pub variables: Vec<VariableDef>,
    pub runs: Vec<RunDef>,
    pub steps: Vec<Step>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct VariableDef {
    pub owner_id: i64,
    /// Repository scope; owner scope when absent.
    #[serde(default)]
    pub repo_id: Option<i64>,
    pub name: String,
    pub value: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RunDef {
    pub name: String,
    pub repo_id: i64,
    #[serde(default = "default_owner")]
    pub owner_id: i64,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_event")]
    pub event: String,
    #[serde(default = "default_ref")]
    pub ref_name: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub trigger_user: String,
    #[serde(default)]
    pub need_approval: bool,
    #[serde(default)]
    pub concurrency_group: String,
    #[serde(default)]
    pub concurrency_cancel: bool,
    pub workflow: String,
}

fn default_owner() -> i64 {
    1
}

fn default_event() -> String {
    "push".to_string()
}

fn default_ref() -> String {
    "refs/heads/main".to_string()
}

#[derive(Deserialize, Clone, Debug)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Submit {
        run: String,
    },
    /// Report a job by symbolic id or display name. A Waiting job reported
    /// as finished is moved to Running first.
    Report {
        run: String,
        job: String,
        status: String,
        #[serde(default)]
        outputs: BTreeMap<String, String>,
    },
    Approve {
        run: String,
    },
    Cancel {
        run: String,
    },
}

impl RunDef {
    fn to_run(&self) -> WorkflowRun {
        WorkflowRun {
            repo_id: self.repo_id,
            owner_id: self.owner_id,
            repository: self.repository.clone(),
            workflow_id: format!("{}.yml", self.name),
            title: if self.title.is_empty() {
                self.name.clone()
            } else {
                self.title.clone()
            },
            trigger_user: self.trigger_user.clone(),
            event: self.event.clone(),
            ref_name: self.ref_name.clone(),
            commit_sha: self.commit_sha.clone(),
            need_approval: self.need_approval,
            concurrency_group: self.concurrency_group.clone(),
            concurrency_cancel: self.concurrency_cancel,
            ..Default::default()
        }
    }
}

pub fn load_scenario(path: &Path) -> Result<Scenario, GateError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| GateError::Scenario(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&contents)
        .map_err(|e| GateError::Scenario(format!("Failed to parse {}: {}", path.display(), e)))
}

// --- Output ---

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub runs: Vec<RunSummary>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub name: String,
    pub id: i64,
    pub index: i64,
    pub status: Status,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub concurrency_group: String,
    pub jobs: Vec<JobSummary>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub id: i64,
    pub job_id: String,
    pub name: String,
    pub status: Status,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub concurrency_group: String,
}

// --- Replay ---

/// Replay `scenario` against an in-memory store and summarize the final state.
///
/// Re-checks are drained after every step, so the outcome is deterministic.
pub async fn simulate(scenario: &Scenario, config: &GateConfig) -> Result<SimulationReport, GateError> {
    let mut store = MemoryStore::new();
    for var in &scenario.variables {
        match var.repo_id {
            Some(repo_id) => store.set_repo_variable(repo_id, &var.name, &var.value),
            None => store.set_owner_variable(var.owner_id, &var.name, &var.value),
        }
    }

    let scheduler = Scheduler::manual(store, TemplateEvaluator, config);
    let mut run_ids: BTreeMap<String, i64> = BTreeMap::new();

    let steps = if scenario.steps.is_empty() {
        scenario
            .runs
            .iter()
            .map(|r| Step::Submit { run: r.name.clone() })
            .collect()
    } else {
        scenario.steps.clone()
    };

    for step in &steps {
        apply_step(&scheduler, scenario, &mut run_ids, step).await?;
        let failed = scheduler.process_pending().await;
        if !failed.is_empty() {
            return Err(GateError::Scenario(format!("re-checks failed for runs {:?}", failed)));
        }
    }

    let mut runs = Vec::with_capacity(run_ids.len());
    for def in &scenario.runs {
        let Some(run_id) = run_ids.get(&def.name) else {
            continue;
        };
        let run = scheduler.run(*run_id).await?;
        let jobs = scheduler
            .jobs(*run_id)
            .await?
            .into_iter()
            .map(|j| JobSummary {
                id: j.id,
                job_id: j.job_id,
                name: j.name,
                status: j.status,
                concurrency_group: j.concurrency_group,
            })
            .collect();
        runs.push(RunSummary {
            name: def.name.clone(),
            id: run.id,
            index: run.index,
            status: run.status,
            concurrency_group: run.concurrency_group,
            jobs,
        });
    }

    scheduler.shutdown().await?;
    Ok(SimulationReport { runs })
}

async fn apply_step(
    scheduler: &Scheduler<MemoryStore>,
    scenario: &Scenario,
    run_ids: &mut BTreeMap<String, i64>,
    step: &Step,
) -> Result<(), GateError> {
    match step {
        Step::Submit { run } => {
            let def = scenario
                .runs
                .iter()
                .find(|r| &r.name == run)
                .ok_or_else(|| GateError::Scenario(format!("unknown run '{}'", run)))?;
            let outcome = scheduler.submit_workflow(def.to_run(), &def.workflow).await?;
            info!(run = %run, run_id = outcome.run_id, status = %outcome.status, "scenario run submitted");
            run_ids.insert(run.clone(), outcome.run_id);
        }
        Step::Report {
            run,
            job,
            status,
            outputs,
        } => {
            let run_id = lookup(run_ids, run)?;
            let status = parse_status(status).map_err(GateError::Scenario)?;
            let target = scheduler
                .jobs(run_id)
                .await?
                .into_iter()
                .find(|j| (&j.job_id == job || &j.name == job) && !j.status.is_done())
                .ok_or_else(|| {
                    GateError::Scenario(format!("no unfinished job '{}' in run '{}'", job, run))
                })?;

            if target.status == Status::Waiting && matches!(status, Status::Success | Status::Failure) {
                scheduler.report(target.id, JobReport::status(Status::Running)).await?;
            }
            let report = JobReport {
                status,
                outputs: outputs.clone(),
            };
            scheduler.report(target.id, report).await?;
        }
        Step::Approve { run } => scheduler.approve(lookup(run_ids, run)?).await?,
        Step::Cancel { run } => {
            scheduler.cancel(lookup(run_ids, run)?).await?;
        }
    }
    Ok(())
}

fn lookup(run_ids: &BTreeMap<String, i64>, name: &str) -> Result<i64, GateError> {
    run_ids
        .get(name)
        .copied()
        .ok_or_else(|| GateError::Scenario(format!("run '{}' has not been submitted", name)))
}
