use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::emitter::check_jobs_by_run_id;
use crate::error::GateError;
use crate::expression::ConcurrencyEvaluator;
use crate::filter::JobFilter;
use crate::needs::{needs_for_handoff, TaskNeed};
use crate::run;
use crate::store::Store;
use crate::types::{CheckReport, InsertOutcome, JobReport, Status, WorkflowRun, WorkflowRunJob};
use crate::workflow::SingleWorkflow;

// --- Command enum ---

pub enum CoordinatorCommand {
    InsertRun {
        run: Box<WorkflowRun>,
        workflows: Vec<SingleWorkflow>,
        reply: oneshot::Sender<Result<InsertOutcome, GateError>>,
    },
    CheckRun {
        run_id: i64,
        reply: oneshot::Sender<Result<CheckReport, GateError>>,
    },
    ReportJob {
        job_id: i64,
        report: JobReport,
        reply: oneshot::Sender<Result<i64, GateError>>,
    },
    ApproveRun {
        run_id: i64,
        reply: oneshot::Sender<Result<(), GateError>>,
    },
    CancelRun {
        run_id: i64,
        reply: oneshot::Sender<Result<Status, GateError>>,
    },
    GetRun {
        run_id: i64,
        reply: oneshot::Sender<Result<WorkflowRun, GateError>>,
    },
    GetRunJobs {
        run_id: i64,
        reply: oneshot::Sender<Result<Vec<WorkflowRunJob>, GateError>>,
    },
    TaskNeeds {
        job_id: i64,
        reply: oneshot::Sender<Result<BTreeMap<String, TaskNeed>, GateError>>,
    },
}

// --- CoordinatorHandle ---

/// Cloneable handle to the task that owns the store.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    async fn send_command<T>(
        &self,
        command: CoordinatorCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, GateError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| GateError::CoordinatorShutdown)?;
        rx.await.map_err(|_| GateError::CoordinatorShutdown)
    }

    pub async fn insert_run(
        &self,
        run: WorkflowRun,
        workflows: Vec<SingleWorkflow>,
    ) -> Result<InsertOutcome, GateError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::InsertRun {
                run: Box::new(run),
                workflows,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn check_run(&self, run_id: i64) -> Result<CheckReport, GateError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::CheckRun { run_id, reply }, rx)
            .await?
    }

    /// Apply an executor status report. Returns the run the job belongs to.
    pub async fn report_job(&self, job_id: i64, report: JobReport) -> Result<i64, GateError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::ReportJob {
                job_id,
                report,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn approve_run(&self, run_id: i64) -> Result<(), GateError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::ApproveRun { run_id, reply }, rx)
            .await?
    }

    pub async fn cancel_run(&self, run_id: i64) -> Result<Status, GateError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::CancelRun { run_id, reply }, rx)
            .await?
    }

    pub async fn get_run(&self, run_id: i64) -> Result<WorkflowRun, GateError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::GetRun { run_id, reply }, rx)
            .await?
    }

    pub async fn get_run_jobs(&self, run_id: i64) -> Result<Vec<WorkflowRunJob>, GateError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::GetRunJobs { run_id, reply }, rx)
            .await?
    }

    pub async fn task_needs(&self, job_id: i64) -> Result<BTreeMap<String, TaskNeed>, GateError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::TaskNeeds { job_id, reply }, rx)
            .await?
    }
}

// --- Coordinator state ---

pub const CHANNEL_CAPACITY: usize = 32;

struct CoordinatorState<S, E> {
    store: S,
    evaluator: E,
    max_name_len: usize,
}

fn handle_task_needs<S: Store>(
    store: &S,
    job_id: i64,
) -> Result<BTreeMap<String, TaskNeed>, GateError> {
    let job = store.get_job(job_id)?;
    Ok(needs_for_handoff(store, &job))
}

fn log_failure<T>(command: &str, result: &Result<T, GateError>) {
    if let Err(e) = result {
        if e.is_retryable() {
            error!(command, error = %e, "coordinator command failed");
        } else {
            debug!(command, error = %e, "coordinator command rejected");
        }
    }
}

// --- Coordinator task ---

async fn run_coordinator<S, E>(
    mut rx: mpsc::Receiver<CoordinatorCommand>,
    store: S,
    evaluator: E,
    max_name_len: usize,
) -> S
where
    S: Store,
    E: ConcurrencyEvaluator,
{
    let mut state = CoordinatorState {
        store,
        evaluator,
        max_name_len,
    };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            CoordinatorCommand::InsertRun {
                run,
                workflows,
                reply,
            } => {
                let result = run::insert_run(
                    &mut state.store,
                    &state.evaluator,
                    state.max_name_len,
                    *run,
                    workflows,
                );
                log_failure("insert_run", &result);
                let _ = reply.send(result);
            }
            CoordinatorCommand::CheckRun { run_id, reply } => {
                let result = check_jobs_by_run_id(&mut state.store, &state.evaluator, run_id);
                log_failure("check_run", &result);
                let _ = reply.send(result);
            }
            CoordinatorCommand::ReportJob {
                job_id,
                report,
                reply,
            } => {
                let result = run::report_job_status(&mut state.store, job_id, &report);
                log_failure("report_job", &result);
                let _ = reply.send(result);
            }
            CoordinatorCommand::ApproveRun { run_id, reply } => {
                let result = run::approve_run(&mut state.store, run_id);
                log_failure("approve_run", &result);
                let _ = reply.send(result);
            }
            CoordinatorCommand::CancelRun { run_id, reply } => {
                let result = run::cancel_run(&mut state.store, run_id);
                log_failure("cancel_run", &result);
                let _ = reply.send(result);
            }
            CoordinatorCommand::GetRun { run_id, reply } => {
                let _ = reply.send(state.store.get_run(run_id));
            }
            CoordinatorCommand::GetRunJobs { run_id, reply } => {
                let _ = reply.send(state.store.find_jobs(&JobFilter::run(run_id)));
            }
            CoordinatorCommand::TaskNeeds { job_id, reply } => {
                let _ = reply.send(handle_task_needs(&state.store, job_id));
            }
        }
    }

    debug!("coordinator stopped, all handles dropped");
    state.store
}

// --- Spawn ---

/// Spawn the task owning `store`. It exits once every handle is dropped and
/// hands the store back through the join handle.
pub fn spawn_coordinator<S, E>(
    store: S,
    evaluator: E,
    channel_capacity: usize,
    max_name_len: usize,
) -> (CoordinatorHandle, tokio::task::JoinHandle<S>)
where
    S: Store,
    E: ConcurrencyEvaluator,
{
    let (tx, rx) = mpsc::channel(channel_capacity.max(1));
    let task_handle = tokio::spawn(run_coordinator(rx, store, evaluator, max_name_len));
    (CoordinatorHandle { sender: tx }, task_handle)
}
