use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::GateConfig;
use crate::coordinator::{spawn_coordinator, CoordinatorHandle};
use crate::emitter::{emit_jobs_if_ready, JobEmitter};
use crate::error::GateError;
use crate::expression::ConcurrencyEvaluator;
use crate::needs::TaskNeed;
use crate::queue::{QueueWorkers, RecheckQueue};
use crate::store::Store;
use crate::types::{InsertOutcome, JobReport, Status, WorkflowRun, WorkflowRunJob};
use crate::workflow::{parse_workflow, SingleWorkflow};

/// Entry point wiring the coordinator, the re-check queue and its workers.
///
/// Every operation that may free a concurrency group or a needs chain queues
/// a re-check for the affected run.
pub struct Scheduler<S> {
    coordinator: CoordinatorHandle,
    coordinator_task: JoinHandle<S>,
    queue: Arc<RecheckQueue>,
    emitter: Arc<JobEmitter>,
    workers: Option<QueueWorkers>,
}

impl<S: Store> Scheduler<S> {
    /// Wire everything and start background workers draining the queue.
    pub fn start<E: ConcurrencyEvaluator>(store: S, evaluator: E, config: &GateConfig) -> Self {
        let mut scheduler = Self::manual(store, evaluator, config);
        scheduler.workers = Some(QueueWorkers::start(
            Arc::clone(&scheduler.queue),
            Arc::clone(&scheduler.emitter),
            config.queue.workers,
        ));
        info!(workers = config.queue.workers, "scheduler started");
        scheduler
    }

    /// Wire everything without workers; re-checks run on [`Scheduler::process_pending`].
    pub fn manual<E: ConcurrencyEvaluator>(store: S, evaluator: E, config: &GateConfig) -> Self {
        let (coordinator, coordinator_task) = spawn_coordinator(
            store,
            evaluator,
            config.coordinator.channel_capacity,
            config.limits.max_name_len,
        );
        let queue = Arc::new(RecheckQueue::new(
            config.queue.batch_length,
            config.queue.retry_delay(),
        ));
        let emitter = Arc::new(JobEmitter::new(coordinator.clone(), Arc::clone(&queue)));
        Self {
            coordinator,
            coordinator_task,
            queue,
            emitter,
            workers: None,
        }
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn queue(&self) -> &RecheckQueue {
        &self.queue
    }

    /// Insert a run made of single-job workflows.
    pub async fn submit(
        &self,
        run: WorkflowRun,
        workflows: Vec<SingleWorkflow>,
    ) -> Result<InsertOutcome, GateError> {
        let outcome = self.coordinator.insert_run(run, workflows).await?;
        for cancelled in &outcome.cancelled_run_ids {
            self.emit(*cancelled)?;
        }
        if outcome.status == Status::Blocked {
            self.emit(outcome.run_id)?;
        }
        Ok(outcome)
    }

    /// Insert a run from a full workflow file.
    pub async fn submit_workflow(
        &self,
        run: WorkflowRun,
        content: &str,
    ) -> Result<InsertOutcome, GateError> {
        let workflows = parse_workflow(content)
            .map_err(|message| GateError::DefinitionParse { job_id: 0, message })?;
        self.submit(run, workflows).await
    }

    /// Record an executor report; a finished job triggers a re-check of its run.
    pub async fn report(&self, job_id: i64, report: JobReport) -> Result<(), GateError> {
        let done = report.status.is_done();
        let run_id = self.coordinator.report_job(job_id, report).await?;
        if done {
            self.emit(run_id)?;
        }
        Ok(())
    }

    pub async fn approve(&self, run_id: i64) -> Result<(), GateError> {
        self.coordinator.approve_run(run_id).await?;
        self.emit(run_id)
    }

    pub async fn cancel(&self, run_id: i64) -> Result<Status, GateError> {
        let status = self.coordinator.cancel_run(run_id).await?;
        self.emit(run_id)?;
        Ok(status)
    }

    /// Needs handed to an executor picking up `job_id`.
    pub async fn task_needs(&self, job_id: i64) -> Result<BTreeMap<String, TaskNeed>, GateError> {
        self.coordinator.task_needs(job_id).await
    }

    pub async fn run(&self, run_id: i64) -> Result<WorkflowRun, GateError> {
        self.coordinator.get_run(run_id).await
    }

    pub async fn jobs(&self, run_id: i64) -> Result<Vec<WorkflowRunJob>, GateError> {
        self.coordinator.get_run_jobs(run_id).await
    }

    pub fn emit(&self, run_id: i64) -> Result<(), GateError> {
        emit_jobs_if_ready(&self.queue, run_id)
    }

    /// Drain the queue on the calling task. Returns the requests that failed.
    pub async fn process_pending(&self) -> Vec<i64> {
        self.queue.process_pending(self.emitter.as_ref()).await
    }

    /// Stop accepting re-checks, finish pending ones, stop the workers and
    /// the coordinator, and return the store.
    pub async fn shutdown(self) -> Result<S, GateError> {
        let Self {
            coordinator,
            coordinator_task,
            queue,
            emitter,
            workers,
        } = self;

        queue.close();
        match workers {
            Some(workers) => {
                queue.drained().await;
                workers.stop().await;
            }
            None => {
                let failed = queue.process_pending(emitter.as_ref()).await;
                if !failed.is_empty() {
                    debug!(?failed, "re-checks left unprocessed at shutdown");
                }
            }
        }

        drop(emitter);
        drop(coordinator);
        let store = coordinator_task
            .await
            .map_err(|_| GateError::CoordinatorShutdown)?;
        info!("scheduler stopped");
        Ok(store)
    }
}
