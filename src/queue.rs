use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::GateError;

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// A request for this run was already pending; nothing was added.
    AlreadyQueued,
}

/// Processes a batch of re-check requests and hands back the ones that failed.
pub trait RecheckHandler: Send + Sync + 'static {
    fn process(&self, batch: Vec<i64>) -> impl Future<Output = Vec<i64>> + Send;
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<i64>,
    in_flight: usize,
    closed: bool,
}

/// Deduplicating queue of run ids awaiting a re-check.
///
/// At most one request per run is pending at a time. A run that is being
/// processed may be queued again, since its landscape may have changed
/// after processing started.
#[derive(Debug)]
pub struct RecheckQueue {
    state: Mutex<QueueState>,
    work: Notify,
    idle: Notify,
    batch_length: usize,
    retry_delay: Duration,
}

impl RecheckQueue {
    pub fn new(batch_length: usize, retry_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            work: Notify::new(),
            idle: Notify::new(),
            batch_length: batch_length.max(1),
            retry_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Critical sections never panic, so a poisoned lock still holds consistent state
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, run_id: i64) -> Result<PushOutcome, GateError> {
        let mut state = self.lock();
        if state.closed {
            return Err(GateError::QueueStopped);
        }
        if state.pending.contains(&run_id) {
            return Ok(PushOutcome::AlreadyQueued);
        }
        state.pending.push_back(run_id);
        drop(state);
        self.work.notify_one();
        Ok(PushOutcome::Queued)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Reject further pushes. Pending requests are still processed.
    pub fn close(&self) {
        self.lock().closed = true;
        self.work.notify_waiters();
    }

    fn take_batch(&self) -> Vec<i64> {
        let mut state = self.lock();
        let n = state.pending.len().min(self.batch_length);
        let batch: Vec<i64> = state.pending.drain(..n).collect();
        if !batch.is_empty() {
            state.in_flight += 1;
        }
        batch
    }

    /// Put failed requests back, unless the queue is closed.
    fn finish_batch(&self, failed: Vec<i64>) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.closed {
            if !failed.is_empty() {
                error!(?failed, "queue closed, dropping failed re-checks");
            }
        } else {
            for run_id in failed {
                if !state.pending.contains(&run_id) {
                    state.pending.push_back(run_id);
                }
            }
        }
        let idle = state.pending.is_empty() && state.in_flight == 0;
        drop(state);
        if idle {
            self.idle.notify_waiters();
        } else {
            self.work.notify_one();
        }
    }

    /// Process everything pending on the current task, including requests
    /// queued while processing. Failed requests are re-queued once the queue
    /// is otherwise empty and returned.
    pub async fn process_pending<H: RecheckHandler>(&self, handler: &H) -> Vec<i64> {
        let mut failed = Vec::new();
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }
            failed.extend(handler.process(batch).await);
            self.finish_batch(Vec::new());
        }
        if !failed.is_empty() {
            let mut state = self.lock();
            for run_id in &failed {
                if !state.pending.contains(run_id) {
                    state.pending.push_back(*run_id);
                }
            }
        }
        failed
    }

    /// Wait until nothing is pending or in flight.
    pub async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            {
                let state = self.lock();
                if state.pending.is_empty() && state.in_flight == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    async fn run_worker<H: RecheckHandler>(
        self: Arc<Self>,
        worker: usize,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) {
        debug!(worker, "re-check worker started");
        loop {
            let notified = self.work.notified();
            let batch = self.take_batch();
            if batch.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = notified => continue,
                }
            }

            let size = batch.len();
            let failed = handler.process(batch).await;
            if !failed.is_empty() {
                warn!(worker, failed = failed.len(), size, "re-checks failed, retrying after delay");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.finish_batch(failed);
                        break;
                    }
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
            self.finish_batch(failed);
        }
        debug!(worker, "re-check worker stopped");
    }
}

/// Background workers draining a [`RecheckQueue`].
pub struct QueueWorkers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl QueueWorkers {
    pub fn start<H: RecheckHandler>(queue: Arc<RecheckQueue>, handler: Arc<H>, workers: usize) -> Self {
        let cancel = CancellationToken::new();
        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(Arc::clone(&queue).run_worker(
                    worker,
                    Arc::clone(&handler),
                    cancel.clone(),
                ))
            })
            .collect();
        Self { cancel, handles }
    }

    /// Stop the workers after their current batch and wait for them to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "re-check worker panicked");
            }
        }
    }
}
