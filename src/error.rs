use crate::types::Status;

/// Coarse classification of [`GateError`], checked instead of matching on variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store trouble; the re-check is retried.
    Transient,
    /// Optimistic update lost to a concurrent writer.
    Conflict,
    /// Serialized job definition could not be read.
    Definition,
    NotFound,
    Shutdown,
    Invalid,
}

/// Error enum for the scheduling core.
///
/// Categories:
/// - Transient: store failures, retried by the re-check queue
/// - Conflict: a conditional update matched no row, aborts the transaction
/// - Definition: logged, the job stays Blocked
/// - NotFound / Invalid: caller mistakes
/// - Shutdown: coordinator or queue already stopped
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Run {0} not found")]
    RunNotFound(i64),

    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("No row affected updating job {job_id}: expected status {expected}")]
    StatusConflict { job_id: i64, expected: Status },

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition { job_id: i64, from: Status, to: Status },

    #[error("Cannot read definition of job {job_id}: {message}")]
    DefinitionParse { job_id: i64, message: String },

    #[error("Coordinator shut down")]
    CoordinatorShutdown,

    #[error("Re-check queue stopped")]
    QueueStopped,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Scenario error: {0}")]
    Scenario(String),
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::Store(_) => ErrorKind::Transient,
            GateError::StatusConflict { .. } => ErrorKind::Conflict,
            GateError::DefinitionParse { .. } => ErrorKind::Definition,
            GateError::RunNotFound(_) | GateError::JobNotFound(_) => ErrorKind::NotFound,
            GateError::CoordinatorShutdown | GateError::QueueStopped => ErrorKind::Shutdown,
            GateError::InvalidTransition { .. } | GateError::Config(_) | GateError::Scenario(_) => {
                ErrorKind::Invalid
            }
        }
    }

    /// Returns true if the failed operation is worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Conflict)
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}
