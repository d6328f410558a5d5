use thiserror::Error;

/// Result type for correlator operations
pub type CorrelatorResult<T> = Result<T, CorrelatorError>;

/// Error taxonomy for the correlation layer
#[derive(Error, Debug, Clone)]
pub enum CorrelatorError {
    /// Malformed caller input - fails fast, no side effects
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Pause/resume on a job type with no registered handle
    #[error("No queue registered for job type: {0}")]
    NotRegistered(String),

    /// Substrate rejected the enqueue - pending record rolled back
    #[error("Submission rejected: {0}")]
    Submission(String),

    /// No observed lifecycle event before the caller's deadline
    #[error("job-waiting-timeout (id: {job_id})")]
    WaitingTimeout { job_id: String },

    /// Substrate-reported job failure, original error payload unwrapped
    #[error("{0}")]
    JobFailed(String),

    /// Out-of-band channel error, not tied to any pending job
    #[error("Substrate error: {0}")]
    Substrate(String),
}
