use sift_results::error::ResultsError;
use sift_results::TransportError;
use thiserror::Error;

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The server refused to create the job, e.g. because of a syntax error.
    #[error("dispatch rejected: {}", .0.join("; "))]
    DispatchRejected(Vec<String>),
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("request failed with status {status}: {}", messages.join("; "))]
    RequestFailed { status: u16, messages: Vec<String> },
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Results(#[from] ResultsError),
}

impl JobError {
    pub fn malformed(message: impl Into<String>) -> Self {
        JobError::MalformedResponse(message.into())
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        JobError::NotReady(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        JobError::InvalidArgument(message.into())
    }
}
