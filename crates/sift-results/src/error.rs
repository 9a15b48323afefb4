use std::sync::PoisonError;

use thiserror::Error;

use crate::source::TransportError;

pub type ResultsResult<T> = Result<T, ResultsError>;

#[derive(Debug, Clone, Error)]
pub enum ResultsError {
    /// The input is corrupt at the given byte offset of the stream.
    #[error("malformed record at byte {offset}: {message}")]
    Malformed { offset: u64, message: String },
    #[error("incomplete stream: {0}")]
    IncompleteStream(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ResultsError {
    pub fn malformed(offset: u64, message: impl Into<String>) -> Self {
        ResultsError::Malformed {
            offset,
            message: message.into(),
        }
    }

    pub fn incomplete(message: impl Into<String>) -> Self {
        ResultsError::IncompleteStream(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ResultsError::InternalError(message.into())
    }
}

impl<T> From<PoisonError<T>> for ResultsError {
    fn from(error: PoisonError<T>) -> Self {
        ResultsError::InternalError(error.to_string())
    }
}
