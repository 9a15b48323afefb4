use std::fmt;

use crate::record::ResultBatch;

/// How the results of a job are retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrievalMode {
    /// The stable result set of a completed job.
    Results,
    /// Snapshots of the result set while the job is running.
    Preview,
    /// The raw events as the job produces them.
    Events,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePolicy {
    /// Whether non-final batches are delivered to subscribers.
    pub delivers_preview: bool,
    /// Whether the records of non-final batches appear in the record sequence.
    pub sequence_includes_preview: bool,
}

impl RetrievalMode {
    pub fn policy(self) -> ModePolicy {
        match self {
            RetrievalMode::Results => ModePolicy {
                delivers_preview: false,
                sequence_includes_preview: false,
            },
            RetrievalMode::Preview => ModePolicy {
                delivers_preview: true,
                sequence_includes_preview: false,
            },
            RetrievalMode::Events => ModePolicy {
                delivers_preview: true,
                sequence_includes_preview: true,
            },
        }
    }

    pub(crate) fn delivers(self, batch: &ResultBatch) -> bool {
        batch.is_final || self.policy().delivers_preview
    }

    pub(crate) fn yields_records(self, batch: &ResultBatch) -> bool {
        batch.is_final || self.policy().sequence_includes_preview
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalMode::Results => write!(f, "results"),
            RetrievalMode::Preview => write!(f, "preview"),
            RetrievalMode::Events => write!(f, "events"),
        }
    }
}
