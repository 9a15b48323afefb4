use std::fmt;

use chrono::{DateTime, Utc};
use log::warn;
use sift_results::{Cancellation, RetrievalMode};

use crate::entity::Entity;
use crate::error::{JobError, JobResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Parsing,
    Running,
    /// Cancellation was requested and the server is wrapping up the results.
    Finalizing,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    fn from_dispatch_state(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Some(JobState::Queued),
            "PARSING" => Some(JobState::Parsing),
            "RUNNING" | "PAUSED" => Some(JobState::Running),
            "FINALIZING" => Some(JobState::Finalizing),
            "DONE" => Some(JobState::Done),
            "FAILED" => Some(JobState::Failed),
            _ => None,
        }
    }

    /// Whether a state observed later may replace this state.
    /// A job never returns to an earlier state once it is finalizing or terminal.
    fn accepts(self, next: JobState) -> bool {
        match self {
            JobState::Finalizing => next == JobState::Finalizing || next.is_terminal(),
            JobState::Done | JobState::Failed => next == self,
            _ => true,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Parsing => "parsing",
            JobState::Running => "running",
            JobState::Finalizing => "finalizing",
            JobState::Done => "done",
            JobState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// The locally cached view of a remote job.
///
/// The handle is updated only by the [`JobController`](crate::JobController)
/// operations that take it by mutable reference.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    id: String,
    dispatch_time: DateTime<Utc>,
    state: JobState,
    is_realtime: bool,
    progress: f64,
    /// Set once the job is finalizing or terminal. Shared with the result
    /// streams opened from this handle and its clones.
    cancellation: Cancellation,
}

impl JobHandle {
    pub(crate) fn new(id: String, dispatch_time: DateTime<Utc>, is_realtime: bool) -> Self {
        Self {
            id,
            dispatch_time,
            state: JobState::Queued,
            is_realtime,
            progress: 0.0,
            cancellation: Cancellation::new(),
        }
    }

    pub(crate) fn from_entity(id: String, entity: &Entity) -> JobResult<Self> {
        let status = JobStatus::from_entity(entity)?;
        let mut handle = Self::new(
            id,
            entity.published.unwrap_or_else(Utc::now),
            status.is_realtime.unwrap_or(false),
        );
        handle.apply(status);
        Ok(handle)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dispatch_time(&self) -> DateTime<Utc> {
        self.dispatch_time
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_realtime(&self) -> bool {
        self.is_realtime
    }

    /// The completion ratio between 0 and 1 as last reported by the server.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Checks whether results can be retrieved in the given mode.
    pub fn check_ready(&self, mode: RetrievalMode) -> JobResult<()> {
        let ready = match mode {
            RetrievalMode::Results => !self.is_realtime && self.state == JobState::Done,
            RetrievalMode::Preview | RetrievalMode::Events => matches!(
                self.state,
                JobState::Running | JobState::Finalizing | JobState::Done
            ),
        };
        if ready {
            Ok(())
        } else if self.is_realtime && mode == RetrievalMode::Results {
            Err(JobError::not_ready(format!(
                "{mode} are not available for realtime job {}",
                self.id
            )))
        } else {
            Err(JobError::not_ready(format!(
                "{mode} are not available for job {} in state {}",
                self.id, self.state
            )))
        }
    }

    pub(crate) fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
        if state == JobState::Finalizing || state.is_terminal() {
            self.cancellation.cancel();
        }
    }

    pub(crate) fn apply(&mut self, status: JobStatus) {
        if self.state.accepts(status.state) {
            self.set_state(status.state);
        } else {
            warn!(
                "ignoring state {} reported for job {} in state {}",
                status.state, self.id, self.state
            );
        }
        if let Some(realtime) = status.is_realtime {
            self.is_realtime = realtime;
        }
        if let Some(progress) = status.progress {
            self.progress = progress;
        }
    }
}

/// The job status reported by the server, normalized from the entity attributes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct JobStatus {
    pub state: JobState,
    pub is_realtime: Option<bool>,
    pub progress: Option<f64>,
}

impl JobStatus {
    pub fn from_entity(entity: &Entity) -> JobResult<Self> {
        let dispatch_state = entity.attribute("dispatchState");
        let state = if entity.flag("isFailed")? == Some(true) {
            JobState::Failed
        } else if entity.flag("isDone")? == Some(true) {
            JobState::Done
        } else {
            let state = match dispatch_state {
                Some(value) => JobState::from_dispatch_state(value).ok_or_else(|| {
                    JobError::malformed(format!("unknown dispatch state: {value}"))
                })?,
                None => JobState::Queued,
            };
            if entity.flag("isFinalized")? == Some(true) && !state.is_terminal() {
                JobState::Finalizing
            } else {
                state
            }
        };
        let progress = entity
            .attribute("doneProgress")
            .map(|x| {
                x.trim()
                    .parse::<f64>()
                    .map_err(|_| JobError::malformed(format!("invalid progress: {x}")))
            })
            .transpose()?
            .map(|x| x.clamp(0.0, 1.0));
        Ok(Self {
            state,
            is_realtime: entity.flag("isRealTimeSearch")?,
            progress,
        })
    }
}
