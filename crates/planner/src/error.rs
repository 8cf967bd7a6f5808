use rukh_channel::ChannelError;
use rukh_core::error::CoreError;
use rukh_core::types::JobId;

use crate::config::ConfigError;

/// Registry-level guards. None of these corrupt job state: a rejected
/// mutation is never committed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Job {0} already exists")]
    DuplicateJob(JobId),

    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Invalid transition for job {job_id}: {reason}")]
    InvalidTransition { job_id: JobId, reason: String },
}

/// Errors surfaced by the planner service.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] ChannelError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PlannerError {
    /// Whether the inbound message that caused this error should be nacked
    /// for redelivery. Malformed or invalid payloads are acked and dropped:
    /// redelivering them cannot succeed.
    pub fn should_redeliver(&self) -> bool {
        matches!(self, PlannerError::Registry(_) | PlannerError::Transport(_))
    }
}
