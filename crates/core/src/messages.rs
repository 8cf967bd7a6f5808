//! Wire payloads exchanged with the gateway and the analysis engines.
//!
//! Every payload is JSON. Field names match what the gateway and engines
//! already send, so the artifact fields are flattened into the job and task
//! envelopes.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::{
    validate_job_id, validate_phase_plan, ArtifactRef, Job, JobStatus, PhaseOutcome, PhaseResult,
};
use crate::phase::Phase;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Inbound: job intake
// ---------------------------------------------------------------------------

/// A job submission published by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: JobId,
    #[serde(flatten)]
    pub artifact: ArtifactRef,
    /// Defaults to the full catalog when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phases: Option<Vec<String>>,
}

impl JobEnvelope {
    pub fn new(job_id: impl Into<JobId>, artifact: ArtifactRef) -> Self {
        Self {
            job_id: job_id.into(),
            artifact,
            phases: None,
        }
    }

    pub fn with_phases<I, S>(mut self, phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phases = Some(phases.into_iter().map(Into::into).collect());
        self
    }

    /// Validate the envelope and build a `Received` job from it.
    pub fn into_job(self) -> Result<Job, CoreError> {
        validate_job_id(&self.job_id)?;
        let phases = self.phases.unwrap_or_else(Phase::default_plan);
        validate_phase_plan(&phases)?;
        Ok(Job::new(self.job_id, self.artifact, phases))
    }
}

/// Request to stop a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Outbound: phase task
// ---------------------------------------------------------------------------

/// One attempt of one phase for one job. Engines dedup on
/// `(job_id, phase, attempt)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub job_id: JobId,
    pub phase: String,
    #[serde(flatten)]
    pub artifact: ArtifactRef,
    /// Results of every earlier phase, in execution order.
    pub previous_results: Vec<PhaseResult>,
    pub attempt: u32,
    pub timestamp: Timestamp,
}

impl TaskEnvelope {
    pub fn for_job(job: &Job, phase: &str, attempt: u32) -> Self {
        Self {
            job_id: job.id.clone(),
            phase: phase.to_string(),
            artifact: job.artifact.clone(),
            previous_results: job.results.clone(),
            attempt,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn dedup_key(&self) -> (&str, &str, u32) {
        (&self.job_id, &self.phase, self.attempt)
    }
}

// ---------------------------------------------------------------------------
// Inbound: phase result
// ---------------------------------------------------------------------------

/// An engine's reply for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub job_id: JobId,
    pub phase: String,
    pub outcome: PhaseOutcome,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempt the engine was answering, when it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Engine-side signal that re-running a failed phase is safe.
    #[serde(default)]
    pub retryable: bool,
}

impl ResultMessage {
    pub fn success(task: &TaskEnvelope, payload: serde_json::Value) -> Self {
        Self {
            job_id: task.job_id.clone(),
            phase: task.phase.clone(),
            outcome: PhaseOutcome::Success,
            payload,
            error: None,
            attempt: Some(task.attempt),
            retryable: false,
        }
    }

    pub fn failure(task: &TaskEnvelope, error: impl Into<String>) -> Self {
        Self {
            job_id: task.job_id.clone(),
            phase: task.phase.clone(),
            outcome: PhaseOutcome::Failure,
            payload: serde_json::Value::Null,
            error: Some(error.into()),
            attempt: Some(task.attempt),
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Convert into the recorded result for the in-flight phase.
    ///
    /// A failure without error text gets a generic detail so that `error`
    /// is always set on failures.
    pub fn into_phase_result(self, attempts: u32, duration_ms: u64) -> PhaseResult {
        match self.outcome {
            PhaseOutcome::Success => {
                PhaseResult::success(self.phase, self.payload, attempts, duration_ms)
            }
            PhaseOutcome::Failure => PhaseResult::failure(
                self.phase,
                self.error
                    .unwrap_or_else(|| "engine reported failure".to_string()),
                attempts,
                duration_ms,
            ),
            PhaseOutcome::Skipped => PhaseResult {
                attempts,
                duration_ms,
                payload: self.payload,
                ..PhaseResult::skipped(self.phase, "skipped by engine")
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound: consolidated result
// ---------------------------------------------------------------------------

/// Durable, replayable record of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub job_id: JobId,
    pub status: JobStatus,
    pub phases_completed: Vec<String>,
    pub results: Vec<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub finished_at: Option<Timestamp>,
    pub timestamp: Timestamp,
}

impl ResultEnvelope {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            phases_completed: job.phases_completed(),
            results: job.results.clone(),
            error: job.error.clone(),
            created_at: job.created_at,
            finished_at: job.finished_at,
            timestamp: chrono::Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serialize a payload for the wire.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    Ok(serde_json::to_vec(value)?)
}

/// Deserialize a payload from the wire.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CoreError> {
    Ok(serde_json::from_slice(bytes)?)
}
