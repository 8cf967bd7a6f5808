//! Job, phase result and status types, plus intake validation.
//!
//! A [`Job`] is the authoritative workflow state for one artifact. The
//! planner's registry owns every live job and only mutates it through a
//! checked transition, which calls [`Job::check_invariants`] before
//! committing.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::progress::progress_fraction;
use crate::types::{JobId, Timestamp};

/// Maximum length of a job id. Ids become topic tokens.
const MAX_JOB_ID_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Status / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Received,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Received => "received",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Success,
    Failure,
    Skipped,
}

// ---------------------------------------------------------------------------
// ArtifactRef
// ---------------------------------------------------------------------------

/// The contract under analysis, forwarded verbatim to every engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    #[serde(default)]
    pub contract_id: Option<String>,
    #[serde(default)]
    pub contract_name: Option<String>,
    #[serde(default)]
    pub source_code: Option<String>,
    #[serde(default)]
    pub compiler_version: Option<String>,
}

// ---------------------------------------------------------------------------
// PhaseResult
// ---------------------------------------------------------------------------

/// Recorded outcome of one phase of one job. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: String,
    pub outcome: PhaseOutcome,
    /// Engine output, consumed verbatim by later phases and the final report.
    pub payload: serde_json::Value,
    /// Set iff `outcome == Failure`.
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub completed_at: Timestamp,
}

impl PhaseResult {
    pub fn success(
        phase: impl Into<String>,
        payload: serde_json::Value,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            phase: phase.into(),
            outcome: PhaseOutcome::Success,
            payload,
            error: None,
            attempts,
            duration_ms,
            completed_at: chrono::Utc::now(),
        }
    }

    pub fn failure(
        phase: impl Into<String>,
        error: impl Into<String>,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            phase: phase.into(),
            outcome: PhaseOutcome::Failure,
            payload: serde_json::Value::Null,
            error: Some(error.into()),
            attempts,
            duration_ms,
            completed_at: chrono::Utc::now(),
        }
    }

    /// A phase that was never dispatched. The reason travels in the payload
    /// so that `error` stays reserved for failures.
    pub fn skipped(phase: impl Into<String>, reason: &str) -> Self {
        Self {
            phase: phase.into(),
            outcome: PhaseOutcome::Skipped,
            payload: serde_json::json!({ "status": "skipped", "reason": reason }),
            error: None,
            attempts: 0,
            duration_ms: 0,
            completed_at: chrono::Utc::now(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == PhaseOutcome::Failure
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Workflow state of one analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub artifact: ArtifactRef,
    /// Ordered phase names. Validated non-empty and duplicate-free at intake.
    pub phases: Vec<String>,
    pub status: JobStatus,
    pub current_phase: Option<String>,
    /// Attempt number of the in-flight dispatch; 0 when nothing is in flight.
    pub attempt: u32,
    /// Recorded results in execution order.
    pub results: Vec<PhaseResult>,
    /// Root cause of a failed job.
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// When the first attempt of `current_phase` was dispatched.
    pub phase_started_at: Option<Timestamp>,
    /// Set iff the job is Completed or Failed.
    pub finished_at: Option<Timestamp>,
}

impl Job {
    /// Create a job in `Received` state.
    pub fn new(id: impl Into<JobId>, artifact: ArtifactRef, phases: Vec<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            artifact,
            phases,
            status: JobStatus::Received,
            current_phase: None,
            attempt: 0,
            results: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            phase_started_at: None,
            finished_at: None,
        }
    }

    pub fn result(&self, phase: &str) -> Option<&PhaseResult> {
        self.results.iter().find(|r| r.phase == phase)
    }

    pub fn total_phases(&self) -> usize {
        self.phases.len()
    }

    /// Phases that finished without failing (success or skipped).
    pub fn completed_phases(&self) -> usize {
        self.results.iter().filter(|r| !r.is_failure()).count()
    }

    /// Progress fraction at phase granularity.
    pub fn progress(&self) -> f64 {
        progress_fraction(self.completed_phases(), self.total_phases())
    }

    /// The phase that would run after the recorded results, if any.
    pub fn next_phase(&self) -> Option<&str> {
        self.phases.get(self.results.len()).map(String::as_str)
    }

    /// Whether `phase` is the job's single in-flight phase.
    pub fn is_in_flight(&self, phase: &str) -> bool {
        self.status == JobStatus::Running && self.current_phase.as_deref() == Some(phase)
    }

    /// Names of the phases with a recorded result, in execution order.
    pub fn phases_completed(&self) -> Vec<String> {
        self.results.iter().map(|r| r.phase.clone()).collect()
    }

    /// Verify the status invariants.
    ///
    /// - `Running` iff `current_phase` is set, listed in `phases` and has no
    ///   recorded result.
    /// - `Completed`/`Failed` iff `finished_at` is set.
    /// - Results never exceed the phase list and follow its order.
    pub fn check_invariants(&self) -> Result<(), String> {
        let in_flight_ok = match self.current_phase.as_deref() {
            Some(phase) => self.phases.iter().any(|p| p == phase) && self.result(phase).is_none(),
            None => false,
        };
        if (self.status == JobStatus::Running) != in_flight_ok {
            return Err(format!(
                "status {} inconsistent with current phase {:?}",
                self.status.as_str(),
                self.current_phase
            ));
        }

        let finished = matches!(self.status, JobStatus::Completed | JobStatus::Failed);
        if finished != self.finished_at.is_some() {
            return Err(format!(
                "status {} inconsistent with terminal timestamp",
                self.status.as_str()
            ));
        }

        if self.results.len() > self.phases.len() {
            return Err("more results than phases".to_string());
        }
        for (result, phase) in self.results.iter().zip(&self.phases) {
            if &result.phase != phase {
                return Err(format!(
                    "result for {} recorded out of order (expected {phase})",
                    result.phase
                ));
            }
        }

        if self.status == JobStatus::Completed && self.results.len() != self.phases.len() {
            return Err("completed with phases outstanding".to_string());
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a caller-supplied job id.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_JOB_ID_LEN` characters.
/// - Must contain only alphanumeric, hyphen or underscore characters.
pub fn validate_job_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation("Job id must not be empty".to_string()));
    }
    if id.len() > MAX_JOB_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Job id must not exceed {MAX_JOB_ID_LEN} characters"
        )));
    }
    if !id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(CoreError::Validation(
            "Job id may only contain alphanumeric, hyphen, or underscore characters".to_string(),
        ));
    }
    Ok(())
}

/// Validate a job's phase plan.
///
/// Rules:
/// - At least one phase.
/// - No empty names.
/// - No duplicates. Results are keyed by phase name, so a repeated phase
///   could never be told apart from its earlier run.
pub fn validate_phase_plan(phases: &[String]) -> Result<(), CoreError> {
    if phases.is_empty() {
        return Err(CoreError::Validation(
            "Phase list must not be empty".to_string(),
        ));
    }

    let mut seen = HashSet::with_capacity(phases.len());
    for (i, phase) in phases.iter().enumerate() {
        if phase.is_empty() {
            return Err(CoreError::Validation(format!(
                "Phase at index {i} must not be empty"
            )));
        }
        if !seen.insert(phase.as_str()) {
            return Err(CoreError::Validation(format!(
                "Duplicate phase: \"{phase}\""
            )));
        }
    }

    Ok(())
}
