//! Per-job phase state machine.
//!
//! `Received -> Running(p0) -> Running(p1) -> ... -> Completed`, with any
//! non-terminal state able to move to `Cancelled` and any `Running` state to
//! `Failed`. Every function here is a mutator meant to run inside
//! [`JobGuard::apply`](crate::registry::JobGuard::apply): it edits a draft
//! and reports what the caller must do next as a [`Transition`].

use rukh_core::job::{Job, JobStatus, PhaseResult};
use rukh_core::phase::Phase;

use crate::error::RegistryError;

/// Reason recorded on phases whose name is outside the catalog.
pub const UNKNOWN_PHASE_REASON: &str = "unknown phase";

/// What a committed transition asks of the planner.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Publish the task for `phase` and arm its deadline.
    Dispatch { phase: Phase, attempt: u32 },
    Completed,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub step: Step,
    /// `completed / total` after the transition.
    pub progress: f64,
    /// Unknown phases recorded as skipped on the way to `step`.
    pub skipped: Vec<String>,
}

impl Transition {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.step, Step::Dispatch { .. })
    }
}

fn invalid(job: &Job, reason: impl Into<String>) -> RegistryError {
    RegistryError::InvalidTransition {
        job_id: job.id.clone(),
        reason: reason.into(),
    }
}

/// Move a freshly registered job onto its first phase.
pub fn start(job: &mut Job) -> Result<Transition, RegistryError> {
    if job.status != JobStatus::Received {
        return Err(invalid(
            job,
            format!("cannot start a job in state {}", job.status.as_str()),
        ));
    }
    Ok(advance(job))
}

/// Record the outcome of the in-flight phase and move on.
///
/// Success and skipped outcomes advance to the next phase (or complete the
/// job); a failure ends the job with the result's error as root cause.
pub fn record_result(job: &mut Job, result: PhaseResult) -> Result<Transition, RegistryError> {
    if !job.is_in_flight(&result.phase) {
        return Err(invalid(
            job,
            format!("phase {} is not in flight", result.phase),
        ));
    }

    let failure = result.is_failure().then(|| {
        result
            .error
            .clone()
            .unwrap_or_else(|| format!("phase {} failed", result.phase))
    });
    job.results.push(result);

    match failure {
        Some(error) => {
            job.status = JobStatus::Failed;
            job.error = Some(error.clone());
            clear_in_flight(job);
            job.finished_at = Some(chrono::Utc::now());
            Ok(Transition {
                step: Step::Failed { error },
                progress: job.progress(),
                skipped: Vec::new(),
            })
        }
        None => Ok(advance(job)),
    }
}

/// Bump the attempt counter of the in-flight phase. Returns the new attempt.
pub fn retry(job: &mut Job) -> Result<u32, RegistryError> {
    if job.status != JobStatus::Running {
        return Err(invalid(job, "only a running job can retry"));
    }
    job.attempt += 1;
    Ok(job.attempt)
}

/// Stop a job. The in-flight task, if any, is abandoned.
pub fn cancel(job: &mut Job, reason: Option<String>) -> Result<Transition, RegistryError> {
    if job.status.is_terminal() {
        return Err(invalid(
            job,
            format!("job is already {}", job.status.as_str()),
        ));
    }

    job.status = JobStatus::Cancelled;
    job.error = reason;
    clear_in_flight(job);

    Ok(Transition {
        step: Step::Cancelled,
        progress: job.progress(),
        skipped: Vec::new(),
    })
}

/// Find the next runnable phase, skipping names outside the catalog.
fn advance(job: &mut Job) -> Transition {
    clear_in_flight(job);
    let mut skipped = Vec::new();

    while let Some(name) = job.next_phase().map(str::to_string) {
        match Phase::from_name(&name) {
            Some(phase) => {
                job.status = JobStatus::Running;
                job.current_phase = Some(name);
                job.attempt = 1;
                job.phase_started_at = Some(chrono::Utc::now());
                return Transition {
                    step: Step::Dispatch { phase, attempt: 1 },
                    progress: job.progress(),
                    skipped,
                };
            }
            None => {
                job.results
                    .push(PhaseResult::skipped(name.clone(), UNKNOWN_PHASE_REASON));
                skipped.push(name);
            }
        }
    }

    job.status = JobStatus::Completed;
    job.finished_at = Some(chrono::Utc::now());
    Transition {
        step: Step::Completed,
        progress: job.progress(),
        skipped,
    }
}

fn clear_in_flight(job: &mut Job) {
    job.current_phase = None;
    job.attempt = 0;
    job.phase_started_at = None;
}
