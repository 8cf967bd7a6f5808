//! Progress events and phase-granular progress arithmetic.

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};

/// Synthetic phase label on the final event of a completed job.
pub const PROGRESS_COMPLETED: &str = "completed";

/// Synthetic phase label on the final event of a failed job.
pub const PROGRESS_FAILED: &str = "failed";

/// Synthetic phase label on the final event of a cancelled job.
pub const PROGRESS_CANCELLED: &str = "cancelled";

/// Fraction of phases completed, in `0.0..=1.0`.
///
/// A zero-phase total yields 0; the planner never creates such a job.
pub fn progress_fraction(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (completed as f64 / total as f64).clamp(0.0, 1.0)
}

/// Observational progress update. Never used to rebuild job state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// Phase now running, or one of the synthetic terminal labels.
    pub phase: String,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: Timestamp,
}

impl ProgressEvent {
    pub fn new(job_id: impl Into<JobId>, phase: impl Into<String>, progress: f64) -> Self {
        Self {
            job_id: job_id.into(),
            phase: phase.into(),
            progress,
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Whether this is the last event a job will emit.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.phase.as_str(),
            PROGRESS_COMPLETED | PROGRESS_FAILED | PROGRESS_CANCELLED
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_is_phase_granular() {
        assert_eq!(progress_fraction(0, 4), 0.0);
        assert!((progress_fraction(1, 4) - 0.25).abs() < f64::EPSILON);
        assert_eq!(progress_fraction(4, 4), 1.0);
    }

    #[test]
    fn fraction_of_empty_plan_is_zero() {
        assert_eq!(progress_fraction(0, 0), 0.0);
    }

    #[test]
    fn error_is_omitted_when_absent() {
        let json = serde_json::to_value(ProgressEvent::new("j", "static", 0.0)).unwrap();
        assert!(json.get("error").is_none());
    }

    #[test]
    fn terminal_labels() {
        assert!(ProgressEvent::new("j", PROGRESS_FAILED, 0.5).is_terminal());
        assert!(!ProgressEvent::new("j", "fuzz", 0.5).is_terminal());
    }
}
