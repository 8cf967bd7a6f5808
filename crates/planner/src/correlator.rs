//! Matches engine replies and deadline expiries to in-flight phases.
//!
//! [`resolve`] and [`expire`] are registry mutators: they decide, under the
//! job's lock, whether an event is stale, warrants a re-dispatch, or
//! resolves the phase. Because the in-flight phase is cleared the moment a
//! result is recorded, a redelivered or duplicated reply finds nothing in
//! flight and is reported as stale.
//!
//! [`DeadlineTracker`] owns one timer per job for the current attempt.

use std::collections::HashMap;
use std::time::Duration;

use rukh_core::job::{Job, PhaseOutcome, PhaseResult};
use rukh_core::messages::ResultMessage;
use rukh_core::phase::Phase;
use rukh_core::types::JobId;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::RegistryError;
use crate::sequencer::{self, Transition};

/// Decision taken for one inbound reply or one expired deadline.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Nothing to do; the event is acknowledged and dropped.
    Stale(&'static str),
    /// Re-publish the in-flight phase with a new attempt number.
    Retry { phase: Phase, attempt: u32 },
    /// The phase was resolved and the sequencer moved on.
    Recorded(Transition),
}

/// Correlate an engine reply with the job's in-flight phase.
pub fn resolve(
    job: &mut Job,
    msg: ResultMessage,
    max_attempts: u32,
) -> Result<Resolution, RegistryError> {
    if job.status.is_terminal() {
        return Ok(Resolution::Stale("job is terminal"));
    }
    if !job.is_in_flight(&msg.phase) {
        return Ok(Resolution::Stale("phase not in flight"));
    }
    let Some(phase) = Phase::from_name(&msg.phase) else {
        return Ok(Resolution::Stale("phase outside the catalog"));
    };
    if let Some(attempt) = msg.attempt {
        if attempt == 0 || attempt > job.attempt {
            return Ok(Resolution::Stale("attempt was never dispatched"));
        }
    }

    if msg.outcome == PhaseOutcome::Failure && msg.retryable && job.attempt < max_attempts {
        // A retryable failure from a superseded attempt says nothing about
        // the attempt now running.
        if msg.attempt.is_some_and(|a| a != job.attempt) {
            return Ok(Resolution::Stale("retryable failure from a superseded attempt"));
        }
        let attempt = sequencer::retry(job)?;
        return Ok(Resolution::Retry { phase, attempt });
    }

    let result = msg.into_phase_result(job.attempt, elapsed_ms(job));
    Ok(Resolution::Recorded(sequencer::record_result(job, result)?))
}

/// Handle a deadline that fired for `(phase, attempt)`.
///
/// Below the attempt ceiling the phase is re-dispatched; at the ceiling it
/// fails with `timeout after N attempts`.
pub fn expire(
    job: &mut Job,
    phase: Phase,
    attempt: u32,
    max_attempts: u32,
) -> Result<Resolution, RegistryError> {
    if !job.is_in_flight(phase.as_str()) || job.attempt != attempt {
        return Ok(Resolution::Stale("deadline for a superseded attempt"));
    }

    if attempt < max_attempts {
        let attempt = sequencer::retry(job)?;
        return Ok(Resolution::Retry { phase, attempt });
    }

    let result = PhaseResult::failure(
        phase.as_str(),
        format!("timeout after {attempt} attempts"),
        attempt,
        elapsed_ms(job),
    );
    Ok(Resolution::Recorded(sequencer::record_result(job, result)?))
}

fn elapsed_ms(job: &Job) -> u64 {
    job.phase_started_at
        .map(|started| (chrono::Utc::now() - started).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Deadlines
// ---------------------------------------------------------------------------

/// A deadline that fired without being disarmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    pub job_id: JobId,
    pub phase: Phase,
    pub attempt: u32,
}

struct Timer {
    attempt: u32,
    cancel: CancellationToken,
}

/// One deadline timer per job, for the attempt currently in flight.
///
/// Fired deadlines are delivered on the receiver returned by
/// [`DeadlineTracker::new`]. Arming replaces any earlier timer of the same
/// job; cancelling the parent token stops every timer.
pub struct DeadlineTracker {
    timers: Mutex<HashMap<JobId, Timer>>,
    expired_tx: mpsc::UnboundedSender<Expired>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl DeadlineTracker {
    pub fn new(
        cancel: CancellationToken,
        tasks: TaskTracker,
    ) -> (Self, mpsc::UnboundedReceiver<Expired>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let tracker = Self {
            timers: Mutex::new(HashMap::new()),
            expired_tx,
            cancel,
            tasks,
        };
        (tracker, expired_rx)
    }

    /// Start the deadline for `attempt` of `phase`.
    pub async fn arm(&self, job_id: &str, phase: Phase, attempt: u32, timeout: Duration) {
        let token = self.cancel.child_token();
        let previous = self.timers.lock().await.insert(
            job_id.to_string(),
            Timer {
                attempt,
                cancel: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let tx = self.expired_tx.clone();
        let expired = Expired {
            job_id: job_id.to_string(),
            phase,
            attempt,
        };
        self.tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    // The receiver is gone only during shutdown.
                    let _ = tx.send(expired);
                }
            }
        });
    }

    /// Stop the job's timer, if any.
    pub async fn disarm(&self, job_id: &str) {
        if let Some(timer) = self.timers.lock().await.remove(job_id) {
            timer.cancel.cancel();
        }
    }

    /// Attempt covered by the job's current timer.
    pub async fn armed_attempt(&self, job_id: &str) -> Option<u32> {
        self.timers.lock().await.get(job_id).map(|t| t.attempt)
    }
}
