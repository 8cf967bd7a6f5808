use std::sync::Arc;

use rukh_channel::TaskChannel;
use rukh_core::job::Job;
use rukh_core::messages::{encode, TaskEnvelope};
use rukh_core::phase::Phase;
use rukh_core::topics::Topics;

use crate::error::PlannerError;

/// Publishes phase tasks to the engine pools.
///
/// The dispatcher does not touch job state: the in-flight marker is set by
/// the sequencer before the publish, so a failed publish is simply an
/// attempt that never gets an answer and is retried by its deadline.
pub struct TaskDispatcher {
    channel: Arc<dyn TaskChannel>,
    topics: Topics,
}

impl TaskDispatcher {
    pub fn new(channel: Arc<dyn TaskChannel>, topics: Topics) -> Self {
        Self { channel, topics }
    }

    /// Publish `attempt` of `phase` for `job`, carrying all prior results.
    pub async fn dispatch(
        &self,
        job: &Job,
        phase: Phase,
        attempt: u32,
    ) -> Result<TaskEnvelope, PlannerError> {
        let envelope = TaskEnvelope::for_job(job, phase.as_str(), attempt);
        let topic = self.topics.phase_task(phase.as_str(), &job.id);
        self.channel.publish(&topic, encode(&envelope)?).await?;

        tracing::debug!(
            job_id = %job.id,
            phase = %phase,
            attempt,
            topic = %topic,
            "Dispatched phase task",
        );
        Ok(envelope)
    }
}
