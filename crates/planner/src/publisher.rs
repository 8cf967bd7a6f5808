//! Outbound progress events and consolidated job results.
//!
//! Progress is observational and goes out with
//! [`TaskChannel::broadcast`]: a missing subscriber or a transport hiccup
//! only costs an update. The consolidated result is the durable record of a
//! finished job and goes out with [`TaskChannel::publish`].

use std::sync::Arc;

use rukh_channel::TaskChannel;
use rukh_core::job::Job;
use rukh_core::messages::{encode, ResultEnvelope};
use rukh_core::progress::{
    ProgressEvent, PROGRESS_CANCELLED, PROGRESS_COMPLETED, PROGRESS_FAILED,
};
use rukh_core::topics::Topics;

use crate::error::PlannerError;
use crate::sequencer::{Step, Transition};

pub struct ProgressPublisher {
    channel: Arc<dyn TaskChannel>,
    topics: Topics,
}

impl ProgressPublisher {
    pub fn new(channel: Arc<dyn TaskChannel>, topics: Topics) -> Self {
        Self { channel, topics }
    }

    /// Best-effort progress update.
    pub async fn progress(&self, event: &ProgressEvent) {
        let payload = match encode(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(job_id = %event.job_id, error = %e, "Failed to encode progress event");
                return;
            }
        };

        let topic = self.topics.progress(&event.job_id);
        if let Err(e) = self.channel.broadcast(&topic, payload).await {
            tracing::warn!(
                job_id = %event.job_id,
                topic = %topic,
                error = %e,
                "Failed to publish progress event",
            );
        }
    }

    /// Durable consolidated result of a finished job.
    pub async fn final_result(&self, job: &Job) -> Result<(), PlannerError> {
        let envelope = ResultEnvelope::from_job(job);
        let topic = self.topics.final_result(&job.id);
        self.channel.publish(&topic, encode(&envelope)?).await?;
        tracing::debug!(job_id = %job.id, topic = %topic, "Published consolidated result");
        Ok(())
    }

    /// Emit everything a committed sequencer transition calls for.
    ///
    /// Terminal transitions publish the consolidated result (Completed and
    /// Failed only) before the final progress event, so a watcher that sees
    /// the final event can already fetch the result.
    pub async fn publish_transition(&self, job: &Job, transition: &Transition) {
        let event = match &transition.step {
            Step::Dispatch { phase, .. } => {
                ProgressEvent::new(&job.id, phase.as_str(), transition.progress)
            }
            Step::Completed => {
                self.publish_final(job).await;
                ProgressEvent::new(&job.id, PROGRESS_COMPLETED, 1.0)
            }
            Step::Failed { error } => {
                self.publish_final(job).await;
                ProgressEvent::new(&job.id, PROGRESS_FAILED, transition.progress)
                    .with_error(error.as_str())
            }
            Step::Cancelled => {
                let event = ProgressEvent::new(&job.id, PROGRESS_CANCELLED, transition.progress);
                match &job.error {
                    Some(reason) => event.with_error(reason.as_str()),
                    None => event,
                }
            }
        };
        self.progress(&event).await;
    }

    /// Tell watchers that a submission was refused at intake.
    pub async fn rejected(&self, job_id: &str, error: &str) {
        let event = ProgressEvent::new(job_id, PROGRESS_FAILED, 0.0).with_error(error);
        self.progress(&event).await;
    }

    async fn publish_final(&self, job: &Job) {
        if let Err(e) = self.final_result(job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to publish consolidated result");
        }
    }
}
