//! Gateway-side handle for submitting and watching analysis jobs.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use rukh_channel::TaskChannel;
use rukh_core::messages::{decode, encode, CancelRequest, JobEnvelope, ResultEnvelope};
use rukh_core::progress::ProgressEvent;
use rukh_core::topics::Topics;
use rukh_core::types::JobId;
use serde::de::DeserializeOwned;

use crate::error::PlannerError;

/// Publishes job intake and cancel requests and follows their outcome.
pub struct PlannerClient {
    channel: Arc<dyn TaskChannel>,
    topics: Topics,
    /// Consumer group used for the watch streams.
    group: String,
}

impl PlannerClient {
    pub fn new(channel: Arc<dyn TaskChannel>, topics: Topics, group: impl Into<String>) -> Self {
        Self {
            channel,
            topics,
            group: group.into(),
        }
    }

    /// A fresh job id for callers that do not bring their own.
    pub fn generate_job_id() -> JobId {
        uuid::Uuid::new_v4().to_string()
    }

    /// Submit a job for analysis. Validation happens in the planner; an
    /// invalid submission surfaces as a `failed` progress event.
    pub async fn submit_job(&self, envelope: &JobEnvelope) -> Result<(), PlannerError> {
        let topic = self.topics.job_intake(&envelope.job_id);
        self.channel.publish(&topic, encode(envelope)?).await?;
        tracing::info!(job_id = %envelope.job_id, topic = %topic, "Submitted analysis job");
        Ok(())
    }

    pub async fn cancel_job(
        &self,
        job_id: &str,
        reason: Option<String>,
    ) -> Result<(), PlannerError> {
        let request = CancelRequest {
            job_id: job_id.to_string(),
            reason,
        };
        let topic = self.topics.cancel(job_id);
        self.channel.publish(&topic, encode(&request)?).await?;
        tracing::info!(job_id, "Requested job cancellation");
        Ok(())
    }

    /// Progress events for one job, or every job when `job_id` is `None`.
    ///
    /// Progress is broadcast, so only events published after this call
    /// returns are seen.
    pub async fn watch_progress(
        &self,
        job_id: Option<&str>,
    ) -> Result<BoxStream<'static, ProgressEvent>, PlannerError> {
        let pattern = match job_id {
            Some(id) => self.topics.progress(id),
            None => self.topics.progress_pattern(),
        };
        self.watch(pattern).await
    }

    /// Consolidated results for one job, or every job when `job_id` is
    /// `None`.
    pub async fn watch_results(
        &self,
        job_id: Option<&str>,
    ) -> Result<BoxStream<'static, ResultEnvelope>, PlannerError> {
        let pattern = match job_id {
            Some(id) => self.topics.final_result(id),
            None => self.topics.final_result_pattern(),
        };
        self.watch(pattern).await
    }

    /// Subscribe to `pattern` and decode every delivery as `T`, acking as
    /// it goes. Undecodable payloads are skipped.
    async fn watch<T>(&self, pattern: String) -> Result<BoxStream<'static, T>, PlannerError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let sub = self.channel.subscribe(&pattern, &self.group).await?;

        let stream = stream::unfold(sub, |mut sub| async move {
            loop {
                let delivery = sub.next().await?;
                let decoded = decode::<T>(&delivery.payload);
                let topic = delivery.topic.clone();
                delivery.ack().await;

                match decoded {
                    Ok(value) => return Some((value, sub)),
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Skipping undecodable message");
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
