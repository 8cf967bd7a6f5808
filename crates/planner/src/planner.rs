//! The planner service: consumes intake, cancel and result topics and drives
//! each job through its phases.
//!
//! Every inbound delivery is handled on its own task, bounded by a
//! semaphore. Handlers take the job's registry lock, apply one checked
//! transition, and perform the side effects (deadline, progress, dispatch)
//! before releasing it, so a job's outbound messages follow its transition
//! order while different jobs proceed in parallel.

use std::sync::Arc;
use std::time::Duration;

use rukh_channel::{Delivery, Subscription, TaskChannel};
use rukh_core::job::Job;
use rukh_core::messages::{decode, CancelRequest, JobEnvelope, ResultMessage};
use rukh_core::phase::Phase;
use rukh_core::topics::Topics;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::PlannerConfig;
use crate::correlator::{self, DeadlineTracker, Expired, Resolution};
use crate::dispatcher::TaskDispatcher;
use crate::error::{PlannerError, RegistryError};
use crate::publisher::ProgressPublisher;
use crate::registry::{JobGuard, JobRegistry};
use crate::retention;
use crate::sequencer::{self, Step, Transition};

/// How long [`Planner::shutdown`] waits for in-flight handlers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Which inbound stream a delivery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inbound {
    Intake,
    Cancel,
    Result,
}

impl Inbound {
    fn as_str(self) -> &'static str {
        match self {
            Inbound::Intake => "intake",
            Inbound::Cancel => "cancel",
            Inbound::Result => "result",
        }
    }
}

/// Orchestrates analysis jobs over a [`TaskChannel`].
pub struct Planner {
    config: PlannerConfig,
    topics: Topics,
    registry: Arc<JobRegistry>,
    dispatcher: TaskDispatcher,
    publisher: ProgressPublisher,
    deadlines: DeadlineTracker,
    handlers: Arc<Semaphore>,
    shutdown_token: CancellationToken,
    tasks: TaskTracker,
}

impl Planner {
    /// Subscribe to every inbound topic and start consuming.
    ///
    /// All subscriptions join `config.consumer_group`. Job state lives in
    /// this process, so one planner instance serves a consumer group.
    pub async fn start(
        config: PlannerConfig,
        channel: Arc<dyn TaskChannel>,
    ) -> Result<Arc<Self>, PlannerError> {
        let topics = config.topics();
        let group = config.consumer_group.clone();

        let intake = channel
            .subscribe(&topics.job_intake_pattern(), &group)
            .await?;
        let cancels = channel.subscribe(&topics.cancel_pattern(), &group).await?;
        let mut results = Vec::with_capacity(Phase::CATALOG.len());
        for phase in Phase::CATALOG {
            let pattern = topics.phase_result_pattern(phase.as_str());
            results.push(channel.subscribe(&pattern, &group).await?);
        }

        let shutdown_token = CancellationToken::new();
        let tasks = TaskTracker::new();
        let (deadlines, expired_rx) = DeadlineTracker::new(shutdown_token.clone(), tasks.clone());

        let planner = Arc::new(Self {
            handlers: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            registry: Arc::new(JobRegistry::new()),
            dispatcher: TaskDispatcher::new(Arc::clone(&channel), topics.clone()),
            publisher: ProgressPublisher::new(Arc::clone(&channel), topics.clone()),
            deadlines,
            topics,
            config,
            shutdown_token,
            tasks,
        });

        planner.spawn_consumer(intake, Inbound::Intake);
        planner.spawn_consumer(cancels, Inbound::Cancel);
        for sub in results {
            planner.spawn_consumer(sub, Inbound::Result);
        }
        planner.spawn_deadline_loop(expired_rx);
        planner.tasks.spawn(retention::run(
            Arc::clone(&planner.registry),
            planner.config.job_retention,
            planner.config.eviction_interval,
            planner.shutdown_token.clone(),
        ));

        tracing::info!(
            prefix = planner.topics.prefix(),
            group = %planner.config.consumer_group,
            max_attempts = planner.config.max_attempts,
            "Analysis planner started"
        );
        Ok(planner)
    }

    /// Snapshot of one job.
    pub async fn job(&self, job_id: &str) -> Result<Job, PlannerError> {
        Ok(self.registry.get(job_id).await?)
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Cancel a job that has not reached a terminal state.
    ///
    /// The in-flight task is not revoked; its eventual result is discarded.
    pub async fn cancel(&self, job_id: &str, reason: Option<String>) -> Result<(), PlannerError> {
        let mut guard = self.registry.lock(job_id).await?;
        let transition = guard.apply(|job| sequencer::cancel(job, reason))?;
        tracing::info!(job_id, "Job cancelled");
        self.apply_transition(&guard, &transition).await;
        Ok(())
    }

    /// Stop consuming, cancel every deadline and wait briefly for handlers.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down analysis planner");
        self.shutdown_token.cancel();
        self.tasks.close();

        if tokio::time::timeout(SHUTDOWN_GRACE, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pending = self.tasks.len(),
                "Planner tasks still running after shutdown grace period"
            );
        }
        tracing::info!("Analysis planner shut down complete");
    }

    // ---- consumer loops ----

    fn spawn_consumer(self: &Arc<Self>, mut sub: Box<dyn Subscription>, kind: Inbound) {
        let planner = Arc::clone(self);
        self.tasks.spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = planner.shutdown_token.cancelled() => break,
                    next = sub.next() => match next {
                        Some(d) => d,
                        None => break,
                    },
                };

                // Waiting here applies backpressure to the broker. An
                // unsettled delivery dropped on shutdown is redelivered.
                let permit = tokio::select! {
                    _ = planner.shutdown_token.cancelled() => break,
                    permit = Arc::clone(&planner.handlers).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };

                let handler = Arc::clone(&planner);
                planner.tasks.spawn(async move {
                    handler.handle_delivery(kind, delivery).await;
                    drop(permit);
                });
            }
            tracing::debug!(stream = kind.as_str(), "Consumer loop stopped");
        });
    }

    fn spawn_deadline_loop(self: &Arc<Self>, mut expired_rx: mpsc::UnboundedReceiver<Expired>) {
        let planner = Arc::clone(self);
        self.tasks.spawn(async move {
            loop {
                let expired = tokio::select! {
                    _ = planner.shutdown_token.cancelled() => break,
                    next = expired_rx.recv() => match next {
                        Some(e) => e,
                        None => break,
                    },
                };

                let handler = Arc::clone(&planner);
                planner.tasks.spawn(async move {
                    let job_id = expired.job_id.clone();
                    if let Err(e) = handler.handle_deadline(expired).await {
                        tracing::error!(job_id = %job_id, error = %e, "Deadline handling failed");
                    }
                });
            }
        });
    }

    /// Run the handler for one delivery and settle it with the broker.
    async fn handle_delivery(&self, kind: Inbound, delivery: Delivery) {
        let outcome = match kind {
            Inbound::Intake => self.handle_intake(&delivery).await,
            Inbound::Cancel => self.handle_cancel(&delivery).await,
            Inbound::Result => self.handle_result(&delivery).await,
        };

        match outcome {
            Ok(()) => delivery.ack().await,
            Err(e) if e.should_redeliver() => {
                tracing::warn!(
                    stream = kind.as_str(),
                    topic = %delivery.topic,
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "Handler failed, requesting redelivery",
                );
                delivery.nack().await;
            }
            Err(e) => {
                tracing::warn!(
                    stream = kind.as_str(),
                    topic = %delivery.topic,
                    error = %e,
                    "Dropping unprocessable message",
                );
                delivery.ack().await;
            }
        }
    }

    // ---- handlers ----

    async fn handle_intake(&self, delivery: &Delivery) -> Result<(), PlannerError> {
        let envelope: JobEnvelope = match decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.reject_intake(delivery.topic_tail(), &e.to_string()).await;
                return Err(e.into());
            }
        };

        let job_id = envelope.job_id.clone();
        let job = match envelope.into_job() {
            Ok(job) => job,
            Err(e) => {
                self.reject_intake(&job_id, &e.to_string()).await;
                return Err(e.into());
            }
        };
        let phases = job.phases.clone();
        let artifact = job.artifact.clone();

        match self.registry.register(job).await {
            Ok(()) => {}
            Err(RegistryError::DuplicateJob(_)) => {
                // The same intake again, e.g. a redelivery whose first ack
                // was lost. Anything else under a live id is a conflict and
                // keeps being nacked until the broker dead-letters it.
                let registered = self.registry.get(&job_id).await?;
                if registered.phases == phases && registered.artifact == artifact {
                    tracing::debug!(
                        job_id = %job_id,
                        delivery_count = delivery.delivery_count,
                        "Intake already registered",
                    );
                    return Ok(());
                }
                return Err(RegistryError::DuplicateJob(job_id).into());
            }
            Err(e) => return Err(e.into()),
        }
        tracing::info!(job_id = %job_id, phases = ?phases, "Job received");

        let mut guard = self.registry.lock(&job_id).await?;
        let transition = guard.apply(sequencer::start)?;
        self.apply_transition(&guard, &transition).await;
        Ok(())
    }

    /// Tell watchers an intake was rejected. An id that already names a
    /// registered job is left alone so its own progress stays consistent.
    async fn reject_intake(&self, job_id: &str, error: &str) {
        match self.registry.get(job_id).await {
            Err(RegistryError::NotFound(_)) => self.publisher.rejected(job_id, error).await,
            _ => {
                tracing::warn!(job_id, error, "Rejected intake reuses a registered job id");
            }
        }
    }

    async fn handle_cancel(&self, delivery: &Delivery) -> Result<(), PlannerError> {
        let request: CancelRequest = decode(&delivery.payload)?;
        match self.cancel(&request.job_id, request.reason).await {
            // Nothing left to stop.
            Err(PlannerError::Registry(RegistryError::InvalidTransition { reason, .. })) => {
                tracing::debug!(job_id = %request.job_id, reason = %reason, "Cancel ignored");
                Ok(())
            }
            other => other,
        }
    }

    async fn handle_result(&self, delivery: &Delivery) -> Result<(), PlannerError> {
        let msg: ResultMessage = decode(&delivery.payload)?;
        let job_id = msg.job_id.clone();
        let phase = msg.phase.clone();

        // A reply is only trusted for the job and phase its topic names.
        if delivery.topic != self.topics.phase_result(&phase, &job_id) {
            tracing::debug!(
                job_id = %job_id,
                phase = %phase,
                topic = %delivery.topic,
                "Discarding result whose body does not match its topic",
            );
            return Ok(());
        }

        let mut guard = match self.registry.lock(&job_id).await {
            Ok(guard) => guard,
            Err(RegistryError::NotFound(_)) => {
                tracing::debug!(job_id = %job_id, phase = %phase, "Discarding result for unknown job");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let max_attempts = self.config.max_attempts;
        let resolution = guard.apply(|job| correlator::resolve(job, msg, max_attempts))?;
        match &resolution {
            Resolution::Stale(reason) => {
                tracing::debug!(job_id = %job_id, phase = %phase, reason, "Discarding stale result");
            }
            Resolution::Retry { attempt, .. } => {
                tracing::warn!(job_id = %job_id, phase = %phase, attempt, "Engine failure is retryable, re-dispatching");
            }
            Resolution::Recorded(_) => {
                tracing::info!(job_id = %job_id, phase = %phase, "Phase resolved");
            }
        }
        self.apply_resolution(&guard, &resolution).await;
        Ok(())
    }

    async fn handle_deadline(&self, expired: Expired) -> Result<(), PlannerError> {
        let mut guard = match self.registry.lock(&expired.job_id).await {
            Ok(guard) => guard,
            // Evicted while the timer was in the channel.
            Err(RegistryError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let max_attempts = self.config.max_attempts;
        let resolution = guard.apply(|job| {
            correlator::expire(job, expired.phase, expired.attempt, max_attempts)
        })?;
        match &resolution {
            Resolution::Stale(reason) => {
                tracing::debug!(job_id = %expired.job_id, phase = %expired.phase, reason, "Ignoring stale deadline");
            }
            Resolution::Retry { attempt, .. } => {
                tracing::warn!(
                    job_id = %expired.job_id,
                    phase = %expired.phase,
                    attempt,
                    "Phase timed out, re-dispatching",
                );
            }
            Resolution::Recorded(_) => {
                tracing::warn!(
                    job_id = %expired.job_id,
                    phase = %expired.phase,
                    attempts = expired.attempt,
                    "Phase timed out on its last attempt",
                );
            }
        }
        self.apply_resolution(&guard, &resolution).await;
        Ok(())
    }

    // ---- side effects ----

    async fn apply_resolution(&self, guard: &JobGuard, resolution: &Resolution) {
        match resolution {
            Resolution::Stale(_) => {}
            Resolution::Retry { phase, attempt } => {
                self.dispatch(guard.job(), *phase, *attempt).await;
            }
            Resolution::Recorded(transition) => self.apply_transition(guard, transition).await,
        }
    }

    async fn apply_transition(&self, guard: &JobGuard, transition: &Transition) {
        let job = guard.job();
        for phase in &transition.skipped {
            tracing::info!(job_id = %job.id, phase = %phase, "Skipping phase outside the catalog");
        }

        match &transition.step {
            Step::Dispatch { phase, attempt } => {
                self.publisher.publish_transition(job, transition).await;
                self.dispatch(job, *phase, *attempt).await;
            }
            Step::Completed | Step::Failed { .. } | Step::Cancelled => {
                self.deadlines.disarm(&job.id).await;
                self.publisher.publish_transition(job, transition).await;
                tracing::info!(
                    job_id = %job.id,
                    status = job.status.as_str(),
                    phases_completed = job.completed_phases(),
                    total_phases = job.total_phases(),
                    error = job.error.as_deref(),
                    "Job finished",
                );
            }
        }
    }

    /// Arm the attempt's deadline, then publish the task. A failed publish
    /// is left to the deadline, which re-dispatches like an engine timeout.
    async fn dispatch(&self, job: &Job, phase: Phase, attempt: u32) {
        let timeout = self.config.phase_timeouts.timeout_for(phase);
        self.deadlines.arm(&job.id, phase, attempt, timeout).await;

        if let Err(e) = self.dispatcher.dispatch(job, phase, attempt).await {
            tracing::warn!(
                job_id = %job.id,
                phase = %phase,
                attempt,
                error = %e,
                "Failed to publish phase task; deadline will retry",
            );
        }
    }
}
