//! In-process stand-ins for the analysis engines.
//!
//! Each phase gets one consumer on its task topic that answers on the
//! phase's result topic according to an [`EngineScript`]. Used by the
//! binary's demo mode and by the integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rukh_channel::{ChannelError, Subscription, TaskChannel};
use rukh_core::messages::{decode, encode, ResultMessage, TaskEnvelope};
use rukh_core::phase::Phase;
use rukh_core::topics::Topics;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// How a simulated engine answers a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineBehavior {
    Succeed,
    Fail(String),
    /// Fail with `retryable: true`.
    FailRetryable(String),
    /// Retryable failure on the first attempt, success afterwards.
    FlakyOnce,
    /// Never answer.
    Silent,
    /// Send the success reply twice.
    ReplyTwice,
}

/// Per-phase behaviour for a pool of simulated engines.
#[derive(Debug, Clone)]
pub struct EngineScript {
    default: EngineBehavior,
    overrides: HashMap<Phase, EngineBehavior>,
    latency: Duration,
}

impl Default for EngineScript {
    fn default() -> Self {
        Self::all(EngineBehavior::Succeed)
    }
}

impl EngineScript {
    pub fn all(behavior: EngineBehavior) -> Self {
        Self {
            default: behavior,
            overrides: HashMap::new(),
            latency: Duration::ZERO,
        }
    }

    pub fn with(mut self, phase: Phase, behavior: EngineBehavior) -> Self {
        self.overrides.insert(phase, behavior);
        self
    }

    /// Delay before each reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn behavior_for(&self, phase: Phase) -> &EngineBehavior {
        self.overrides.get(&phase).unwrap_or(&self.default)
    }
}

/// Running simulated engines, one consumer per catalog phase.
pub struct SimulatedEngines {
    received: Arc<Mutex<Vec<TaskEnvelope>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl SimulatedEngines {
    /// Subscribe every phase's task topic and start answering.
    pub async fn spawn(
        channel: Arc<dyn TaskChannel>,
        topics: Topics,
        script: EngineScript,
    ) -> Result<Self, ChannelError> {
        let engines = Self {
            received: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        let script = Arc::new(script);

        for phase in Phase::CATALOG {
            let group = format!("{phase}-engines");
            let sub = channel
                .subscribe(&topics.phase_task_pattern(phase.as_str()), &group)
                .await?;
            engines.tasks.spawn(run_engine(
                phase,
                sub,
                Arc::clone(&channel),
                topics.clone(),
                Arc::clone(&script),
                Arc::clone(&engines.received),
                engines.cancel.clone(),
            ));
        }

        tracing::info!("Simulated engines started");
        Ok(engines)
    }

    /// Every task received so far, in arrival order.
    pub async fn received(&self) -> Vec<TaskEnvelope> {
        self.received.lock().await.clone()
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn run_engine(
    phase: Phase,
    mut sub: Box<dyn Subscription>,
    channel: Arc<dyn TaskChannel>,
    topics: Topics,
    script: Arc<EngineScript>,
    received: Arc<Mutex<Vec<TaskEnvelope>>>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            next = sub.next() => match next {
                Some(d) => d,
                None => break,
            },
        };

        let decoded = decode::<TaskEnvelope>(&delivery.payload);
        delivery.ack().await;
        let task = match decoded {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(phase = %phase, error = %e, "Simulated engine got a malformed task");
                continue;
            }
        };
        tracing::debug!(job_id = %task.job_id, phase = %phase, attempt = task.attempt, "Simulated engine received task");
        received.lock().await.push(task.clone());

        let replies = match script.behavior_for(phase) {
            EngineBehavior::Succeed => vec![ResultMessage::success(&task, findings(&task))],
            EngineBehavior::Fail(error) => vec![ResultMessage::failure(&task, error.as_str())],
            EngineBehavior::FailRetryable(error) => {
                vec![ResultMessage::failure(&task, error.as_str()).retryable()]
            }
            EngineBehavior::FlakyOnce if task.attempt == 1 => {
                vec![ResultMessage::failure(&task, "engine worker lost").retryable()]
            }
            EngineBehavior::FlakyOnce => vec![ResultMessage::success(&task, findings(&task))],
            EngineBehavior::Silent => Vec::new(),
            EngineBehavior::ReplyTwice => {
                let reply = ResultMessage::success(&task, findings(&task));
                vec![reply.clone(), reply]
            }
        };
        if replies.is_empty() {
            continue;
        }

        if !script.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(script.latency) => {}
            }
        }

        let topic = topics.phase_result(phase.as_str(), &task.job_id);
        for reply in replies {
            let published = match encode(&reply) {
                Ok(payload) => channel.publish(&topic, payload).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = published {
                tracing::warn!(job_id = %task.job_id, phase = %phase, error = %e, "Simulated engine failed to reply");
            }
        }
    }
}

/// Canned engine output: enough for later phases to see who ran before.
fn findings(task: &TaskEnvelope) -> serde_json::Value {
    serde_json::json!({
        "engine": task.phase,
        "attempt": task.attempt,
        "inputs": task.previous_results.len(),
        "findings": [],
    })
}
