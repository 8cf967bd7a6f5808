#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use rukh_channel::{InMemoryBroker, TaskChannel};
use rukh_core::job::{ArtifactRef, Job};
use rukh_core::messages::{JobEnvelope, ResultEnvelope, TaskEnvelope};
use rukh_core::progress::ProgressEvent;
use rukh_planner::config::PhaseTimeouts;
use rukh_planner::sim::{EngineScript, SimulatedEngines};
use rukh_planner::{Planner, PlannerClient, PlannerConfig};

/// Per-attempt deadline used by every phase in tests.
pub const PHASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for waiting on a single event. Tests run on a paused clock,
/// so this only elapses when nothing else is scheduled.
const WAIT: Duration = Duration::from_secs(3600);

/// Build a test `PlannerConfig` with short, uniform phase deadlines.
pub fn test_config() -> PlannerConfig {
    PlannerConfig {
        phase_timeouts: PhaseTimeouts::uniform(PHASE_TIMEOUT),
        ..Default::default()
    }
}

pub fn artifact() -> ArtifactRef {
    ArtifactRef {
        contract_id: Some("c-1".into()),
        contract_name: Some("Vault".into()),
        source_code: Some("contract Vault {}".into()),
        compiler_version: Some("0.8.20".into()),
    }
}

/// A planner, its simulated engines and a gateway client on one broker.
pub struct Harness {
    pub broker: Arc<InMemoryBroker>,
    pub channel: Arc<dyn TaskChannel>,
    pub planner: Arc<Planner>,
    pub engines: SimulatedEngines,
    pub client: PlannerClient,
    progress: BoxStream<'static, ProgressEvent>,
    results: BoxStream<'static, ResultEnvelope>,
}

impl Harness {
    pub async fn start(script: EngineScript) -> Self {
        Self::start_with(test_config(), script).await
    }

    pub async fn start_with(config: PlannerConfig, script: EngineScript) -> Self {
        let broker = Arc::new(InMemoryBroker::new(config.broker_config()));
        let channel: Arc<dyn TaskChannel> = broker.clone();
        let topics = config.topics();

        let planner = Planner::start(config, Arc::clone(&channel)).await.unwrap();
        let engines = SimulatedEngines::spawn(Arc::clone(&channel), topics.clone(), script)
            .await
            .unwrap();
        let client = PlannerClient::new(Arc::clone(&channel), topics, "gateway");

        // Progress is broadcast: watch before anything is submitted.
        let progress = client.watch_progress(None).await.unwrap();
        let results = client.watch_results(None).await.unwrap();

        Self {
            broker,
            channel,
            planner,
            engines,
            client,
            progress,
            results,
        }
    }

    pub async fn submit(&self, job_id: &str, phases: &[&str]) {
        let envelope = JobEnvelope::new(job_id, artifact()).with_phases(phases.iter().copied());
        self.client.submit_job(&envelope).await.unwrap();
    }

    pub async fn next_progress(&mut self) -> ProgressEvent {
        tokio::time::timeout(WAIT, self.progress.next())
            .await
            .expect("timed out waiting for progress")
            .expect("progress stream ended")
    }

    /// Progress events up to and including the job's terminal event.
    pub async fn progress_until_terminal(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        loop {
            let event = self.next_progress().await;
            let done = event.is_terminal();
            events.push(event);
            if done {
                return events;
            }
        }
    }

    /// `None` if no further progress event arrives within `window`.
    pub async fn try_next_progress(&mut self, window: Duration) -> Option<ProgressEvent> {
        tokio::time::timeout(window, self.progress.next())
            .await
            .ok()
            .flatten()
    }

    pub async fn next_result(&mut self) -> ResultEnvelope {
        tokio::time::timeout(WAIT, self.results.next())
            .await
            .expect("timed out waiting for result")
            .expect("result stream ended")
    }

    pub async fn try_next_result(&mut self, window: Duration) -> Option<ResultEnvelope> {
        tokio::time::timeout(window, self.results.next())
            .await
            .ok()
            .flatten()
    }

    pub async fn job(&self, job_id: &str) -> Job {
        self.planner.job(job_id).await.unwrap()
    }

    /// Tasks the engines received for one job, in arrival order.
    pub async fn tasks_for(&self, job_id: &str) -> Vec<TaskEnvelope> {
        self.engines
            .received()
            .await
            .into_iter()
            .filter(|t| t.job_id == job_id)
            .collect()
    }

    /// `(phase, attempt)` of every task the engines received for a job.
    pub async fn dispatch_log(&self, job_id: &str) -> Vec<(String, u32)> {
        self.tasks_for(job_id)
            .await
            .into_iter()
            .map(|t| (t.phase, t.attempt))
            .collect()
    }

    pub async fn shutdown(self) {
        self.engines.shutdown().await;
        self.planner.shutdown().await;
        self.channel.close().await;
    }
}

pub fn phases_of(events: &[ProgressEvent]) -> Vec<&str> {
    events.iter().map(|e| e.phase.as_str()).collect()
}

pub fn fractions_of(events: &[ProgressEvent]) -> Vec<f64> {
    events.iter().map(|e| e.progress).collect()
}
