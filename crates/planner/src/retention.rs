//! Periodic eviction of finished jobs from the registry.
//!
//! Terminal jobs stay queryable for the retention window, then are dropped
//! so the registry does not grow without bound. Runs on a fixed interval
//! using `tokio::time::interval`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::JobRegistry;

/// Run the eviction loop until `cancel` is triggered.
pub async fn run(
    registry: Arc<JobRegistry>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_secs = retention.as_secs(),
        interval_secs = interval.as_secs(),
        "Job retention sweeper started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job retention sweeper stopping");
                break;
            }
            _ = ticker.tick() => {
                let evicted = registry.evict_terminal(retention).await;
                if evicted > 0 {
                    let remaining = registry.len().await;
                    tracing::info!(evicted, remaining, "Evicted finished jobs");
                } else {
                    tracing::debug!("Job retention: nothing to evict");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rukh_core::job::{ArtifactRef, Job, JobStatus};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_finished_jobs_and_stops_on_cancel() {
        let registry = Arc::new(JobRegistry::new());
        registry
            .register(Job::new("live", ArtifactRef::default(), vec!["static".into()]))
            .await
            .unwrap();
        registry
            .register(Job::new("done", ArtifactRef::default(), vec!["static".into()]))
            .await
            .unwrap();
        registry
            .transition("done", |job| {
                job.status = JobStatus::Cancelled;
                Ok(())
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(&registry),
            Duration::ZERO,
            Duration::from_secs(60),
            cancel.clone(),
        ));

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.ids().await, vec!["live".to_string()]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
