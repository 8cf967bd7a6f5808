//! In-memory table of active jobs.
//!
//! The map lock is held only to look up, insert or remove an entry. Each job
//! sits behind its own mutex, so handlers for different jobs never contend,
//! while two messages for the same job are serialized. Every mutation goes
//! through [`JobGuard::apply`], which works on a draft copy and commits only
//! if the result still satisfies [`Job::check_invariants`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rukh_core::job::Job;
use rukh_core::types::JobId;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::RegistryError;

/// Authoritative store of workflow state, keyed by job id.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<Job>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new job.
    pub async fn register(&self, job: Job) -> Result<(), RegistryError> {
        job.check_invariants()
            .map_err(|reason| RegistryError::InvalidTransition {
                job_id: job.id.clone(),
                reason,
            })?;

        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(RegistryError::DuplicateJob(job.id));
        }
        jobs.insert(job.id.clone(), Arc::new(Mutex::new(job)));
        Ok(())
    }

    /// Snapshot of a job's current state.
    pub async fn get(&self, id: &str) -> Result<Job, RegistryError> {
        let entry = self.entry(id).await?;
        let job = entry.lock().await;
        Ok(job.clone())
    }

    /// Acquire the job's lock. Side effects performed while holding the
    /// guard are ordered with the job's transitions.
    pub async fn lock(&self, id: &str) -> Result<JobGuard, RegistryError> {
        let entry = self.entry(id).await?;
        Ok(JobGuard {
            job: entry.lock_owned().await,
        })
    }

    /// Apply one checked mutation and release the lock.
    pub async fn transition<T, F>(&self, id: &str, mutator: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Job) -> Result<T, RegistryError>,
    {
        self.lock(id).await?.apply(mutator)
    }

    /// Remove terminal jobs untouched for longer than `retention`.
    ///
    /// Jobs whose lock is currently held are skipped; they are being worked
    /// on and will be reconsidered on the next sweep.
    pub async fn evict_terminal(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|window| chrono::Utc::now().checked_sub_signed(window));
        // A window too large to represent never expires anything.
        let Some(cutoff) = cutoff else {
            return 0;
        };

        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| match entry.try_lock() {
            Ok(job) => !(job.status.is_terminal() && job.updated_at <= cutoff),
            Err(_) => true,
        });
        before - jobs.len()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<JobId> {
        self.jobs.read().await.keys().cloned().collect()
    }

    async fn entry(&self, id: &str) -> Result<Arc<Mutex<Job>>, RegistryError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }
}

/// Exclusive access to one job.
pub struct JobGuard {
    job: OwnedMutexGuard<Job>,
}

impl JobGuard {
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Run `mutator` against a draft of the job and commit the draft if the
    /// mutator succeeds and the invariants hold. A mutator that leaves the
    /// job unchanged commits nothing.
    pub fn apply<T, F>(&mut self, mutator: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Job) -> Result<T, RegistryError>,
    {
        let mut draft = self.job.clone();
        let out = mutator(&mut draft)?;

        if draft != *self.job {
            draft
                .check_invariants()
                .map_err(|reason| RegistryError::InvalidTransition {
                    job_id: draft.id.clone(),
                    reason,
                })?;
            draft.updated_at = chrono::Utc::now();
            *self.job = draft;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rukh_core::job::{ArtifactRef, JobStatus};

    use super::*;

    fn job(id: &str) -> Job {
        Job::new(id, ArtifactRef::default(), vec!["static".into(), "bytecode".into()])
    }

    #[tokio::test]
    async fn register_then_get() {
        let registry = JobRegistry::new();
        registry.register(job("a")).await.unwrap();

        let snapshot = registry.get("a").await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Received);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_register_is_rejected() {
        let registry = JobRegistry::new();
        registry.register(job("a")).await.unwrap();
        assert_matches!(
            registry.register(job("a")).await,
            Err(RegistryError::DuplicateJob(id)) if id == "a"
        );
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let registry = JobRegistry::new();
        assert_matches!(registry.get("nope").await, Err(RegistryError::NotFound(_)));
        assert_matches!(
            registry.transition("nope", |_| Ok(())).await,
            Err(RegistryError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn invariant_violation_is_not_committed() {
        let registry = JobRegistry::new();
        registry.register(job("a")).await.unwrap();

        // Running with no current phase breaks the status invariant.
        let result = registry
            .transition("a", |job| {
                job.status = JobStatus::Running;
                Ok(())
            })
            .await;
        assert_matches!(result, Err(RegistryError::InvalidTransition { .. }));

        let snapshot = registry.get("a").await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Received);
    }

    #[tokio::test]
    async fn mutator_error_leaves_job_untouched() {
        let registry = JobRegistry::new();
        registry.register(job("a")).await.unwrap();

        let result: Result<(), _> = registry
            .transition("a", |job| {
                job.phases.clear();
                Err(RegistryError::InvalidTransition {
                    job_id: job.id.clone(),
                    reason: "refused".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(registry.get("a").await.unwrap().phases.len(), 2);
    }

    #[tokio::test]
    async fn noop_mutation_keeps_updated_at() {
        let registry = JobRegistry::new();
        registry.register(job("a")).await.unwrap();
        let before = registry.get("a").await.unwrap().updated_at;

        registry.transition("a", |_| Ok(())).await.unwrap();
        assert_eq!(registry.get("a").await.unwrap().updated_at, before);
    }

    #[tokio::test]
    async fn concurrent_transitions_on_one_job_are_serialized() {
        let registry = Arc::new(JobRegistry::new());
        registry.register(job("a")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .transition("a", |job| {
                        job.attempt += 1;
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(registry.get("a").await.unwrap().attempt, 32);
    }

    #[tokio::test]
    async fn eviction_removes_only_old_terminal_jobs() {
        let registry = JobRegistry::new();
        registry.register(job("running")).await.unwrap();
        registry.register(job("done")).await.unwrap();

        registry
            .transition("done", |job| {
                job.status = JobStatus::Cancelled;
                Ok(())
            })
            .await
            .unwrap();

        // Nothing is old enough yet.
        assert_eq!(registry.evict_terminal(Duration::from_secs(3600)).await, 0);

        assert_eq!(registry.evict_terminal(Duration::ZERO).await, 1);
        assert_eq!(registry.ids().await, vec!["running".to_string()]);
    }
}
