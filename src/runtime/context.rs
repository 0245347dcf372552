/// Explicit engine context
///
/// Built once at startup and passed to the engine, the job runner and the
/// scheduler. It replaces any global component lookup: every collaborator an
/// operation may reach is a field here.

use crate::config::Config;
use crate::error::{EngineError, StoreError};
use crate::job::task_sync;
use crate::job::{JobTypeRegistry, RetryPolicy};
use crate::runtime::effects::TaskEffect;
use crate::services::Services;
use crate::store::PersistenceStore;
use crate::workflow::ids::InstanceId;
use crate::workflow::registry::WorkflowRegistry;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Upper bound for configured claim leases
const MAX_LEASE_SECS: u64 = 86_400;

#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn PersistenceStore>,
    pub workflows: Arc<WorkflowRegistry>,
    pub services: Services,
    pub job_types: Arc<JobTypeRegistry>,
    pub retry: RetryPolicy,
    /// Length of instance and job claims
    pub lease: Duration,
}

impl EngineContext {
    /// Context with in-memory collaborators, built-in job types and the default retry policy
    pub fn new(store: Arc<dyn PersistenceStore>, workflows: Arc<WorkflowRegistry>) -> Self {
        Self {
            store,
            workflows,
            services: Services::in_memory(),
            job_types: Arc::new(JobTypeRegistry::builtin()),
            retry: RetryPolicy::default(),
            lease: Duration::seconds(60),
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn PersistenceStore>,
        workflows: Arc<WorkflowRegistry>,
    ) -> Self {
        Self::new(store, workflows)
            .with_retry_policy(RetryPolicy::from(&config.retry))
            .with_lease(Duration::seconds(config.scheduler.lease_secs.min(MAX_LEASE_SECS) as i64))
    }

    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    pub fn with_job_types(mut self, job_types: JobTypeRegistry) -> Self {
        self.job_types = Arc::new(job_types);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Apply task effects of a committed change in order. From the first
    /// failure on, the remaining effects are handed to a `task-sync` job;
    /// if that job cannot be stored either, `TaskEffectsLost` is returned.
    pub(crate) async fn apply_task_effects(
        &self,
        instance_id: &InstanceId,
        effects: Vec<TaskEffect>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        for (index, effect) in effects.iter().enumerate() {
            if let Err(e) = effect.apply(self.services.tasks.as_ref()).await {
                tracing::warn!(
                    "⚠️ Task effect for task {} of instance {} failed, deferring to {}: {}",
                    effect.task_id(), instance_id, task_sync::TASK_SYNC, e
                );
                let pending = effects[index..].to_vec();
                let count = pending.len();
                let scheduled = match task_sync::job_for(instance_id, pending, now) {
                    Ok(job) => self.store.schedule_job(job).await,
                    Err(e) => Err(StoreError::from(e)),
                };
                return scheduled.map_err(|source| {
                    tracing::error!("❌ Failed to schedule task sync for instance {}: {}", instance_id, source);
                    EngineError::TaskEffectsLost {
                        instance_id: instance_id.clone(),
                        pending: count,
                        source,
                    }
                });
            }
        }
        Ok(())
    }
}
