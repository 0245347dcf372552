/// Executes one claimed job
///
/// The job's instance is locked with a fresh claim before anything runs; if
/// that claim is contended the job is released unchanged and picked up again
/// on a later poll. The job result, the instance changes and any new jobs are
/// written in one commit.

use crate::error::{EngineError, StoreError};
use crate::job::{Job, JobController, JobError, JobOutcome};
use crate::runtime::context::EngineContext;
use crate::runtime::instance::WorkflowInstance;
use crate::store::{ClaimToken, Commit};
use chrono::{DateTime, Utc};

/// What happened to a job run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    Completed,
    Rescheduled(DateTime<Utc>),
    /// Failed and will be retried at `due_at`
    Failed { retry_count: u32, due_at: DateTime<Utc> },
    /// Failed permanently
    Dead,
    /// Instance or target already ended; marked done without running
    Skipped,
    /// Instance claim contended; released for a later poll
    Deferred,
    /// Job record was deleted by a cancellation
    Cancelled,
}

#[derive(Clone)]
pub struct JobRunner {
    context: EngineContext,
}

impl JobRunner {
    pub fn new(context: EngineContext) -> Self {
        Self { context }
    }

    /// Run a job claimed with `job_token`
    pub async fn run(&self, job: Job, job_token: &ClaimToken, now: DateTime<Utc>) -> Result<JobRun, EngineError> {
        let store = &self.context.store;

        let (instance, instance_token) = match &job.instance_id {
            Some(instance_id) => {
                let token = ClaimToken::new();
                match store
                    .lock_instance(instance_id, &token, now, now + self.context.lease)
                    .await
                {
                    Ok(instance) => (Some(instance), Some(token)),
                    Err(StoreError::Contention(e)) => {
                        tracing::debug!("🔒 Job {} deferred: {}", job.id, e);
                        store.release_job(&job.id, job_token).await?;
                        return Ok(JobRun::Deferred);
                    }
                    Err(StoreError::NotFound { .. }) => (None, None),
                    Err(e) => {
                        store.release_job(&job.id, job_token).await?;
                        return Err(e.into());
                    }
                }
            }
            None => (None, None),
        };

        let job_id = job.id.clone();
        let instance_id = job.instance_id.clone();
        let result = self
            .run_claimed(job, job_token, instance, instance_token.clone(), now)
            .await;

        // a successful commit already dropped both leases
        if let Err(error) = &result {
            tracing::error!("❌ Job {} aborted: {}", job_id, error);
            if let Err(e) = store.release_job(&job_id, job_token).await {
                tracing::error!("❌ Failed to release job {}: {}", job_id, e);
            }
            if let (Some(instance_id), Some(token)) = (&instance_id, &instance_token) {
                if let Err(e) = store.unlock_instance(instance_id, token).await {
                    tracing::error!("❌ Failed to unlock instance {}: {}", instance_id, e);
                }
            }
        }
        result
    }

    async fn run_claimed(
        &self,
        job: Job,
        job_token: &ClaimToken,
        instance: Option<WorkflowInstance>,
        instance_token: Option<ClaimToken>,
        now: DateTime<Utc>,
    ) -> Result<JobRun, EngineError> {
        let store = &self.context.store;
        let release = |instance: &Option<WorkflowInstance>| match (instance, &instance_token) {
            (Some(instance), Some(token)) => Commit::release(instance.id.clone(), token.clone()),
            _ => Commit::default(),
        };

        // the claim may have raced a cancellation that deleted the record
        let Some(mut job) = store.load_job(&job.id).await? else {
            store.commit(release(&instance)).await?;
            tracing::debug!("🗑️ Job {} was cancelled before it ran", job.id);
            return Ok(JobRun::Cancelled);
        };
        if !job.is_pending() {
            store.commit(release(&instance)).await?;
            store.release_job(&job.id, job_token).await?;
            return Ok(JobRun::Skipped);
        }

        let Some(job_type) = self.context.job_types.get(&job.job_type) else {
            let error = JobError::fatal(format!("unknown job type '{}'", job.job_type));
            return self.record_failure(job, job_token, error, release(&instance), now).await;
        };

        if job_type.needs_live_target() && !target_is_live(&job, instance.as_ref()) {
            job.mark_done();
            store
                .commit(release(&instance).with_claimed_job(job.clone(), job_token.clone()))
                .await?;
            tracing::debug!("⏭️ Job {} ({}) skipped: target already ended", job.id, job.job_type);
            return Ok(JobRun::Skipped);
        }

        tracing::debug!("⚙️ Running job {} ({}) attempt {}", job.id, job.job_type, job.retry_count + 1);
        let snapshot = job.clone();
        let mut controller = JobController::new(&snapshot, &self.context, instance, now);
        let result = job_type.execute(&mut controller).await;
        let (instance, modified, effects) = controller.into_parts();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => return self.record_failure(job, job_token, error, release(&instance), now).await,
        };

        let run = match outcome {
            JobOutcome::Done => {
                job.mark_done();
                JobRun::Completed
            }
            JobOutcome::Reschedule(at) => {
                job.due_at = at;
                JobRun::Rescheduled(at)
            }
        };

        let commit = match (instance, &instance_token) {
            (Some(instance), Some(token)) if modified => Commit::update(instance, token.clone()),
            (instance, _) => release(&instance),
        };
        store
            .commit(
                commit
                    .with_jobs(effects.jobs)
                    .with_claimed_job(job.clone(), job_token.clone()),
            )
            .await?;

        if let (Some(instance_id), false) = (&job.instance_id, effects.tasks.is_empty()) {
            self.context
                .apply_task_effects(instance_id, effects.tasks, now)
                .await?;
        }

        tracing::info!("✅ Job {} ({}) finished: {:?}", job.id, job.job_type, run);
        Ok(run)
    }

    async fn record_failure(
        &self,
        mut job: Job,
        job_token: &ClaimToken,
        error: JobError,
        commit: Commit,
        now: DateTime<Utc>,
    ) -> Result<JobRun, EngineError> {
        let error = error.into_execution_error(&job);
        let dead = job.record_failure(&error, now, &self.context.retry);

        self.context
            .store
            .commit(commit.with_claimed_job(job.clone(), job_token.clone()))
            .await?;

        if dead {
            tracing::error!("❌ {} (dead after {} attempt(s))", error, job.retry_count);
            Ok(JobRun::Dead)
        } else {
            tracing::warn!("⚠️ {} (retry {} at {})", error, job.retry_count, job.due_at);
            Ok(JobRun::Failed {
                retry_count: job.retry_count,
                due_at: job.due_at,
            })
        }
    }
}

/// Whether the job's instance and target activity instance are still live
fn target_is_live(job: &Job, instance: Option<&WorkflowInstance>) -> bool {
    let Some(instance) = instance else {
        return job.instance_id.is_none();
    };
    if instance.is_ended() {
        return false;
    }
    match &job.activity_instance_id {
        Some(id) => instance.activity_instance(id).is_some_and(|ai| ai.is_live()),
        None => true,
    }
}
