/// Background job scheduler service
///
/// Polls the store on an interval, claims a batch of due jobs under a lease and
/// dispatches each to a worker pool bounded by a semaphore. A crashed worker's
/// claims expire, so its jobs are picked up again by a later poll.

use crate::config::SchedulerConfig;
use crate::error::EngineError;
use crate::job::{JobRun, JobRunner};
use crate::runtime::context::EngineContext;
use crate::store::ClaimToken;
use crate::workflow::ids::JobId;
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

pub struct JobSchedulerService {
    context: EngineContext,
    runner: JobRunner,
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobSchedulerService {
    pub fn new(context: EngineContext, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            runner: JobRunner::new(context.clone()),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            context,
            config,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    /// Claim and run every job due at `now` (one batch), returning the
    /// outcome of each in claim order
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Vec<(JobId, JobRun)>, EngineError> {
        let token = ClaimToken::new();
        let jobs = self
            .context
            .store
            .claim_due_jobs(now, &token, now + self.context.lease, self.config.batch_size.max(1))
            .await?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!("📥 Claimed {} due job(s)", jobs.len());

        let ids: Vec<JobId> = jobs.iter().map(|job| job.id.clone()).collect();
        let mut tasks = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                tracing::error!("❌ Worker pool closed, {} claimed job(s) left to lease expiry", ids.len() - index);
                break;
            };
            let runner = self.runner.clone();
            let token = token.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (index, runner.run(job, &token, now).await)
            });
        }

        let mut runs: Vec<Option<JobRun>> = vec![None; ids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(run))) => runs[index] = Some(run),
                Ok((index, Err(e))) => tracing::error!("❌ Job {} could not be run: {}", ids[index], e),
                Err(e) => tracing::error!("❌ Job worker panicked: {}", e),
            }
        }

        Ok(ids
            .into_iter()
            .zip(runs)
            .filter_map(|(id, run)| run.map(|run| (id, run)))
            .collect())
    }

    /// Start polling in the background
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            tracing::warn!("⚠️ Job scheduler already running");
            return;
        }
        tracing::info!(
            "⏰ Starting job scheduler (every {}ms, {} worker(s))",
            self.config.poll_interval_ms, self.config.workers
        );

        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let this = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(this.config.poll_interval_ms.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match this.run_due(Utc::now()).await {
                            Ok(runs) if !runs.is_empty() => {
                                tracing::debug!("⚙️ Poll ran {} job(s)", runs.len())
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!("❌ Job poll failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    /// Stop polling and wait for the in-flight batch to finish
    pub async fn stop(&self) {
        tracing::info!("⏹️ Stopping job scheduler");
        self.shutdown.send_replace(true);
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!("❌ Job scheduler task failed: {}", e);
            }
        }
        tracing::info!("✅ Job scheduler stopped");
    }
}
