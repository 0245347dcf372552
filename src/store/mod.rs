/// Persistence layer
///
/// The engine talks to storage only through `PersistenceStore`. Every change an
/// engine operation or job produces is written by a single `commit`, which is
/// applied entirely or not at all.
///
/// Claims are time-bounded leases identified by a `ClaimToken`:
/// - an instance is locked before its tree is touched and released by the
///   commit that writes it (or by `unlock_instance` when the operation fails)
/// - a job is claimed by the scheduler before dispatch and released by the
///   commit that records its result (or by `release_job`)
///
/// An expired lease can be taken over, so a crashed worker never blocks an
/// instance or a job for longer than one lease.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::job::Job;
use crate::runtime::instance::WorkflowInstance;
use crate::workflow::ids::{InstanceId, JobId, WorkflowId};
use crate::workflow::types::WorkflowSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Owner identity of a lease
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimToken(String);

impl ClaimToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instance part of a commit
#[derive(Debug, Clone)]
pub enum InstanceWrite {
    /// New instance; fails with `Duplicate` if the id exists
    Insert(WorkflowInstance),
    /// Overwrite a locked instance. The stored version must equal
    /// `instance.version`; the stored copy gets `version + 1` and is unlocked.
    Update {
        instance: WorkflowInstance,
        token: ClaimToken,
    },
    /// Unlock without changing the instance; a no-op if the lease was lost
    Release {
        instance_id: InstanceId,
        token: ClaimToken,
    },
}

/// One atomic unit of writes
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub instance: Option<InstanceWrite>,
    /// Jobs scheduled by this change
    pub new_jobs: Vec<Job>,
    /// Claimed jobs to write back and release. Done jobs are removed,
    /// everything else (including dead jobs) is kept.
    pub claimed_jobs: Vec<(Job, ClaimToken)>,
    /// Delete every pending (not done, not dead) job of this instance
    pub cancel_pending_jobs_of: Option<InstanceId>,
}

impl Commit {
    pub fn insert(instance: WorkflowInstance) -> Self {
        Self {
            instance: Some(InstanceWrite::Insert(instance)),
            ..Self::default()
        }
    }

    pub fn update(instance: WorkflowInstance, token: ClaimToken) -> Self {
        Self {
            instance: Some(InstanceWrite::Update { instance, token }),
            ..Self::default()
        }
    }

    pub fn release(instance_id: InstanceId, token: ClaimToken) -> Self {
        Self {
            instance: Some(InstanceWrite::Release { instance_id, token }),
            ..Self::default()
        }
    }

    pub fn with_jobs(mut self, jobs: Vec<Job>) -> Self {
        self.new_jobs.extend(jobs);
        self
    }

    pub fn with_claimed_job(mut self, job: Job, token: ClaimToken) -> Self {
        self.claimed_jobs.push((job, token));
        self
    }

    pub fn cancelling_jobs_of(mut self, instance_id: InstanceId) -> Self {
        self.cancel_pending_jobs_of = Some(instance_id);
        self
    }
}

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Insert or replace a workflow definition source
    async fn save_workflow_source(&self, source: &WorkflowSource) -> Result<(), StoreError>;

    async fn load_workflow_sources(&self) -> Result<Vec<WorkflowSource>, StoreError>;

    async fn delete_workflow_source(&self, id: &WorkflowId) -> Result<bool, StoreError>;

    /// Snapshot of an instance, ignoring locks
    async fn load_instance(&self, id: &InstanceId) -> Result<WorkflowInstance, StoreError>;

    /// Take the instance lease. Fails with `Contention` while any unexpired
    /// lease is held, including one held by the same token.
    async fn lock_instance(
        &self,
        id: &InstanceId,
        token: &ClaimToken,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<WorkflowInstance, StoreError>;

    /// Drop the instance lease if `token` still holds it
    async fn unlock_instance(&self, id: &InstanceId, token: &ClaimToken) -> Result<(), StoreError>;

    async fn commit(&self, commit: Commit) -> Result<(), StoreError>;

    /// Persist a job outside an instance commit
    async fn schedule_job(&self, job: Job) -> Result<(), StoreError>;

    async fn load_job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Claim up to `limit` pending jobs due at `now`, ordered by due date then id.
    /// Jobs under an unexpired lease are skipped.
    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        token: &ClaimToken,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Drop a job lease unchanged. Missing jobs are ignored.
    async fn release_job(&self, id: &JobId, token: &ClaimToken) -> Result<(), StoreError>;

    /// Every stored job of an instance, dead ones included
    async fn jobs_for_instance(&self, id: &InstanceId) -> Result<Vec<Job>, StoreError>;
}
