/// In-process store for embedding and tests
///
/// Everything lives behind one tokio mutex, so a commit is validated in full
/// and then applied without any other operation interleaving.

use crate::error::StoreError;
use crate::job::Job;
use crate::runtime::instance::WorkflowInstance;
use crate::store::{ClaimToken, Commit, InstanceWrite, PersistenceStore};
use crate::workflow::ids::{InstanceId, JobId, WorkflowId};
use crate::workflow::types::WorkflowSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Lease {
    owner: ClaimToken,
    until: DateTime<Utc>,
}

impl Lease {
    fn held_at(&self, now: DateTime<Utc>) -> bool {
        self.until > now
    }
}

#[derive(Debug)]
struct InstanceRecord {
    instance: WorkflowInstance,
    lease: Option<Lease>,
}

#[derive(Debug)]
struct JobRecord {
    job: Job,
    lease: Option<Lease>,
}

#[derive(Debug, Default)]
struct State {
    workflows: BTreeMap<WorkflowId, WorkflowSource>,
    instances: HashMap<InstanceId, InstanceRecord>,
    jobs: HashMap<JobId, JobRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn owned_by(lease: &Option<Lease>, token: &ClaimToken) -> bool {
    lease.as_ref().is_some_and(|l| &l.owner == token)
}

impl State {
    fn validate(&self, commit: &Commit) -> Result<(), StoreError> {
        match &commit.instance {
            Some(InstanceWrite::Insert(instance)) => {
                if self.instances.contains_key(&instance.id) {
                    return Err(StoreError::Duplicate {
                        entity: "instance",
                        id: instance.id.to_string(),
                    });
                }
            }
            Some(InstanceWrite::Update { instance, token }) => {
                let record = self.instances.get(&instance.id).ok_or_else(|| StoreError::NotFound {
                    entity: "instance",
                    id: instance.id.to_string(),
                })?;
                if !owned_by(&record.lease, token) {
                    return Err(StoreError::instance_contention(&instance.id, "instance lease was lost"));
                }
                if record.instance.version != instance.version {
                    return Err(StoreError::instance_contention(
                        &instance.id,
                        format!(
                            "stored version {} does not match {}",
                            record.instance.version, instance.version
                        ),
                    ));
                }
            }
            Some(InstanceWrite::Release { .. }) | None => {}
        }

        for (job, token) in &commit.claimed_jobs {
            let record = self.jobs.get(&job.id).ok_or_else(|| StoreError::NotFound {
                entity: "job",
                id: job.id.to_string(),
            })?;
            if !owned_by(&record.lease, token) {
                return Err(StoreError::job_contention(&job.id, "job lease was lost"));
            }
        }
        for job in &commit.new_jobs {
            if self.jobs.contains_key(&job.id) {
                return Err(StoreError::Duplicate { entity: "job", id: job.id.to_string() });
            }
        }
        Ok(())
    }

    fn apply(&mut self, commit: Commit) {
        match commit.instance {
            Some(InstanceWrite::Insert(instance)) => {
                self.instances
                    .insert(instance.id.clone(), InstanceRecord { instance, lease: None });
            }
            Some(InstanceWrite::Update { mut instance, .. }) => {
                instance.version += 1;
                self.instances
                    .insert(instance.id.clone(), InstanceRecord { instance, lease: None });
            }
            Some(InstanceWrite::Release { instance_id, token }) => {
                if let Some(record) = self.instances.get_mut(&instance_id) {
                    if owned_by(&record.lease, &token) {
                        record.lease = None;
                    }
                }
            }
            None => {}
        }

        if let Some(instance_id) = commit.cancel_pending_jobs_of {
            self.jobs
                .retain(|_, r| r.job.instance_id.as_ref() != Some(&instance_id) || !r.job.is_pending());
        }

        for (job, _) in commit.claimed_jobs {
            if job.done {
                self.jobs.remove(&job.id);
            } else {
                self.jobs.insert(job.id.clone(), JobRecord { job, lease: None });
            }
        }
        for job in commit.new_jobs {
            self.jobs.insert(job.id.clone(), JobRecord { job, lease: None });
        }
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn save_workflow_source(&self, source: &WorkflowSource) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.workflows.insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn load_workflow_sources(&self) -> Result<Vec<WorkflowSource>, StoreError> {
        Ok(self.state.lock().await.workflows.values().cloned().collect())
    }

    async fn delete_workflow_source(&self, id: &WorkflowId) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.workflows.remove(id).is_some())
    }

    async fn load_instance(&self, id: &InstanceId) -> Result<WorkflowInstance, StoreError> {
        self.state
            .lock()
            .await
            .instances
            .get(id)
            .map(|r| r.instance.clone())
            .ok_or_else(|| StoreError::NotFound { entity: "instance", id: id.to_string() })
    }

    async fn lock_instance(
        &self,
        id: &InstanceId,
        token: &ClaimToken,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .instances
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { entity: "instance", id: id.to_string() })?;

        if record.lease.as_ref().is_some_and(|l| l.held_at(now)) {
            return Err(StoreError::instance_contention(id, "instance is locked by another operation"));
        }
        record.lease = Some(Lease { owner: token.clone(), until: lease_until });
        Ok(record.instance.clone())
    }

    async fn unlock_instance(&self, id: &InstanceId, token: &ClaimToken) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.instances.get_mut(id) {
            if owned_by(&record.lease, token) {
                record.lease = None;
            }
        }
        Ok(())
    }

    async fn commit(&self, commit: Commit) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.validate(&commit)?;
        state.apply(commit);
        Ok(())
    }

    async fn schedule_job(&self, job: Job) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate { entity: "job", id: job.id.to_string() });
        }
        state.jobs.insert(job.id.clone(), JobRecord { job, lease: None });
        Ok(())
    }

    async fn load_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.jobs.get(id).map(|r| r.job.clone()))
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        token: &ClaimToken,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let mut state = self.state.lock().await;

        let mut due: Vec<(DateTime<Utc>, JobId)> = state
            .jobs
            .values()
            .filter(|r| r.job.is_due(now) && !r.lease.as_ref().is_some_and(|l| l.held_at(now)))
            .map(|r| (r.job.due_at, r.job.id.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(record) = state.jobs.get_mut(&id) {
                record.lease = Some(Lease { owner: token.clone(), until: lease_until });
                claimed.push(record.job.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_job(&self, id: &JobId, token: &ClaimToken) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.jobs.get_mut(id) {
            if owned_by(&record.lease, token) {
                record.lease = None;
            }
        }
        Ok(())
    }

    async fn jobs_for_instance(&self, id: &InstanceId) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|r| r.job.instance_id.as_ref() == Some(id))
            .map(|r| r.job.clone())
            .collect();
        jobs.sort_by(|a, b| (a.due_at, &a.id).cmp(&(b.due_at, &b.id)));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Actor;
    use chrono::Duration;
    use serde_json::Value;

    fn make_instance() -> WorkflowInstance {
        WorkflowInstance::new(WorkflowId::new("wf"), Actor::System, Utc::now())
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_lease_expires() {
        let store = MemoryStore::new();
        let instance = make_instance();
        let id = instance.id.clone();
        store.commit(Commit::insert(instance)).await.unwrap();

        let now = Utc::now();
        let first = ClaimToken::new();
        store.lock_instance(&id, &first, now, now + Duration::seconds(30)).await.unwrap();

        let err = store
            .lock_instance(&id, &ClaimToken::new(), now, now + Duration::seconds(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Contention(_)));
        let err = store
            .lock_instance(&id, &first, now, now + Duration::seconds(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Contention(_)));

        let later = now + Duration::seconds(31);
        store
            .lock_instance(&id, &ClaimToken::new(), later, later + Duration::seconds(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_checks_owner_and_version() {
        let store = MemoryStore::new();
        let instance = make_instance();
        let id = instance.id.clone();
        store.commit(Commit::insert(instance)).await.unwrap();

        let now = Utc::now();
        let token = ClaimToken::new();
        let locked = store.lock_instance(&id, &token, now, now + Duration::seconds(30)).await.unwrap();

        let err = store
            .commit(Commit::update(locked.clone(), ClaimToken::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Contention(_)));

        let mut stale = locked.clone();
        stale.version += 7;
        let err = store.commit(Commit::update(stale, token.clone())).await.unwrap_err();
        assert!(matches!(err, StoreError::Contention(_)));

        store.commit(Commit::update(locked, token.clone())).await.unwrap();
        assert_eq!(store.load_instance(&id).await.unwrap().version, 1);

        // committed update released the lease
        store
            .lock_instance(&id, &ClaimToken::new(), now, now + Duration::seconds(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_commit_applies_nothing() {
        let store = MemoryStore::new();
        let instance = make_instance();
        let id = instance.id.clone();
        store.commit(Commit::insert(instance.clone())).await.unwrap();

        let job = Job::new("timer", Value::Null, Utc::now()).for_instance(&id);
        let err = store
            .commit(Commit::insert(instance).with_jobs(vec![job]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { entity: "instance", .. }));
        assert!(store.jobs_for_instance(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_orders_by_due_date_then_id() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut late = Job::new("timer", Value::Null, now - Duration::seconds(1));
        late.id = JobId::new("b");
        let mut tie = Job::new("timer", Value::Null, now - Duration::seconds(1));
        tie.id = JobId::new("a");
        let mut early = Job::new("timer", Value::Null, now - Duration::seconds(10));
        early.id = JobId::new("z");
        let future = Job::new("timer", Value::Null, now + Duration::seconds(10));
        for job in [late, tie, early, future] {
            store.schedule_job(job).await.unwrap();
        }

        let token = ClaimToken::new();
        let claimed = store
            .claim_due_jobs(now, &token, now + Duration::seconds(30), 10)
            .await
            .unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);

        let again = store
            .claim_due_jobs(now, &ClaimToken::new(), now + Duration::seconds(30), 10)
            .await
            .unwrap();
        assert!(again.is_empty());

        store.release_job(&JobId::new("a"), &token).await.unwrap();
        let released = store
            .claim_due_jobs(now, &ClaimToken::new(), now + Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_cancel_keeps_dead_jobs() {
        let store = MemoryStore::new();
        let instance = make_instance();
        let id = instance.id.clone();
        let pending = Job::new("timer", Value::Null, Utc::now()).for_instance(&id);
        let mut dead = Job::new("timer", Value::Null, Utc::now()).for_instance(&id);
        dead.dead = true;
        store
            .commit(Commit::insert(instance).with_jobs(vec![pending, dead.clone()]))
            .await
            .unwrap();

        store.commit(Commit::default().cancelling_jobs_of(id.clone())).await.unwrap();

        let jobs = store.jobs_for_instance(&id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, dead.id);
    }
}
