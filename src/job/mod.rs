/// Job subsystem
///
/// A job is deferred or retryable work bound to an instance: timers, task
/// reminders and escalations, activity retries and task side-effect retries.
/// Jobs hold only ids and plain data; the runner resolves everything else
/// through the store while the job and its instance are claimed.

pub mod backoff;
pub mod continuation;
pub mod controller;
pub mod escalate;
pub mod registry;
pub mod reminder;
pub mod runner;
pub mod task_sync;

pub use backoff::RetryPolicy;
pub use controller::JobController;
pub use registry::JobTypeRegistry;
pub use runner::{JobRun, JobRunner};

use crate::error::{EngineError, JobExecutionError, ServiceError};
use crate::runtime::resolver::BindingError;
use crate::workflow::ids::{ActivityInstanceId, InstanceId, JobId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persistent job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub instance_id: Option<InstanceId>,
    pub activity_instance_id: Option<ActivityInstanceId>,
    pub job_type: String,
    #[serde(default)]
    pub data: Value,
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub done: bool,
    /// Permanently failed; never claimed again and kept for inspection
    #[serde(default)]
    pub dead: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_type: impl Into<String>, data: Value, due_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            instance_id: None,
            activity_instance_id: None,
            job_type: job_type.into(),
            data,
            due_at,
            retry_count: 0,
            done: false,
            dead: false,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_instance(mut self, instance_id: &InstanceId) -> Self {
        self.instance_id = Some(instance_id.clone());
        self
    }

    pub fn for_activity(mut self, instance_id: &InstanceId, activity_instance_id: &ActivityInstanceId) -> Self {
        self.instance_id = Some(instance_id.clone());
        self.activity_instance_id = Some(activity_instance_id.clone());
        self
    }

    /// Neither done nor dead
    pub fn is_pending(&self) -> bool {
        !self.done && !self.dead
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.due_at <= now
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }

    /// Count a failed execution. Returns true when the job just became dead.
    ///
    /// retry_count and due_at strictly increase on every non-final failure:
    /// due_at = max(due_at, now) + backoff(retry_count).
    pub fn record_failure(&mut self, error: &JobExecutionError, now: DateTime<Utc>, policy: &RetryPolicy) -> bool {
        if self.dead {
            return false;
        }
        self.retry_count += 1;
        self.last_error = Some(error.to_string());

        if error.fatal || policy.exhausted(self.retry_count) {
            self.dead = true;
            return true;
        }
        self.due_at = self.due_at.max(now) + policy.backoff(self.retry_count);
        false
    }

    /// Typed view of the job data
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| JobError::fatal(format!("malformed job data: {}", e)))
    }
}

/// Result of a successful job execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    /// Run again at the given time; not counted as a failure
    Reschedule(DateTime<Utc>),
}

/// `now` plus a delay in seconds, or None past the representable date range
pub fn due_in(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let delay = Duration::try_seconds(i64::try_from(secs).ok()?)?;
    now.checked_add_signed(delay)
}

/// Failure returned by a job type
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
    /// Skip retries and go dead immediately
    pub fatal: bool,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), fatal: false }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), fatal: true }
    }

    pub(crate) fn into_execution_error(self, job: &Job) -> JobExecutionError {
        JobExecutionError {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            instance_id: job.instance_id.clone(),
            message: self.message,
            fatal: self.fatal,
        }
    }
}

impl From<BindingError> for JobError {
    fn from(error: BindingError) -> Self {
        JobError::fatal(error.to_string())
    }
}

impl From<ServiceError> for JobError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Unavailable(_) => JobError::retryable(error.to_string()),
            other => JobError::fatal(other.to_string()),
        }
    }
}

impl From<EngineError> for JobError {
    fn from(error: EngineError) -> Self {
        match &error {
            EngineError::ActivityExecution(e) if !e.fatal => JobError::retryable(error.to_string()),
            EngineError::ConcurrentModification(_) | EngineError::Store(_) => {
                JobError::retryable(error.to_string())
            }
            EngineError::InvalidState { .. } => JobError::retryable(error.to_string()),
            _ => JobError::fatal(error.to_string()),
        }
    }
}

/// Behavior of one job type, dispatched by name
#[async_trait]
pub trait JobType: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Whether the job is skipped (and marked done) once its instance or
    /// target activity instance has ended
    fn needs_live_target(&self) -> bool {
        true
    }

    async fn execute(&self, controller: &mut JobController<'_>) -> Result<JobOutcome, JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_error(job: &Job, fatal: bool) -> JobExecutionError {
        JobError { message: "boom".into(), fatal }.into_execution_error(job)
    }

    #[test]
    fn test_retry_monotonicity_then_dead_once() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 60_000,
        };
        let now = Utc::now();
        let mut job = Job::new("timer", Value::Null, now);

        let mut previous_due = job.due_at;
        for attempt in 1..=3 {
            let error = make_error(&job, false);
            assert!(!job.record_failure(&error, now, &policy));
            assert_eq!(job.retry_count, attempt);
            assert!(job.due_at > previous_due);
            previous_due = job.due_at;
        }

        let error = make_error(&job, false);
        assert!(job.record_failure(&error, now, &policy));
        assert!(job.dead);
        assert_eq!(job.due_at, previous_due);

        // Already dead: no second transition
        let error = make_error(&job, false);
        assert!(!job.record_failure(&error, now + Duration::hours(1), &policy));
        assert_eq!(job.retry_count, 4);
        assert!(job.last_error.as_deref().unwrap().ends_with("boom"));
    }

    #[test]
    fn test_fatal_error_goes_dead_immediately() {
        let mut job = Job::new("task-escalate", Value::Null, Utc::now());
        let error = make_error(&job, true);
        assert!(job.record_failure(&error, Utc::now(), &RetryPolicy::default()));
        assert!(job.dead);
        assert_eq!(job.retry_count, 1);
        assert!(!job.is_due(Utc::now() + Duration::days(1)));
    }

    #[test]
    fn test_due_uses_later_of_due_and_now() {
        let policy = RetryPolicy::default();
        let created = Utc::now();
        let mut job = Job::new("timer", Value::Null, created);
        let late = created + Duration::minutes(10);
        let error = make_error(&job, false);
        job.record_failure(&error, late, &policy);
        assert_eq!(job.due_at, late + policy.backoff(1));
    }

    #[test]
    fn test_due_in_rejects_out_of_range_delays() {
        let now = Utc::now();
        assert_eq!(due_in(now, 90), Some(now + Duration::seconds(90)));
        assert_eq!(due_in(now, 10_000_000_000_000), None);
        assert_eq!(due_in(now, 18_000_000_000_000_000), None);
        assert_eq!(due_in(now, u64::MAX), None);
    }
}
