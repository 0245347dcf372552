/// Error taxonomy
///
/// Every error carries the identifiers of the instance, activity instance or job
/// it concerns so it can be diagnosed from logs alone. Runtime activity errors
/// are recorded on the instance and never abort the process.

use crate::actor::Actor;
use crate::workflow::ids::{ActivityId, ActivityInstanceId, InstanceId, JobId, WorkflowId};
use crate::workflow::parser::Violation;
use std::fmt;

/// Definition-time failure listing every structural violation found
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("workflow '{workflow_id}' is invalid: {}", list_violations(.violations))]
pub struct ParseError {
    pub workflow_id: String,
    pub violations: Vec<Violation>,
}

fn list_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Binding-time failure: a variable is absent from every visible scope
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("variable '{variable_id}' is unresolved in instance '{instance_id}' (activity instance '{activity_instance_id}')")]
pub struct UnresolvedVariableError {
    pub variable_id: crate::workflow::ids::VariableId,
    pub instance_id: InstanceId,
    pub activity_instance_id: ActivityInstanceId,
}

/// Failure raised by activity behavior
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("activity '{activity_id}' ({activity_instance_id}) failed in instance '{instance_id}': {message}")]
pub struct ActivityExecutionError {
    pub instance_id: InstanceId,
    pub activity_instance_id: ActivityInstanceId,
    pub activity_id: ActivityId,
    pub message: String,
    /// Binding failures and missing transitions are never retried
    pub fatal: bool,
}

/// Failure of a job execution
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("job '{job_id}' ({job_type}) failed{}: {message}", instance_suffix(.instance_id))]
pub struct JobExecutionError {
    pub job_id: JobId,
    pub job_type: String,
    pub instance_id: Option<InstanceId>,
    pub message: String,
    pub fatal: bool,
}

fn instance_suffix(instance_id: &Option<InstanceId>) -> String {
    match instance_id {
        Some(id) => format!(" for instance '{}'", id),
        None => String::new(),
    }
}

/// What a concurrent modification collided on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimTarget {
    Instance(InstanceId),
    Job(JobId),
}

impl fmt::Display for ClaimTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimTarget::Instance(id) => write!(f, "instance '{}'", id),
            ClaimTarget::Job(id) => write!(f, "job '{}'", id),
        }
    }
}

/// Claim contention or a lost optimistic version check
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("concurrent modification of {target}: {reason}")]
pub struct ConcurrentModificationError {
    pub target: ClaimTarget,
    pub reason: String,
}

/// Persistence adapter failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    Contention(#[from] ConcurrentModificationError),
    #[error("{entity} '{id}' already exists")]
    Duplicate { entity: &'static str, id: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn instance_contention(id: &InstanceId, reason: impl Into<String>) -> Self {
        StoreError::Contention(ConcurrentModificationError {
            target: ClaimTarget::Instance(id.clone()),
            reason: reason.into(),
        })
    }

    pub fn job_contention(id: &JobId, reason: impl Into<String>) -> Self {
        StoreError::Contention(ConcurrentModificationError {
            target: ClaimTarget::Job(id.clone()),
            reason: reason.into(),
        })
    }
}

/// Collaborator (task/notification service) failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("task '{0}' not found")]
    TaskNotFound(String),
    #[error("{actor} may not {action}")]
    Unauthorized { actor: Actor, action: String },
    #[error("{0}")]
    Conflict(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Umbrella error of engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    UnresolvedVariable(#[from] UnresolvedVariableError),
    #[error(transparent)]
    ActivityExecution(#[from] ActivityExecutionError),
    #[error(transparent)]
    JobExecution(#[from] JobExecutionError),
    #[error(transparent)]
    ConcurrentModification(#[from] ConcurrentModificationError),
    #[error("workflow '{0}' is not deployed")]
    UnknownWorkflow(WorkflowId),
    #[error("instance '{0}' not found")]
    InstanceNotFound(InstanceId),
    #[error("activity instance '{activity_instance_id}' not found in instance '{instance_id}'")]
    ActivityInstanceNotFound {
        instance_id: InstanceId,
        activity_instance_id: ActivityInstanceId,
    },
    #[error("instance '{instance_id}': {message}")]
    InvalidState {
        instance_id: InstanceId,
        message: String,
    },
    #[error("instance '{instance_id}': {actor} is not authorized: {message}")]
    Unauthorized {
        instance_id: InstanceId,
        actor: Actor,
        message: String,
    },
    #[error("instance '{instance_id}': invalid trigger input: {message}")]
    InvalidInput {
        instance_id: InstanceId,
        message: String,
    },
    /// The instance change is committed; these task effects were neither
    /// applied nor handed to a `task-sync` job
    #[error("instance '{instance_id}': {pending} task effect(s) could not be deferred: {source}")]
    TaskEffectsLost {
        instance_id: InstanceId,
        pending: usize,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Contention(e) => EngineError::ConcurrentModification(e),
            StoreError::NotFound { entity: "instance", id } => {
                EngineError::InstanceNotFound(InstanceId::new(id))
            }
            other => EngineError::Store(other),
        }
    }
}

impl EngineError {
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self, EngineError::ConcurrentModification(_))
    }
}
