/// Activity types
///
/// Every activity in a definition carries an `ActivityType` resolved by name from
/// the capability registry at parse time. The engine drives an activity instance
/// through `execute` (and later `on_signal` / `on_job` when it waited) and acts on
/// the returned `Outcome`.

use crate::runtime::resolver::BindingError;
use crate::workflow::ids::{TransitionId, VariableId};
use crate::workflow::model::Variables;
use std::fmt;

pub mod context;
pub mod events;
pub mod gateway;
pub mod receive_task;
pub mod sub_process;
pub mod timer;
pub mod user_task;
pub mod variable;

pub use context::ActivityContext;

/// What the engine does with an activity instance after its behavior returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// End now and take every outgoing transition whose condition holds
    Onwards,
    /// End now and take exactly these transitions (declared order is kept)
    Take(Vec<TransitionId>),
    /// Stay WAITING until a signal or a job re-enters the instance
    Wait,
    /// Start the nested scope; the activity ends when that scope completes
    EnterScope,
}

/// Failure raised by activity behavior
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    /// Transient failure, retried through an `activity-retry` job
    #[error("{0}")]
    Failed(String),
    /// Binding failure: definition/runtime mismatch, never retried
    #[error(transparent)]
    Binding(#[from] BindingError),
    /// No outgoing transition could be selected
    #[error("no outgoing transition matched and no default transition is configured")]
    NoTransition,
    /// Behavior chose a transition that does not leave the activity
    #[error("transition '{0}' is not an outgoing transition of the activity")]
    InvalidTransition(TransitionId),
    /// The acting user may not perform this continuation
    #[error("{0}")]
    Unauthorized(String),
}

impl ActivityError {
    pub fn failed(message: impl Into<String>) -> Self {
        ActivityError::Failed(message.into())
    }

    /// Fatal errors suspend the instance instead of scheduling a retry
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ActivityError::Binding(_) | ActivityError::NoTransition | ActivityError::InvalidTransition(_)
        )
    }
}

/// Behavior contract implemented by every activity type
pub trait ActivityType: Send + Sync + fmt::Debug {
    /// Registry name, e.g. "userTask"
    fn type_name(&self) -> &'static str;

    /// Run the activity for a freshly started activity instance
    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError>;

    /// Resume a WAITING activity instance from an external signal
    fn on_signal(
        &self,
        ctx: &mut ActivityContext<'_>,
        input: &Variables,
    ) -> Result<Outcome, ActivityError> {
        ctx.set_variables(input);
        Ok(Outcome::Onwards)
    }

    /// Resume a WAITING activity instance from a continuation job (timers)
    fn on_job(&self, ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        let _ = ctx;
        Ok(Outcome::Onwards)
    }

    /// Number of arriving branches required before the activity starts.
    /// Only consulted for activities with more than one incoming transition.
    fn join_threshold(&self, incoming: usize) -> Option<usize> {
        let _ = incoming;
        None
    }

    /// Whether the activity may carry a nested scope
    fn supports_scope(&self) -> bool {
        false
    }

    /// Variables referenced by the activity configuration
    fn referenced_variables(&self) -> Vec<&VariableId> {
        Vec::new()
    }

    /// Structural check against the activity's position in its scope
    fn validate(&self, incoming: usize, outgoing: &[TransitionId]) -> Result<(), String> {
        let _ = (incoming, outgoing);
        Ok(())
    }
}
