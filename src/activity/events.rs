/// Pass-through activities: start/end events and the no-op task

use crate::activity::{ActivityContext, ActivityError, ActivityType, Outcome};

#[derive(Debug, Default)]
pub struct StartEvent;

impl ActivityType for StartEvent {
    fn type_name(&self) -> &'static str {
        "startEvent"
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        Ok(Outcome::Onwards)
    }
}

/// Ends its branch; the scope ends once no other branch is live
#[derive(Debug, Default)]
pub struct EndEvent;

impl ActivityType for EndEvent {
    fn type_name(&self) -> &'static str {
        "endEvent"
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        Ok(Outcome::Onwards)
    }

    fn validate(&self, _incoming: usize, outgoing: &[crate::workflow::ids::TransitionId]) -> Result<(), String> {
        if outgoing.is_empty() {
            Ok(())
        } else {
            Err("an end event cannot have outgoing transitions".to_string())
        }
    }
}

#[derive(Debug, Default)]
pub struct NoneTask;

impl ActivityType for NoneTask {
    fn type_name(&self) -> &'static str {
        "noneTask"
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        Ok(Outcome::Onwards)
    }
}
