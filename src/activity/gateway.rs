/// Gateways
///
/// `parallelGateway` forks to every outgoing transition and, with more than one
/// incoming transition, joins: one joining instance per scope instance collects
/// arrivals until the threshold is reached. `exclusiveGateway` takes the first
/// outgoing transition whose condition holds, else its default.

use crate::activity::{ActivityContext, ActivityError, ActivityType, Outcome};
use crate::workflow::ids::TransitionId;
use serde::Deserialize;
use serde_json::Value;

/// Config: `{"threshold": 2}` (defaults to the number of incoming transitions)
#[derive(Debug, Default, Deserialize)]
pub struct ParallelGateway {
    #[serde(default)]
    threshold: Option<usize>,
}

impl ParallelGateway {
    pub fn from_config(config: &Value) -> Result<Self, String> {
        if config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(config.clone()).map_err(|e| e.to_string())
    }
}

impl ActivityType for ParallelGateway {
    fn type_name(&self) -> &'static str {
        "parallelGateway"
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        Ok(Outcome::Onwards)
    }

    fn join_threshold(&self, incoming: usize) -> Option<usize> {
        Some(self.threshold.unwrap_or(incoming))
    }

    fn validate(&self, incoming: usize, _outgoing: &[TransitionId]) -> Result<(), String> {
        match self.threshold {
            Some(t) if t == 0 || t > incoming.max(1) => Err(format!(
                "join threshold {} must be between 1 and the {} incoming transition(s)",
                t, incoming
            )),
            _ => Ok(()),
        }
    }
}

/// Config: `{"default": "transition-id"}`
#[derive(Debug, Default, Deserialize)]
pub struct ExclusiveGateway {
    #[serde(default)]
    default: Option<TransitionId>,
}

impl ExclusiveGateway {
    pub fn from_config(config: &Value) -> Result<Self, String> {
        if config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(config.clone()).map_err(|e| e.to_string())
    }
}

impl ActivityType for ExclusiveGateway {
    fn type_name(&self) -> &'static str {
        "exclusiveGateway"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        for transition in ctx.outgoing() {
            if Some(&transition.id) == self.default.as_ref() {
                continue;
            }
            if ctx.condition_holds(transition)? {
                return Ok(Outcome::Take(vec![transition.id.clone()]));
            }
        }
        match &self.default {
            Some(default) => Ok(Outcome::Take(vec![default.clone()])),
            None => Err(ActivityError::NoTransition),
        }
    }

    fn validate(&self, _incoming: usize, outgoing: &[TransitionId]) -> Result<(), String> {
        match &self.default {
            Some(default) if !outgoing.contains(default) => Err(format!(
                "default transition '{}' is not an outgoing transition of the gateway",
                default
            )),
            _ => Ok(()),
        }
    }
}
