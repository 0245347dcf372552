/// Acting principal threaded through every engine operation and task-service call

use crate::workflow::ids::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// Engine-initiated actions (jobs, escalations)
    System,
    User(UserId),
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Actor::User(UserId::new(id))
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Actor::System)
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Actor::System => None,
            Actor::User(id) => Some(id),
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::User(id) => write!(f, "user:{}", id),
        }
    }
}
