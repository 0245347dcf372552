/// Identifier types shared by the definition model, runtime tree and job subsystem
///
/// All identifiers are opaque strings compared by value. Generated identifiers
/// (instances, jobs, tasks) use UUID v4; activity instance ids are allocated
/// sequentially per workflow instance.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

macro_rules! string_id {
    (@unordered $(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
    ($(#[$meta:meta])* $name:ident) => {
        string_id!(@unordered $(#[$meta])* #[derive(PartialOrd, Ord)] $name);
    };
}

string_id!(
    /// Identifier of a deployed workflow definition (e.g. "wf-approval")
    WorkflowId
);
string_id!(
    /// Identifier of an activity, unique within its enclosing scope
    ActivityId
);
string_id!(
    /// Identifier of a declared variable
    VariableId
);
string_id!(
    /// Identifier of a transition, unique within its enclosing scope
    TransitionId
);
string_id!(
    /// Identifier of a workflow instance
    InstanceId
);
string_id!(
    @unordered
    /// Identifier of an activity instance, unique within its workflow instance.
    /// Sequential ids order by number, so maps keyed by them iterate in creation order.
    ActivityInstanceId
);
string_id!(
    /// Identifier of a deferred job
    JobId
);
string_id!(
    /// Identifier of a human task managed by the task service
    TaskId
);
string_id!(UserId);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl ActivityInstanceId {
    /// Sequential id within one workflow instance: `ai-1`, `ai-2`, ...
    pub fn sequential(n: u64) -> Self {
        Self(format!("ai-{}", n))
    }

    fn sequence(&self) -> Option<u64> {
        self.0.strip_prefix("ai-")?.parse().ok()
    }
}

impl Ord for ActivityInstanceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence()
            .cmp(&other.sequence())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for ActivityInstanceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
