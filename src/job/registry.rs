/// Job type registry keyed by type name

use crate::job::continuation::{ActivityRetryJob, TimerJob};
use crate::job::escalate::TaskEscalateJob;
use crate::job::reminder::TaskReminderJob;
use crate::job::task_sync::TaskSyncJob;
use crate::job::JobType;
use std::{collections::HashMap, fmt, sync::Arc};

#[derive(Clone, Default)]
pub struct JobTypeRegistry {
    types: HashMap<String, Arc<dyn JobType>>,
}

impl fmt::Debug for JobTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.types.keys().collect();
        names.sort();
        f.debug_struct("JobTypeRegistry").field("types", &names).finish()
    }
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in job type
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(TimerJob))
            .register(Arc::new(ActivityRetryJob))
            .register(Arc::new(TaskReminderJob))
            .register(Arc::new(TaskEscalateJob))
            .register(Arc::new(TaskSyncJob));
        registry
    }

    /// Register (or replace) a job type under its own type name
    pub fn register(&mut self, job_type: Arc<dyn JobType>) -> &mut Self {
        self.types.insert(job_type.type_name().to_string(), job_type);
        self
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn JobType>> {
        self.types.get(type_name).cloned()
    }
}
