/// External collaborators injected into the engine
///
/// Built once at startup and passed explicitly through `EngineContext`.

pub mod notification;
pub mod tasks;

pub use notification::{LogNotificationService, NotificationService};
pub use tasks::{InMemoryTaskService, Task, TaskQuery, TaskService};

use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub tasks: Arc<dyn TaskService>,
    pub notifications: Arc<dyn NotificationService>,
}

impl Services {
    pub fn new(tasks: Arc<dyn TaskService>, notifications: Arc<dyn NotificationService>) -> Self {
        Self { tasks, notifications }
    }

    /// In-memory tasks and log-only notifications
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryTaskService::new()),
            Arc::new(LogNotificationService),
        )
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
