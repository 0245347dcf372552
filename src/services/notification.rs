/// Notification collaborator
///
/// Fire-and-forget: delivery failures are the implementation's concern and
/// never fail the job that triggered them.

use crate::services::tasks::Task;
use async_trait::async_trait;

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn task_reminder(&self, task: &Task);
}

/// Writes reminders to the tracing log
#[derive(Debug, Default)]
pub struct LogNotificationService;

#[async_trait]
impl NotificationService for LogNotificationService {
    async fn task_reminder(&self, task: &Task) {
        match &task.assignee {
            Some(assignee) => {
                tracing::info!("🔔 Reminder: task '{}' ({}) is waiting for {}", task.name, task.id, assignee)
            }
            None => tracing::info!("🔔 Reminder: task '{}' ({}) is unassigned", task.name, task.id),
        }
    }
}
