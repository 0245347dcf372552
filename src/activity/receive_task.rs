/// receiveTask: waits for an external signal, whose input becomes variables

use crate::activity::{ActivityContext, ActivityError, ActivityType, Outcome};

#[derive(Debug, Default)]
pub struct ReceiveTask;

impl ActivityType for ReceiveTask {
    fn type_name(&self) -> &'static str {
        "receiveTask"
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        Ok(Outcome::Wait)
    }
}
