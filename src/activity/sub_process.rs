/// subProcess: composite activity running its nested scope
///
/// The activity instance becomes a scope instance with its own variable store
/// and ends once no child is live, then continues onwards.

use crate::activity::{ActivityContext, ActivityError, ActivityType, Outcome};

#[derive(Debug, Default)]
pub struct SubProcess;

impl ActivityType for SubProcess {
    fn type_name(&self) -> &'static str {
        "subProcess"
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        Ok(Outcome::EnterScope)
    }

    fn supports_scope(&self) -> bool {
        true
    }
}
