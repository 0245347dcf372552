/// Capability registry
///
/// Maps activity and trigger type names to factories that build the behavior
/// object from an activity's `config`. Unknown names are parse errors.

use crate::activity::{
    events::{EndEvent, NoneTask, StartEvent},
    gateway::{ExclusiveGateway, ParallelGateway},
    receive_task::ReceiveTask,
    sub_process::SubProcess,
    timer::Timer,
    user_task::UserTask,
    variable::SetVariable,
    ActivityType,
};
use crate::workflow::trigger::{ManualTrigger, MappingTrigger, TriggerType};
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

/// Builds an activity type from its JSON configuration
pub type ActivityFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn ActivityType>, String> + Send + Sync>;

/// Builds a trigger type from its JSON configuration
pub type TriggerFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn TriggerType>, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Capabilities {
    activities: HashMap<String, ActivityFactory>,
    triggers: HashMap<String, TriggerFactory>,
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut activities: Vec<_> = self.activities.keys().collect();
        activities.sort();
        let mut triggers: Vec<_> = self.triggers.keys().collect();
        triggers.sort();
        f.debug_struct("Capabilities")
            .field("activities", &activities)
            .field("triggers", &triggers)
            .finish()
    }
}

impl Capabilities {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in activity and trigger type
    pub fn builtin() -> Self {
        let mut caps = Self::new();

        caps.register_activity("startEvent", |_| Ok(Arc::new(StartEvent)));
        caps.register_activity("endEvent", |_| Ok(Arc::new(EndEvent)));
        caps.register_activity("noneTask", |_| Ok(Arc::new(NoneTask)));
        caps.register_activity("receiveTask", |_| Ok(Arc::new(ReceiveTask)));
        caps.register_activity("subProcess", |_| Ok(Arc::new(SubProcess)));
        caps.register_activity("setVariable", |c| Ok(Arc::new(SetVariable::from_config(c)?)));
        caps.register_activity("userTask", |c| Ok(Arc::new(UserTask::from_config(c)?)));
        caps.register_activity("timer", |c| Ok(Arc::new(Timer::from_config(c)?)));
        caps.register_activity("parallelGateway", |c| {
            Ok(Arc::new(ParallelGateway::from_config(c)?))
        });
        caps.register_activity("exclusiveGateway", |c| {
            Ok(Arc::new(ExclusiveGateway::from_config(c)?))
        });

        caps.register_trigger("manual", |_| Ok(Arc::new(ManualTrigger)));
        caps.register_trigger("mapping", |c| Ok(Arc::new(MappingTrigger::from_config(c)?)));

        caps
    }

    /// Register (or replace) an activity type factory
    pub fn register_activity<F>(&mut self, type_name: &str, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Arc<dyn ActivityType>, String> + Send + Sync + 'static,
    {
        self.activities.insert(type_name.to_string(), Arc::new(factory));
        self
    }

    /// Register (or replace) a trigger type factory
    pub fn register_trigger<F>(&mut self, type_name: &str, factory: F) -> &mut Self
    where
        F: Fn(&Value) -> Result<Arc<dyn TriggerType>, String> + Send + Sync + 'static,
    {
        self.triggers.insert(type_name.to_string(), Arc::new(factory));
        self
    }

    pub fn activity(&self, type_name: &str) -> Option<&ActivityFactory> {
        self.activities.get(type_name)
    }

    pub fn trigger(&self, type_name: &str) -> Option<&TriggerFactory> {
        self.triggers.get(type_name)
    }
}
