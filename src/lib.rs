/// Mechaflow: embeddable business-process workflow engine
///
/// Deploys declarative workflow definitions (scopes of activities joined by
/// conditional transitions), runs instances as persistent activity trees,
/// suspends them on human tasks and timers, and resumes them from signals and
/// a leased, retrying job scheduler.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Caller identity threaded through every operation
pub mod actor;

// Workflow definitions: source schema, parser, registry
pub mod workflow;

// Activity types and their execution context
pub mod activity;

// Runtime: instance tree, executor, engine, scheduler
pub mod runtime;

// Deferred and retryable work
pub mod job;

// Persistence trait and adapters
pub mod store;

// Injected task and notification collaborators
pub mod services;

// Process bootstrap
pub mod service;

pub use actor::Actor;
pub use error::EngineError;
pub use runtime::{EngineContext, ExecutionEngine, JobSchedulerService, WorkflowInstance};
pub use service::start_service;
pub use workflow::{Capabilities, Variables, Workflow, WorkflowRegistry, WorkflowSource};
