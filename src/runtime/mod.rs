/// Runtime execution layer
///
/// This module drives workflow instances:
/// - Runtime tree of instances, activity instances and variable stores
/// - The executor state machine over the definition model
/// - Binding resolution against scope chains
/// - The engine entry points and the background job scheduler

// Runtime tree: instances, activity instances, events
pub mod instance;

// Binding resolution against scope chains
pub mod resolver;

// Side effects collected during execution
pub mod effects;

// Activity/scope state machine
pub mod executor;

// Explicit collaborator context
pub mod context;

// Public engine operations
pub mod engine;

// Background job scheduler service
pub mod scheduler;

pub use context::EngineContext;
pub use engine::ExecutionEngine;
pub use instance::{ActivityInstance, ActivityState, EndReason, EventKind, InstanceState, WorkflowInstance};
pub use scheduler::JobSchedulerService;
