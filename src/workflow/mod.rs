/// Workflow definition layer
///
/// This module handles workflow definitions from source to deployed model:
/// - Source schema as deployed and persisted (`types`)
/// - Bindings and transition conditions
/// - Capability registry of activity and trigger types
/// - Parser producing the immutable definition model
/// - Lock-free hot-reload registry using ArcSwap

pub mod ids;

// Source schema (serde)
pub mod types;

// Literal/variable/list bindings and transition conditions
pub mod binding;

// Parsed, immutable definition model
pub mod model;

// Trigger types binding external input onto root variables
pub mod trigger;

// Activity/trigger type registry
pub mod capabilities;

// Source → model with aggregated violations
pub mod parser;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

pub use capabilities::Capabilities;
pub use model::{Variables, Workflow};
pub use registry::WorkflowRegistry;
pub use types::WorkflowSource;
