//! Configuration types, workflow documents and loading

mod loader;
mod workflow;

pub use loader::{AuditConfig, EngineConfig, FlowgateConfig, HttpConfig, load_workflow};
pub use workflow::{Step, ToolKind, WorkflowDefinition};
