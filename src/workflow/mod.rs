//! Workflow execution engine for flowgate
//!
//! This module handles:
//! - Validation and dependency graph construction
//! - Step execution (conditions, input resolution, tool calls)
//! - Concurrent scheduling of ready steps
//! - forEach and loop iteration with per-iteration failure isolation
//!
//! # Example
//!
//! ```ignore
//! use flowgate::workflow::WorkflowRunner;
//! use flowgate::config::{FlowgateConfig, load_workflow};
//!
//! let config = FlowgateConfig::load(None)?;
//! let registry = Arc::new(ToolRegistry::with_builtins(&config.http)?);
//! let runner = WorkflowRunner::new(registry, config.engine.clone());
//!
//! let workflow = load_workflow("ingest-docs", None)?;
//! let result = runner.run(&workflow, inputs).await?;
//!
//! if result.no_errors {
//!     println!("Workflow completed successfully!");
//! }
//! ```

mod context;
mod error;
mod executor;
mod graph;
mod runner;
mod state;

#[cfg(test)]
mod testing;

pub use error::ValidationError;
pub use graph::DependencyGraph;
pub use runner::{RunObserver, WorkflowRunner};
#[allow(unused_imports)]
pub use state::{RunResult, StepFailure, StepOutcome, StepRun, StepStatus};
