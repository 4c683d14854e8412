//! CLI module for flowgate
//!
//! This module provides:
//! - Command implementations (run, validate, audit, capabilities, graph)
//! - Output handlers (console, JSON, quiet)
//! - Signal handling for graceful shutdown
//!
//! # Example
//!
//! ```ignore
//! use flowgate::cli::{commands, output, signals};
//!
//! let handler = output::create_handler(output::OutputMode::Console, false);
//! let exit_code = commands::run_workflow("ingest", &args, dir, &config, &options, handler, token).await?;
//! ```

pub mod commands;
pub mod output;
pub mod signals;

pub use commands::{
    RunOptions, audit_workflow, run_workflow, show_capabilities, show_graph, validate_workflow,
};
pub use output::{OutputMode, create_handler};
pub use signals::{CancellationToken, setup_signal_handlers};
