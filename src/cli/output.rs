//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON, and quiet output modes.

use crate::config::{Step, WorkflowDefinition};
use crate::workflow::{RunObserver, RunResult, StepOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

impl OutputMode {
    /// Pick the mode from the `--json`/`--quiet` flags; JSON wins
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if json {
            Self::Json
        } else if quiet {
            Self::Quiet
        } else {
            Self::Console
        }
    }
}

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutputEvent {
    WorkflowStart {
        name: String,
        steps: usize,
    },
    StepStart {
        id: String,
        name: String,
    },
    StepComplete {
        id: String,
        status: String,
        duration_ms: u64,
    },
    StepError {
        id: String,
        error: String,
    },
    WorkflowComplete {
        success: bool,
        cancelled: bool,
        duration_ms: u64,
        completed: usize,
        skipped: usize,
        failed: usize,
    },
    WorkflowError {
        error: String,
    },
    Info {
        message: String,
    },
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    /// Emit an event
    fn emit(&self, event: OutputEvent);

    /// Write final result
    fn result(&self, success: bool, output: Option<&Value>);

    /// Whether the handler wants machine-readable results
    fn structured(&self) -> bool {
        false
    }
}

/// Console output handler
pub struct ConsoleHandler {
    verbose: bool,
}

impl ConsoleHandler {
    /// Create a new console handler
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn format_duration(ms: u64) -> String {
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", ms as f64 / 1000.0)
        }
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: OutputEvent) {
        match event {
            OutputEvent::WorkflowStart { name, steps } => {
                eprintln!("Running workflow '{}' ({} steps)", name, steps);
            }
            OutputEvent::StepStart { id, name } => {
                if self.verbose {
                    if id == name {
                        eprintln!("  → {}", id);
                    } else {
                        eprintln!("  → {} ({})", id, name);
                    }
                }
            }
            OutputEvent::StepComplete {
                id,
                status,
                duration_ms,
            } => {
                let mark = match status.as_str() {
                    "completed" => "✓",
                    "skipped" => "-",
                    _ => "✗",
                };
                eprintln!(
                    "  {} {} {} ({})",
                    mark,
                    id,
                    status,
                    Self::format_duration(duration_ms)
                );
            }
            OutputEvent::StepError { id, error } => {
                eprintln!("    error in step '{}': {}", id, error);
            }
            OutputEvent::WorkflowComplete {
                success,
                cancelled,
                duration_ms,
                completed,
                skipped,
                failed,
            } => {
                eprintln!();
                let summary = format!(
                    "{} completed, {} skipped, {} failed in {}",
                    completed,
                    skipped,
                    failed,
                    Self::format_duration(duration_ms)
                );
                if cancelled {
                    eprintln!("✗ Workflow cancelled ({})", summary);
                } else if success {
                    eprintln!("✓ Workflow completed successfully ({})", summary);
                } else {
                    eprintln!("✗ Workflow failed ({})", summary);
                }
            }
            OutputEvent::WorkflowError { error } => {
                eprintln!("Error: {}", error);
            }
            OutputEvent::Info { message } => {
                eprintln!("{}", message);
            }
        }
    }

    fn result(&self, _success: bool, output: Option<&Value>) {
        if let Some(out) = output {
            match out {
                Value::String(s) => println!("{}", s),
                Value::Array(lines) if lines.iter().all(Value::is_string) => {
                    for line in lines.iter().filter_map(Value::as_str) {
                        println!("{}", line);
                    }
                }
                other => {
                    if let Ok(s) = serde_json::to_string_pretty(other) {
                        println!("{}", s);
                    }
                }
            }
        }
    }
}

/// JSON output handler; one document per line
pub struct JsonHandler;

impl JsonHandler {
    fn print_json<T: Serialize>(value: &T) {
        if let Ok(s) = serde_json::to_string(value) {
            println!("{}", s);
        }
    }
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: OutputEvent) {
        Self::print_json(&event);
    }

    fn result(&self, success: bool, output: Option<&Value>) {
        #[derive(Serialize)]
        struct FinalResult<'a> {
            #[serde(rename = "type")]
            kind: &'static str,
            success: bool,
            output: Option<&'a Value>,
        }

        Self::print_json(&FinalResult {
            kind: "result",
            success,
            output,
        });
    }

    fn structured(&self) -> bool {
        true
    }
}

/// Quiet handler that only prints errors and the final output
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, event: OutputEvent) {
        if let OutputEvent::WorkflowError { error } = event {
            eprintln!("Error: {}", error);
        }
    }

    fn result(&self, success: bool, output: Option<&Value>) {
        ConsoleHandler::new(false).result(success, output);
    }
}

/// Create an output handler based on mode
pub fn create_handler(mode: OutputMode, verbose: bool) -> Arc<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Arc::new(ConsoleHandler::new(verbose)),
        OutputMode::Json => Arc::new(JsonHandler),
        OutputMode::Quiet => Arc::new(QuietHandler),
    }
}

/// Turns runner lifecycle callbacks into output events
pub struct EventObserver {
    handler: Arc<dyn OutputHandler>,
    started: Mutex<HashMap<String, Instant>>,
}

impl EventObserver {
    pub fn new(handler: Arc<dyn OutputHandler>) -> Self {
        Self {
            handler,
            started: Mutex::new(HashMap::new()),
        }
    }

    fn elapsed_ms(&self, step_id: &str) -> u64 {
        self.started
            .lock()
            .ok()
            .and_then(|mut started| started.remove(step_id))
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }
}

impl RunObserver for EventObserver {
    fn run_started(&self, definition: &WorkflowDefinition, order: &[String]) {
        self.handler.emit(OutputEvent::WorkflowStart {
            name: definition.name.clone(),
            steps: order.len(),
        });
    }

    fn step_started(&self, step: &Step) {
        if let Ok(mut started) = self.started.lock() {
            started.insert(step.id.clone(), Instant::now());
        }
        self.handler.emit(OutputEvent::StepStart {
            id: step.id.clone(),
            name: step.display_name().to_string(),
        });
    }

    fn step_finished(&self, step: &Step, outcome: &StepOutcome) {
        self.handler.emit(OutputEvent::StepComplete {
            id: step.id.clone(),
            status: outcome.status().to_string(),
            duration_ms: self.elapsed_ms(&step.id),
        });
        if let StepOutcome::Failed(error) = outcome {
            self.handler.emit(OutputEvent::StepError {
                id: step.id.clone(),
                error: error.clone(),
            });
        }
    }

    fn run_finished(&self, result: &RunResult) {
        let count = |status: &str| {
            result
                .steps
                .values()
                .filter(|run| run.status.as_str() == status)
                .count()
        };
        self.handler.emit(OutputEvent::WorkflowComplete {
            success: result.no_errors,
            cancelled: result.cancelled,
            duration_ms: result.duration_ms,
            completed: count("completed"),
            skipped: count("skipped"),
            failed: count("error"),
        });
    }
}
