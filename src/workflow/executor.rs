//! Step execution: conditions, input resolution, tool calls and iteration

use super::state::StepOutcome;
use crate::cli::CancellationToken;
use crate::config::{EngineConfig, Step, ToolKind};
use crate::expression::{
    ExpressionError, LoopScope, Scope, condition_holds, evaluate_source, resolve_value,
};
use crate::tools::{Tool, ToolError, ToolRegistry};
use serde_json::{Map, Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors during step execution
#[derive(Debug, Error)]
pub enum StepError {
    #[error("expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("no implementation registered for tool '{tool}'")]
    ToolUnavailable { tool: String },

    #[error("forEach source must be a sequence, got {found}")]
    NotIterable { found: &'static str },

    #[error("tool call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("invalid loop body: {message}")]
    InvalidLoopBody { message: String },

    #[error("tool '{tool}' panicked")]
    Panicked { tool: String },

    #[error("tool '{tool}' was aborted")]
    Aborted { tool: String },
}

/// Per-iteration bookkeeping for `forEach` steps
#[derive(Debug, Default)]
struct IterationSummary {
    results: Vec<Value>,
    errors: Vec<Value>,
    total: usize,
    truncated: bool,
    cancelled: bool,
}

impl IterationSummary {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    fn push_error(&mut self, index: usize, item: &Value, message: String) {
        self.errors.push(json!({
            "index": index,
            "item": item,
            "message": message,
        }));
    }

    fn into_value(self) -> Value {
        json!({
            "succeeded": self.results.len(),
            "failed": self.errors.len(),
            "results": self.results,
            "errors": self.errors,
            "total": self.total,
            "truncated": self.truncated,
            "cancelled": self.cancelled,
        })
    }
}

/// Executes single steps; cheap to clone into step tasks
#[derive(Clone)]
pub struct StepExecutor {
    registry: Arc<ToolRegistry>,
    settings: Arc<EngineConfig>,
}

impl StepExecutor {
    pub fn new(registry: Arc<ToolRegistry>, settings: EngineConfig) -> Self {
        Self {
            registry,
            settings: Arc::new(settings),
        }
    }

    /// Run one step against a scope: condition first, then the tool
    ///
    /// Never fails: every problem becomes [`StepOutcome::Failed`].
    pub fn execute<'a>(
        &'a self,
        step: &'a Step,
        scope: &'a dyn Scope,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            match self.admits(step, scope) {
                Ok(true) => self.dispatch(step, scope, token).await,
                Ok(false) => StepOutcome::Skipped,
                Err(e) => StepOutcome::Failed(e.to_string()),
            }
        })
    }

    /// Evaluate the step's condition; steps without one always run
    pub fn admits(&self, step: &Step, scope: &dyn Scope) -> Result<bool, StepError> {
        let Some(condition) = &step.condition else {
            return Ok(true);
        };
        let holds = condition_holds(condition, scope)?;
        if !holds {
            tracing::debug!(step = %step.id, "condition is false, skipping");
        }
        Ok(holds)
    }

    /// Run an admitted step's tool, once or per forEach element
    pub async fn dispatch(
        &self,
        step: &Step,
        scope: &dyn Scope,
        token: &CancellationToken,
    ) -> StepOutcome {
        let result = if step.iterates() {
            self.run_iterations(step, scope, token).await
        } else {
            self.run_once(step, scope).await
        };

        match result {
            Ok(output) => StepOutcome::Completed(output),
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    async fn run_once(&self, step: &Step, scope: &dyn Scope) -> Result<Value, StepError> {
        let inputs = resolve_value(&step.inputs, scope)?;
        let tool = self.tool_for(step)?;
        call_tool(tool, inputs, self.timeout_for(step)).await
    }

    fn tool_for(&self, step: &Step) -> Result<Arc<dyn Tool>, StepError> {
        self.registry
            .get(&step.tool)
            .ok_or_else(|| StepError::ToolUnavailable {
                tool: step.tool.clone(),
            })
    }

    fn timeout_for(&self, step: &Step) -> Option<u64> {
        step.timeout_ms.or(self.settings.step_timeout_ms)
    }

    async fn run_iterations(
        &self,
        step: &Step,
        scope: &dyn Scope,
        token: &CancellationToken,
    ) -> Result<Value, StepError> {
        let source = step
            .for_each
            .as_deref()
            .ok_or_else(|| StepError::InvalidLoopBody {
                message: "loop step has no forEach source".to_string(),
            })?;
        let mut items = iteration_items(evaluate_source(source, scope)?)?;

        let limit = step
            .max_iterations
            .unwrap_or(self.settings.default_max_iterations);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let truncated = items.len() > limit;
        if truncated {
            tracing::warn!(step = %step.id, available = items.len(), limit, "clamping iterations");
            items.truncate(limit);
        }

        let mut summary = if step.tool_kind() == Some(ToolKind::Loop) {
            let body = match step.loop_body() {
                Some(Ok(body)) => body,
                Some(Err(e)) => {
                    return Err(StepError::InvalidLoopBody {
                        message: e.to_string(),
                    });
                }
                None => {
                    return Err(StepError::InvalidLoopBody {
                        message: "missing inputs.steps".to_string(),
                    });
                }
            };
            self.run_body_iterations(step, &body, &items, scope, token)
                .await
        } else {
            self.run_tool_iterations(step, &items, scope, token).await?
        };
        summary.truncated = truncated;

        tracing::debug!(
            step = %step.id,
            succeeded = summary.results.len(),
            failed = summary.errors.len(),
            "iterations finished"
        );
        Ok(summary.into_value())
    }

    /// Invoke the step's own tool once per element
    async fn run_tool_iterations(
        &self,
        step: &Step,
        items: &[Value],
        scope: &dyn Scope,
        token: &CancellationToken,
    ) -> Result<IterationSummary, StepError> {
        let tool = self.tool_for(step)?;
        let timeout_ms = self.timeout_for(step);
        let permits = Arc::new(Semaphore::new(self.settings.loop_concurrency.max(1)));

        let mut summary = IterationSummary::new(items.len());
        let mut outcomes: Vec<Option<Result<Value, String>>> = vec![None; items.len()];
        let mut tasks = JoinSet::new();

        for (index, item) in items.iter().enumerate() {
            let resolved = {
                let iteration_scope = LoopScope::new(scope, item, index);
                resolve_value(&step.inputs, &iteration_scope)
            };
            let inputs = match resolved {
                Ok(inputs) => inputs,
                Err(e) => {
                    outcomes[index] = Some(Err(StepError::from(e).to_string()));
                    continue;
                }
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            if token.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let tool = tool.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = call_tool(tool, inputs, timeout_ms).await;
                (index, result.map_err(|e| e.to_string()))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => outcomes[index] = Some(result),
                Err(e) => tracing::error!(step = %step.id, error = %e, "iteration task failed"),
            }
        }

        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Some(Ok(output)) => summary.results.push(output),
                Some(Err(message)) => {
                    tracing::warn!(step = %step.id, index, error = %message, "iteration failed");
                    summary.push_error(index, &items[index], message);
                }
                None => {}
            }
        }

        Ok(summary)
    }

    /// Run a `loop` body sequentially once per element
    async fn run_body_iterations(
        &self,
        step: &Step,
        body: &[Step],
        items: &[Value],
        scope: &dyn Scope,
        token: &CancellationToken,
    ) -> IterationSummary {
        let mut summary = IterationSummary::new(items.len());

        for (index, item) in items.iter().enumerate() {
            if token.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            match self.run_body_once(body, item, index, scope, token).await {
                Ok(output) => summary.results.push(output),
                Err(message) => {
                    tracing::warn!(step = %step.id, index, error = %message, "loop iteration failed");
                    summary.push_error(index, item, message);
                }
            }
        }

        summary
    }

    /// One iteration; output maps body step id to its output
    async fn run_body_once(
        &self,
        body: &[Step],
        item: &Value,
        index: usize,
        scope: &dyn Scope,
        token: &CancellationToken,
    ) -> Result<Value, String> {
        let mut locals = Map::new();
        let mut outputs = Map::new();

        for body_step in body {
            let outcome = {
                let iteration_scope = LoopScope::new(scope, item, index).with_locals(&locals);
                self.execute(body_step, &iteration_scope, token).await
            };

            if let StepOutcome::Failed(message) = &outcome {
                if !body_step.continue_on_error {
                    return Err(format!("{}: {}", body_step.id, message));
                }
            }
            if let StepOutcome::Completed(output) = &outcome {
                outputs.insert(body_step.id.clone(), output.clone());
            }
            locals.insert(body_step.id.clone(), outcome.context_entry());
        }

        Ok(Value::Object(outputs))
    }
}

/// Call a tool on its own task so a panic becomes a step error
async fn call_tool(
    tool: Arc<dyn Tool>,
    inputs: Value,
    timeout_ms: Option<u64>,
) -> Result<Value, StepError> {
    let name = tool.name().to_string();
    let mut handle = tokio::spawn(async move { tool.invoke(inputs).await });

    let joined = match timeout_ms {
        Some(ms) => {
            let waited = tokio::time::timeout(Duration::from_millis(ms), &mut handle).await;
            match waited {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(StepError::Timeout { ms });
                }
            }
        }
        None => handle.await,
    };

    match joined {
        Ok(result) => Ok(result?),
        Err(e) if e.is_panic() => Err(StepError::Panicked { tool: name }),
        Err(_) => Err(StepError::Aborted { tool: name }),
    }
}

/// Elements of a resolved `forEach` source
fn iteration_items(source: Option<Value>) -> Result<Vec<Value>, StepError> {
    match source {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(Value::String(text)) => serde_json::from_str::<Vec<Value>>(text.trim())
            .map_err(|_| StepError::NotIterable { found: "string" }),
        Some(Value::Bool(_)) => Err(StepError::NotIterable { found: "boolean" }),
        Some(Value::Number(_)) => Err(StepError::NotIterable { found: "number" }),
        Some(Value::Object(_)) => Err(StepError::NotIterable { found: "object" }),
    }
}
