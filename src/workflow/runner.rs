//! Workflow runner - schedules ready steps onto a bounded pool of tasks

use super::context::ExecutionContext;
use super::error::ValidationError;
use super::executor::StepExecutor;
use super::graph::DependencyGraph;
use super::state::{RunResult, RunState, StepOutcome};
use crate::cli::CancellationToken;
use crate::config::{EngineConfig, Step, WorkflowDefinition};
use crate::tools::ToolRegistry;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

/// Receives run and step lifecycle events
///
/// All methods default to no-ops.
pub trait RunObserver: Send + Sync {
    fn run_started(&self, _definition: &WorkflowDefinition, _order: &[String]) {}

    fn step_started(&self, _step: &Step) {}

    fn step_finished(&self, _step: &Step, _outcome: &StepOutcome) {}

    fn run_finished(&self, _result: &RunResult) {}
}

/// Workflow runner
pub struct WorkflowRunner {
    registry: Arc<ToolRegistry>,
    settings: EngineConfig,
    observer: Option<Arc<dyn RunObserver>>,
}

impl WorkflowRunner {
    pub fn new(registry: Arc<ToolRegistry>, settings: EngineConfig) -> Self {
        Self {
            registry,
            settings,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run a workflow to completion
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<RunResult, ValidationError> {
        self.run_with_cancel(definition, inputs, CancellationToken::new())
            .await
    }

    /// Run a workflow, stopping dispatch once `token` is cancelled
    ///
    /// Only validation problems are returned as errors. Step failures are
    /// reported through the result.
    pub async fn run_with_cancel(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
        token: CancellationToken,
    ) -> Result<RunResult, ValidationError> {
        let graph = DependencyGraph::build(definition)?;
        let inputs = bind_inputs(definition, inputs)?;

        tracing::info!(
            workflow = %definition.name,
            steps = graph.len(),
            max_concurrency = self.settings.max_concurrency,
            "starting workflow"
        );
        if let Some(observer) = &self.observer {
            observer.run_started(definition, graph.topological_order());
        }

        let result = self.schedule(definition, &graph, inputs, token).await;

        tracing::info!(
            workflow = %definition.name,
            no_errors = result.no_errors,
            cancelled = result.cancelled,
            duration_ms = result.duration_ms,
            "workflow finished"
        );
        if let Some(observer) = &self.observer {
            observer.run_finished(&result);
        }
        Ok(result)
    }

    async fn schedule(
        &self,
        definition: &WorkflowDefinition,
        graph: &DependencyGraph,
        inputs: Map<String, Value>,
        token: CancellationToken,
    ) -> RunResult {
        let ids = graph.steps().iter().map(String::as_str);
        let context = Arc::new(ExecutionContext::new(
            inputs,
            definition.defaults.clone(),
            ids.clone(),
        ));
        let mut state = RunState::new(definition.name.clone(), ids);

        let position: HashMap<&str, usize> = graph
            .topological_order()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let mut waiting: HashMap<&str, usize> = graph
            .steps()
            .iter()
            .map(|id| (id.as_str(), graph.dependencies(id).count()))
            .collect();
        let mut ready: VecDeque<&str> = graph
            .topological_order()
            .iter()
            .map(String::as_str)
            .filter(|id| waiting.get(id) == Some(&0))
            .collect();

        let executor = StepExecutor::new(self.registry.clone(), self.settings.clone());
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks: JoinSet<(String, StepOutcome)> = JoinSet::new();
        // Tasks report here once they hold a permit and their condition holds
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<String>();

        loop {
            while let Some(id) = ready.pop_front() {
                if token.is_cancelled() {
                    tracing::warn!(workflow = %definition.name, "run cancelled, dispatch stopped");
                    state.mark_cancelled();
                    ready.clear();
                    break;
                }
                let Some(step) = definition.step(id) else {
                    continue;
                };

                tracing::debug!(step = %id, "dispatching step");
                let step = step.clone();
                let context = context.clone();
                let executor = executor.clone();
                let permits = permits.clone();
                let token = token.clone();
                let started_tx = started_tx.clone();
                tasks.spawn(async move {
                    let outcome = match permits.acquire_owned().await {
                        Ok(_permit) if token.is_cancelled() => StepOutcome::Cancelled,
                        Ok(_permit) => match executor.admits(&step, context.as_ref()) {
                            Ok(true) => {
                                let _ = started_tx.send(step.id.clone());
                                executor.dispatch(&step, context.as_ref(), &token).await
                            }
                            Ok(false) => StepOutcome::Skipped,
                            Err(e) => StepOutcome::Failed(e.to_string()),
                        },
                        Err(_) => StepOutcome::Cancelled,
                    };
                    if let Err(e) = context.record(&step.id, outcome.context_entry()) {
                        tracing::error!(step = %step.id, error = %e, "failed to record step");
                    }
                    (step.id, outcome)
                });
            }

            // Starts drain first; a task sends its start before it finishes
            let joined = tokio::select! {
                biased;
                Some(id) = started_rx.recv() => {
                    state.mark_running(&id);
                    if let (Some(observer), Some(step)) = (&self.observer, definition.step(&id)) {
                        observer.step_started(step);
                    }
                    continue;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (id, outcome) = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    tracing::error!(error = %e, "step task failed");
                    continue;
                }
            };

            let Some(step) = definition.step(&id) else {
                continue;
            };
            if matches!(outcome, StepOutcome::Cancelled) {
                state.mark_cancelled();
            }
            log_outcome(step, &outcome);
            state.add_outcome(&id, &outcome, step.continue_on_error);
            if let Some(observer) = &self.observer {
                observer.step_finished(step, &outcome);
            }

            let mut released: Vec<&str> = Vec::new();
            for dependent in graph.dependents(&id) {
                if let Some(count) = waiting.get_mut(dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        released.push(dependent);
                    }
                }
            }
            released.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
            ready.extend(released);
        }

        state.into_result()
    }
}

fn log_outcome(step: &Step, outcome: &StepOutcome) {
    match outcome {
        StepOutcome::Completed(_) => tracing::info!(step = %step.id, "step completed"),
        StepOutcome::Skipped => tracing::info!(step = %step.id, "step skipped"),
        StepOutcome::Cancelled => tracing::info!(step = %step.id, "step cancelled"),
        StepOutcome::Failed(message) if step.continue_on_error => {
            tracing::warn!(step = %step.id, error = %message, "step failed, continuing")
        }
        StepOutcome::Failed(message) => {
            tracing::error!(step = %step.id, error = %message, "step failed")
        }
    }
}

/// Merge caller inputs with declared defaults
pub fn bind_inputs(
    definition: &WorkflowDefinition,
    mut supplied: Map<String, Value>,
) -> Result<Map<String, Value>, ValidationError> {
    for (name, declared) in &definition.inputs {
        if supplied.contains_key(name) {
            continue;
        }
        match &declared.default {
            Some(default) => {
                supplied.insert(name.clone(), default.clone());
            }
            None if declared.required => {
                return Err(ValidationError::MissingInput { name: name.clone() });
            }
            None => {}
        }
    }
    Ok(supplied)
}
