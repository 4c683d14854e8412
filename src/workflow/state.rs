//! Per-run step records and the overall run result

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

/// Lifecycle of a step: pending -> skipped, or pending -> running -> completed | error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Skipped,
    Running,
    Completed,
    Error,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Skipped | StepStatus::Completed | StepStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Skipped => "skipped",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Error => "error",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a step task produced
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Condition was falsy
    Skipped,
    Completed(Value),
    Failed(String),
    /// Never dispatched because the run was cancelled
    Cancelled,
}

impl StepOutcome {
    pub fn status(&self) -> StepStatus {
        match self {
            StepOutcome::Skipped | StepOutcome::Cancelled => StepStatus::Skipped,
            StepOutcome::Completed(_) => StepStatus::Completed,
            StepOutcome::Failed(_) => StepStatus::Error,
        }
    }

    /// Record other steps see under this step's id: `{status, output?, error?}`
    pub fn context_entry(&self) -> Value {
        match self {
            StepOutcome::Completed(output) => json!({"status": "completed", "output": output}),
            StepOutcome::Failed(message) => json!({"status": "error", "error": message}),
            StepOutcome::Skipped | StepOutcome::Cancelled => json!({"status": "skipped"}),
        }
    }
}

/// Runtime record of one step
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip)]
    started: Option<Instant>,
}

impl StepRun {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            started: None,
        }
    }

    fn start(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        self.started = Some(Instant::now());
    }

    fn finish(&mut self, outcome: &StepOutcome) {
        self.status = outcome.status();
        match outcome {
            StepOutcome::Completed(output) => self.output = Some(output.clone()),
            StepOutcome::Failed(message) => self.error = Some(message.clone()),
            StepOutcome::Skipped | StepOutcome::Cancelled => {}
        }
        self.finished_at = Some(Utc::now());
        self.duration_ms = self.started.map(|s| s.elapsed().as_millis() as u64);
    }
}

/// A failure that fails the run
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub step_id: String,
    pub message: String,
}

/// Mutable bookkeeping for one run; owned by the engine
#[derive(Debug)]
pub struct RunState {
    workflow: String,
    runs: BTreeMap<String, StepRun>,
    errors: Vec<StepFailure>,
    cancelled: bool,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl RunState {
    pub fn new<'a>(workflow: impl Into<String>, step_ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            workflow: workflow.into(),
            runs: step_ids
                .into_iter()
                .map(|id| (id.to_string(), StepRun::pending(id)))
                .collect(),
            errors: Vec::new(),
            cancelled: false,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn mark_running(&mut self, step_id: &str) {
        if let Some(run) = self.runs.get_mut(step_id) {
            run.start();
        }
    }

    /// Record a step outcome
    /// If `continue_on_error` is true, a failure won't fail the run
    pub fn add_outcome(&mut self, step_id: &str, outcome: &StepOutcome, continue_on_error: bool) {
        if let StepOutcome::Failed(message) = outcome {
            if !continue_on_error {
                self.errors.push(StepFailure {
                    step_id: step_id.to_string(),
                    message: message.clone(),
                });
            }
        }
        if let Some(run) = self.runs.get_mut(step_id) {
            run.finish(outcome);
        }
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    #[cfg(test)]
    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.runs.get(step_id).map(|r| r.status)
    }

    /// Close the run; steps that never reached a terminal state are
    /// skipped when the run was cancelled and errors otherwise
    pub fn into_result(mut self) -> RunResult {
        let cancelled = self.cancelled;
        for run in self.runs.values_mut() {
            if run.status.is_terminal() {
                continue;
            }
            if cancelled {
                run.finish(&StepOutcome::Cancelled);
            } else {
                let message = format!("step never finished (was {})", run.status);
                self.errors.push(StepFailure {
                    step_id: run.step_id.clone(),
                    message: message.clone(),
                });
                run.finish(&StepOutcome::Failed(message));
            }
        }

        RunResult {
            workflow: self.workflow,
            no_errors: self.errors.is_empty() && !cancelled,
            steps: self.runs,
            errors: self.errors,
            cancelled,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Final result of a run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub workflow: String,
    pub steps: BTreeMap<String, StepRun>,
    pub errors: Vec<StepFailure>,
    pub no_errors: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|r| r.status)
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id).and_then(|r| r.output.as_ref())
    }

    /// Every step that ended in error, including `continueOnError` ones
    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .values()
            .filter(|r| r.status == StepStatus::Error)
            .map(|r| r.step_id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_entries() {
        assert_eq!(
            StepOutcome::Completed(json!([1])).context_entry(),
            json!({"status": "completed", "output": [1]})
        );
        assert_eq!(
            StepOutcome::Failed("boom".into()).context_entry(),
            json!({"status": "error", "error": "boom"})
        );
        assert_eq!(StepOutcome::Skipped.context_entry(), json!({"status": "skipped"}));
        assert_eq!(StepOutcome::Cancelled.status(), StepStatus::Skipped);
    }

    #[test]
    fn test_run_state_records() {
        let mut state = RunState::new("wf", ["a", "b", "c"]);
        state.mark_running("a");
        assert_eq!(state.status("a"), Some(StepStatus::Running));

        state.add_outcome("a", &StepOutcome::Completed(json!(1)), false);
        state.add_outcome("b", &StepOutcome::Failed("soft".into()), true);
        state.add_outcome("c", &StepOutcome::Skipped, false);

        let result = state.into_result();
        assert!(result.no_errors);
        assert!(result.errors.is_empty());
        assert_eq!(result.output("a"), Some(&json!(1)));
        assert_eq!(result.status("c"), Some(StepStatus::Skipped));
        assert_eq!(result.failed_steps(), vec!["b"]);
        assert!(result.steps["a"].duration_ms.is_some());
        assert!(result.steps["c"].started_at.is_none());
    }

    #[test]
    fn test_hard_failure_marks_run_failed() {
        let mut state = RunState::new("wf", ["a"]);
        state.mark_running("a");
        state.add_outcome("a", &StepOutcome::Failed("boom".into()), false);

        let result = state.into_result();
        assert!(!result.no_errors);
        assert_eq!(
            result.errors,
            vec![StepFailure {
                step_id: "a".into(),
                message: "boom".into()
            }]
        );
        assert_eq!(result.steps["a"].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_cancelled_run_skips_leftovers() {
        let mut state = RunState::new("wf", ["a", "b"]);
        state.add_outcome("a", &StepOutcome::Completed(json!(null)), false);
        state.mark_cancelled();

        let result = state.into_result();
        assert!(result.cancelled);
        assert!(!result.no_errors);
        assert_eq!(result.status("b"), Some(StepStatus::Skipped));
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_result_serialization_shape() {
        let mut state = RunState::new("wf", ["a"]);
        state.add_outcome("a", &StepOutcome::Skipped, false);
        let value = serde_json::to_value(state.into_result()).unwrap();

        assert_eq!(value["noErrors"], true);
        assert_eq!(value["steps"]["a"]["stepId"], "a");
        assert_eq!(value["steps"]["a"]["status"], "skipped");
        assert!(value["steps"]["a"].get("output").is_none());
    }
}
