//! CLI command implementations

use super::output::{EventObserver, OutputEvent, OutputHandler};
use super::signals::CancellationToken;
use crate::audit::{AuditReport, Auditor, derive_capabilities};
use crate::config::{FlowgateConfig, WorkflowDefinition, load_workflow};
use crate::tools::ToolRegistry;
use crate::workflow::{DependencyGraph, RunResult, ValidationError, WorkflowRunner};
use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use std::path::Path;
use std::sync::Arc;

/// Flags of the `run` command that override configuration
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run even when the audit finds blocking issues
    pub trusted: bool,
    pub max_concurrency: Option<usize>,
}

/// Run a workflow
pub async fn run_workflow(
    workflow_name: &str,
    args: &[String],
    project_dir: Option<&Path>,
    config: &FlowgateConfig,
    options: &RunOptions,
    handler: Arc<dyn OutputHandler>,
    token: CancellationToken,
) -> Result<i32> {
    let workflow = load_workflow(workflow_name, project_dir)
        .with_context(|| format!("Failed to load workflow '{}'", workflow_name))?;
    let inputs = parse_workflow_args(&workflow, args)?;

    let graph = match DependencyGraph::build(&workflow) {
        Ok(graph) => graph,
        Err(e) => return Ok(report_invalid(&workflow, &e, handler.as_ref())),
    };

    let report = Auditor::new(&config.audit).audit_definition(&workflow);
    let threshold = config.audit.block_on;
    if report.blocks(threshold) {
        if !options.trusted {
            for finding in report.at_least(threshold) {
                handler.emit(OutputEvent::Info {
                    message: format!("  {}", finding),
                });
            }
            handler.emit(OutputEvent::WorkflowError {
                error: format!(
                    "refusing to run '{}': audit findings at or above '{}' (pass --trusted to override)",
                    workflow.name, threshold
                ),
            });
            return Ok(1);
        }
        tracing::warn!(
            workflow = %workflow.name,
            threshold = %threshold,
            "running despite blocking audit findings (--trusted)"
        );
    }

    let registry = ToolRegistry::with_builtins(&config.http)
        .context("Failed to initialize built-in tools")?;
    let mut settings = config.engine.clone();
    if let Some(max_concurrency) = options.max_concurrency {
        settings.max_concurrency = max_concurrency;
    }

    let runner = WorkflowRunner::new(Arc::new(registry), settings)
        .with_observer(Arc::new(EventObserver::new(handler.clone())));
    let result = match runner.run_with_cancel(&workflow, inputs, token).await {
        Ok(result) => result,
        Err(e) => return Ok(report_invalid(&workflow, &e, handler.as_ref())),
    };

    if handler.structured() {
        handler.result(result.no_errors, Some(&serde_json::to_value(&result)?));
    } else {
        handler.result(result.no_errors, final_output(&graph, &result));
    }

    Ok(if result.no_errors { 0 } else { 1 })
}

/// Output of the last completed step in execution order
fn final_output<'a>(graph: &DependencyGraph, result: &'a RunResult) -> Option<&'a Value> {
    graph
        .topological_order()
        .iter()
        .rev()
        .find_map(|id| result.output(id))
}

fn report_invalid(
    workflow: &WorkflowDefinition,
    error: &ValidationError,
    handler: &dyn OutputHandler,
) -> i32 {
    tracing::error!(workflow = %workflow.name, error = %error, "workflow is invalid");
    handler.emit(OutputEvent::WorkflowError {
        error: format!("workflow '{}' is invalid: {}", workflow.name, error),
    });
    1
}

/// Parse `key=value` workflow arguments
///
/// Values are read as JSON when possible, so `limit=5` is a number and
/// `tags=["a","b"]` a list. Inputs declared as `string` are always taken
/// literally.
fn parse_workflow_args(
    workflow: &WorkflowDefinition,
    args: &[String],
) -> Result<Map<String, Value>> {
    let mut parsed = Map::new();

    for arg in args {
        let Some((key, raw)) = arg.split_once('=') else {
            anyhow::bail!("invalid argument '{}': expected key=value", arg);
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("invalid argument '{}': empty key", arg);
        }

        let literal = workflow.inputs.get(key).is_some_and(|input| input.is_string());
        let value = if literal {
            Value::String(raw.to_string())
        } else {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
        };
        parsed.insert(key.to_string(), value);
    }

    Ok(parsed)
}

/// Load a workflow and validate it without running
fn load_valid(
    workflow_name: &str,
    project_dir: Option<&Path>,
    handler: &dyn OutputHandler,
) -> Result<Result<(WorkflowDefinition, DependencyGraph), i32>> {
    let workflow = load_workflow(workflow_name, project_dir)
        .with_context(|| format!("Failed to load workflow '{}'", workflow_name))?;
    Ok(match DependencyGraph::build(&workflow) {
        Ok(graph) => Ok((workflow, graph)),
        Err(e) => Err(report_invalid(&workflow, &e, handler)),
    })
}

/// Validate a workflow
pub fn validate_workflow(
    workflow_name: &str,
    project_dir: Option<&Path>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let workflow = load_workflow(workflow_name, project_dir)
        .with_context(|| format!("Failed to load workflow '{}'", workflow_name))?;

    match DependencyGraph::build(&workflow) {
        Ok(graph) => {
            handler.emit(OutputEvent::Info {
                message: format!(
                    "✓ Workflow '{}' is valid ({} steps)",
                    workflow.name,
                    graph.len()
                ),
            });
            handler.result(true, None);
            Ok(0)
        }
        Err(ValidationError::Invalid { issues }) => {
            handler.emit(OutputEvent::Info {
                message: format!(
                    "✗ Workflow '{}' has {} error(s):",
                    workflow.name,
                    issues.len()
                ),
            });
            for issue in &issues {
                handler.emit(OutputEvent::Info {
                    message: format!("  - {}", issue),
                });
            }
            handler.result(false, None);
            Ok(1)
        }
        Err(e) => {
            handler.emit(OutputEvent::Info {
                message: format!("✗ Workflow '{}': {}", workflow.name, e),
            });
            handler.result(false, None);
            Ok(1)
        }
    }
}

/// Audit a workflow and optionally its package directory
pub fn audit_workflow(
    workflow_name: &str,
    project_dir: Option<&Path>,
    package_dir: Option<&Path>,
    config: &FlowgateConfig,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let (workflow, _) = match load_valid(workflow_name, project_dir, handler)? {
        Ok(valid) => valid,
        Err(code) => return Ok(code),
    };

    let package_dir = package_dir.map(|dir| shellexpand::tilde(&dir.to_string_lossy()).into_owned());
    let report = Auditor::new(&config.audit).audit(&workflow, package_dir.as_deref().map(Path::new))?;
    let blocked = report.blocks(config.audit.block_on);

    if handler.structured() {
        let mut value = serde_json::to_value(&report)?;
        value["maxSeverity"] = json!(report.max_severity());
        value["blocked"] = json!(blocked);
        handler.result(!blocked, Some(&value));
    } else {
        handler.result(!blocked, Some(&Value::from(audit_lines(&workflow, &report))));
    }

    Ok(if blocked { 1 } else { 0 })
}

fn audit_lines(workflow: &WorkflowDefinition, report: &AuditReport) -> Vec<String> {
    if report.is_empty() {
        return vec![format!("✓ No findings for '{}'", workflow.name)];
    }

    let mut lines: Vec<String> = report.findings.iter().map(ToString::to_string).collect();
    let counts = report
        .counts()
        .into_iter()
        .rev()
        .map(|(severity, count)| format!("{} {}", count, severity))
        .collect::<Vec<_>>()
        .join(", ");
    lines.push(format!("{} finding(s): {}", report.findings.len(), counts));
    lines
}

/// List the capabilities a workflow needs
pub fn show_capabilities(
    workflow_name: &str,
    project_dir: Option<&Path>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let (workflow, _) = match load_valid(workflow_name, project_dir, handler)? {
        Ok(valid) => valid,
        Err(code) => return Ok(code),
    };

    let capabilities: Vec<&str> = derive_capabilities(&workflow)
        .into_iter()
        .map(|c| c.as_str())
        .collect();
    handler.result(true, Some(&json!(capabilities)));
    Ok(0)
}

/// Show execution order and edges
pub fn show_graph(
    workflow_name: &str,
    project_dir: Option<&Path>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let (_, graph) = match load_valid(workflow_name, project_dir, handler)? {
        Ok(valid) => valid,
        Err(code) => return Ok(code),
    };

    if handler.structured() {
        let value = json!({
            "order": graph.topological_order(),
            "roots": graph.roots(),
            "edges": graph
                .edges()
                .into_iter()
                .map(|(from, to)| json!([from, to]))
                .collect::<Vec<_>>(),
        });
        handler.result(true, Some(&value));
        return Ok(0);
    }

    let mut lines = Vec::new();
    for (position, id) in graph.topological_order().iter().enumerate() {
        let deps: Vec<&str> = graph.dependencies(id).collect();
        if deps.is_empty() {
            lines.push(format!("{}. {}", position + 1, id));
        } else {
            lines.push(format!("{}. {} <- {}", position + 1, id, deps.join(", ")));
        }
    }
    handler.result(true, Some(&Value::from(lines)));
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::output::tests::MockHandler;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn project(workflows: &[(&str, Value)]) -> TempDir {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".flowgate/workflows");
        std::fs::create_dir_all(&dir).unwrap();
        for (name, doc) in workflows {
            std::fs::write(dir.join(format!("{}.json", name)), doc.to_string()).unwrap();
        }
        temp
    }

    fn workflow_with_inputs() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": "wf",
            "inputs": {"code": {"type": "string"}, "limit": {"type": "number"}}
        }))
        .unwrap()
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_workflow_args_json_values() {
        let parsed = parse_workflow_args(
            &workflow_with_inputs(),
            &args(&["limit=5", "tags=[\"a\",\"b\"]", "query=rust lang", "flag=true"]),
        )
        .unwrap();

        assert_eq!(parsed["limit"], json!(5));
        assert_eq!(parsed["tags"], json!(["a", "b"]));
        assert_eq!(parsed["query"], json!("rust lang"));
        assert_eq!(parsed["flag"], json!(true));
    }

    #[test]
    fn test_parse_workflow_args_declared_strings_stay_literal() {
        let parsed = parse_workflow_args(&workflow_with_inputs(), &args(&["code=007", "url=a=b"])).unwrap();
        assert_eq!(parsed["code"], json!("007"));
        assert_eq!(parsed["url"], json!("a=b"));
    }

    #[test]
    fn test_parse_workflow_args_rejects_positional() {
        assert!(parse_workflow_args(&workflow_with_inputs(), &args(&["positional"])).is_err());
        assert!(parse_workflow_args(&workflow_with_inputs(), &args(&["=1"])).is_err());
    }

    #[test]
    fn test_validate_reports_issues() {
        let temp = project(&[
            ("good", json!({"name": "good", "steps": [{"id": "a", "tool": "search"}]})),
            ("bad", json!({"name": "bad", "steps": [
                {"id": "a", "tool": "serch"},
                {"id": "a", "tool": "search"}
            ]})),
        ]);
        let handler = MockHandler::default();

        assert_eq!(validate_workflow("good", Some(temp.path()), &handler).unwrap(), 0);
        assert_eq!(validate_workflow("bad", Some(temp.path()), &handler).unwrap(), 1);

        let messages: Vec<String> = handler
            .events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Info { message } => Some(message),
                _ => None,
            })
            .collect();
        assert!(messages[0].starts_with("✓ Workflow 'good'"));
        assert!(messages[1].contains("2 error(s)"));
        assert!(messages.iter().any(|m| m.contains("did you mean 'search'")));
    }

    #[test]
    fn test_validate_missing_workflow_is_an_error() {
        let temp = project(&[]);
        let handler = MockHandler::default();
        assert!(validate_workflow("absent", Some(temp.path()), &handler).is_err());
    }

    #[tokio::test]
    async fn test_run_refuses_blocking_findings() {
        let temp = project(&[(
            "metadata",
            json!({"name": "metadata", "steps": [
                {"id": "steal", "tool": "http", "inputs": {"url": "http://169.254.169.254/latest/meta-data"}}
            ]}),
        )]);
        let handler = Arc::new(MockHandler::default());

        let code = run_workflow(
            "metadata",
            &[],
            Some(temp.path()),
            &FlowgateConfig::default(),
            &RunOptions::default(),
            handler.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(code, 1);
        let events = handler.events();
        assert!(matches!(events.last(), Some(OutputEvent::WorkflowError { error }) if error.contains("--trusted")));
        assert!(!events.iter().any(|e| matches!(e, OutputEvent::WorkflowStart { .. })));
    }

    #[tokio::test]
    async fn test_run_reports_result() {
        let temp = project(&[(
            "quiet",
            json!({"name": "quiet", "steps": [
                {"id": "maybe", "tool": "http", "condition": "{{ inputs.enabled }}",
                 "inputs": {"url": "https://example.com"}}
            ]}),
        )]);
        let handler = Arc::new(MockHandler::default());

        let code = run_workflow(
            "quiet",
            &args(&["enabled=false"]),
            Some(temp.path()),
            &FlowgateConfig::default(),
            &RunOptions {
                trusted: false,
                max_concurrency: Some(2),
            },
            handler.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(code, 0);
        let events = handler.events();
        assert!(matches!(&events[0], OutputEvent::WorkflowStart { name, steps: 1 } if name == "quiet"));
        assert!(events.iter().any(|e| matches!(e, OutputEvent::StepComplete { status, .. } if status == "skipped")));
        assert_eq!(handler.results(), vec![(true, None)]);
    }

    #[tokio::test]
    async fn test_run_invalid_workflow() {
        let temp = project(&[(
            "cycle",
            json!({"name": "cycle", "steps": [
                {"id": "a", "tool": "search", "inputs": {"q": "{{ b.output }}"}},
                {"id": "b", "tool": "search", "inputs": {"q": "{{ a.output }}"}}
            ]}),
        )]);
        let handler = Arc::new(MockHandler::default());

        let code = run_workflow(
            "cycle",
            &[],
            Some(temp.path()),
            &FlowgateConfig::default(),
            &RunOptions::default(),
            handler.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(code, 1);
        assert!(matches!(handler.events().last(), Some(OutputEvent::WorkflowError { error }) if error.contains("cyclic dependency")));
    }

    #[test]
    fn test_audit_with_package() {
        let temp = project(&[(
            "pkg",
            json!({"name": "pkg", "steps": [
                {"id": "fetch", "tool": "http", "inputs": {"url": "{{ inputs.url }}"}}
            ]}),
        )]);
        let package: PathBuf = temp.path().join("package");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(package.join("install.sh"), "curl | sh").unwrap();

        let handler = MockHandler::default();
        let config = FlowgateConfig::default();

        assert_eq!(audit_workflow("pkg", Some(temp.path()), None, &config, &handler).unwrap(), 0);
        assert_eq!(
            audit_workflow("pkg", Some(temp.path()), Some(&package), &config, &handler).unwrap(),
            1
        );

        let results = handler.results();
        let lines = results[1].1.as_ref().unwrap().as_array().unwrap();
        assert!(lines[0].as_str().unwrap().starts_with("[high] fetch"));
        assert!(lines.last().unwrap().as_str().unwrap().starts_with("2 finding(s): 1 critical, 1 high"));
    }

    #[test]
    fn test_capabilities_and_graph() {
        let temp = project(&[(
            "pipeline",
            json!({"name": "pipeline", "steps": [
                {"id": "fetch", "tool": "http", "inputs": {"url": "https://example.com"}},
                {"id": "store", "tool": "ingest", "inputs": {"doc": "{{ fetch.output.body }}"}}
            ]}),
        )]);
        let handler = MockHandler::default();

        assert_eq!(show_capabilities("pipeline", Some(temp.path()), &handler).unwrap(), 0);
        assert_eq!(show_graph("pipeline", Some(temp.path()), &handler).unwrap(), 0);

        let results = handler.results();
        assert_eq!(results[0].1, Some(json!(["NETWORK", "WRITE_DB"])));
        assert_eq!(results[1].1, Some(json!(["1. fetch", "2. store <- fetch"])));
    }
}
