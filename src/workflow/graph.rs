//! Dependency graph derived from the fragments each step references

use super::error::{ValidationError, ValidationIssue};
use crate::config::{Step, ToolKind, WorkflowDefinition};
use crate::expression::{
    ExpressionError, RESERVED_NAMES, extract_dependencies, extract_expression_dependencies,
    suggest_correction, validate_source, validate_value,
};
use std::collections::{BTreeSet, HashMap, HashSet};

const LITERAL_NAMES: &[&str] = &["true", "false", "null", "undefined"];

/// Validated, acyclic step graph
///
/// An edge B -> A exists when A references B in its inputs, condition or
/// loop source, or lists B in `dependsOn`.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Step ids in authoring order
    steps: Vec<String>,
    dependencies: HashMap<String, BTreeSet<String>>,
    dependents: HashMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Validate a definition and build its graph
    ///
    /// Every structural problem is reported at once. Cycle detection only
    /// runs once the definition is otherwise valid.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, ValidationError> {
        let mut issues = Vec::new();
        let mut ids: HashSet<&str> = HashSet::new();

        for (position, step) in definition.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                issues.push(ValidationIssue::EmptyId { position });
                continue;
            }
            if is_reserved(&step.id) {
                issues.push(ValidationIssue::ReservedId {
                    id: step.id.clone(),
                });
            }
            if !ids.insert(step.id.as_str()) {
                issues.push(ValidationIssue::DuplicateStep {
                    id: step.id.clone(),
                });
            }
        }

        for step in definition.steps.iter().filter(|s| !s.id.trim().is_empty()) {
            check_step(step, &step.id, &ids, &mut issues);
        }

        let mut dependencies: HashMap<String, BTreeSet<String>> = HashMap::new();
        for step in &definition.steps {
            let mut deps: BTreeSet<String> = step_references(step)
                .into_iter()
                .filter(|name| ids.contains(name.as_str()))
                .collect();
            for explicit in &step.depends_on {
                if ids.contains(explicit.as_str()) {
                    deps.insert(explicit.clone());
                } else {
                    issues.push(ValidationIssue::UnknownDependency {
                        step: step.id.clone(),
                        dependency: explicit.clone(),
                    });
                }
            }
            dependencies.insert(step.id.clone(), deps);
        }

        if !issues.is_empty() {
            return Err(ValidationError::Invalid { issues });
        }

        let steps: Vec<String> = definition.steps.iter().map(|s| s.id.clone()).collect();
        let order = topological_sort(&steps, &dependencies)?;

        let mut dependents: HashMap<String, BTreeSet<String>> = steps
            .iter()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (id, deps) in &dependencies {
            for dep in deps {
                dependents.entry(dep.clone()).or_default().insert(id.clone());
            }
        }

        Ok(Self {
            steps,
            dependencies,
            dependents,
            order,
        })
    }

    /// Steps that must be terminal before `id` becomes ready
    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Steps waiting on `id`
    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Deterministic execution order; authoring order breaks ties
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Steps with no dependencies, in authoring order
    pub fn roots(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|id| self.dependencies.get(*id).is_none_or(BTreeSet::is_empty))
            .map(String::as_str)
            .collect()
    }

    /// Step ids in authoring order
    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    /// Every edge as `(dependency, dependent)`, following topological order
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.order
            .iter()
            .flat_map(|id| self.dependencies(id).map(move |dep| (dep, id.as_str())))
            .collect()
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

fn is_reserved(id: &str) -> bool {
    RESERVED_NAMES.contains(&id) || LITERAL_NAMES.contains(&id)
}

fn check_step(
    step: &Step,
    label: &str,
    top_ids: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    let kind = step.tool_kind();
    if kind.is_none() {
        issues.push(ValidationIssue::UnknownTool {
            step: label.to_string(),
            tool: step.tool.clone(),
            suggestion: suggest_correction(&step.tool, &ToolKind::names()),
        });
    }

    let expression_issue = |field: &str, error: ExpressionError| ValidationIssue::Expression {
        step: label.to_string(),
        field: field.to_string(),
        error,
    };
    if let Err(error) = validate_value(&step.inputs_without_body()) {
        issues.push(expression_issue("inputs", error));
    }
    if let Some(Err(error)) = step.condition.as_deref().map(validate_source) {
        issues.push(expression_issue("condition", error));
    }
    if let Some(Err(error)) = step.for_each.as_deref().map(validate_source) {
        issues.push(expression_issue("forEach", error));
    }

    if kind == Some(ToolKind::Loop) {
        check_loop_body(step, label, top_ids, issues);
    }
}

fn check_loop_body(
    step: &Step,
    label: &str,
    top_ids: &HashSet<&str>,
    issues: &mut Vec<ValidationIssue>,
) {
    if step.for_each.is_none() {
        issues.push(ValidationIssue::MissingLoopSource {
            step: label.to_string(),
        });
    }

    let invalid = |message: String| ValidationIssue::InvalidLoopBody {
        step: label.to_string(),
        message,
    };

    let body = match step.loop_body() {
        None => {
            issues.push(invalid("missing inputs.steps".to_string()));
            return;
        }
        Some(Err(e)) => {
            issues.push(invalid(e.to_string()));
            return;
        }
        Some(Ok(body)) => body,
    };
    if body.is_empty() {
        issues.push(invalid("body has no steps".to_string()));
        return;
    }

    let mut seen = HashSet::new();
    for (position, body_step) in body.iter().enumerate() {
        if body_step.id.trim().is_empty() {
            issues.push(invalid(format!("body step #{} has an empty id", position)));
            continue;
        }
        if is_reserved(&body_step.id) {
            issues.push(invalid(format!(
                "body step id '{}' is a reserved name",
                body_step.id
            )));
        }
        if top_ids.contains(body_step.id.as_str()) {
            issues.push(invalid(format!(
                "body step '{}' shadows a top-level step",
                body_step.id
            )));
        }
        if !seen.insert(body_step.id.as_str()) {
            issues.push(invalid(format!("duplicate body step id: {}", body_step.id)));
        }
        check_step(
            body_step,
            &format!("{}.{}", label, body_step.id),
            top_ids,
            issues,
        );
    }
}

/// Root identifiers a step references, including those of its loop body
/// that do not name another body step
fn step_references(step: &Step) -> BTreeSet<String> {
    let mut refs = extract_dependencies(&step.inputs_without_body(), RESERVED_NAMES);
    for source in [&step.condition, &step.for_each].into_iter().flatten() {
        refs.extend(extract_expression_dependencies(source, RESERVED_NAMES));
    }

    if step.tool_kind() == Some(ToolKind::Loop) {
        if let Some(Ok(body)) = step.loop_body() {
            let local: HashSet<&str> = body.iter().map(|s| s.id.as_str()).collect();
            for body_step in &body {
                refs.extend(
                    step_references(body_step)
                        .into_iter()
                        .filter(|name| !local.contains(name.as_str())),
                );
            }
        }
    }

    refs
}

/// Topological sort of steps based on dependencies
fn topological_sort(
    steps: &[String],
    dependencies: &HashMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, ValidationError> {
    fn visit<'a>(
        id: &'a str,
        dependencies: &'a HashMap<String, BTreeSet<String>>,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), ValidationError> {
        if visited.contains(id) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|p| *p == id) {
            let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Err(ValidationError::Cycle { steps: cycle });
        }

        path.push(id);
        if let Some(deps) = dependencies.get(id) {
            for dep in deps {
                visit(dep, dependencies, visited, path, order)?;
            }
        }
        path.pop();

        visited.insert(id);
        order.push(id.to_string());
        Ok(())
    }

    let mut order = Vec::with_capacity(steps.len());
    let mut visited = HashSet::new();
    let mut path = Vec::new();

    for id in steps {
        // Keys of `dependencies` outlive the loop; borrow from there
        let Some((key, _)) = dependencies.get_key_value(id) else {
            continue;
        };
        visit(key, dependencies, &mut visited, &mut path, &mut order)?;
    }

    Ok(order)
}
