//! Validation errors raised before any step runs

use crate::expression::ExpressionError;
use thiserror::Error;

/// A single problem found while validating a definition
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationIssue {
    #[error("step #{position} has an empty id")]
    EmptyId { position: usize },

    #[error("duplicate step id: {id}")]
    DuplicateStep { id: String },

    #[error("step id '{id}' is a reserved name")]
    ReservedId { id: String },

    #[error(
        "step '{step}' uses unknown tool '{tool}'{}",
        .suggestion.as_ref().map(|s| format!(" (did you mean '{}'?)", s)).unwrap_or_default()
    )]
    UnknownTool {
        step: String,
        tool: String,
        suggestion: Option<String>,
    },

    #[error("step '{step}' {field}: {error}")]
    Expression {
        step: String,
        field: String,
        error: ExpressionError,
    },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("loop step '{step}' has no forEach source")]
    MissingLoopSource { step: String },

    #[error("loop step '{step}' has an invalid body: {message}")]
    InvalidLoopBody { step: String, message: String },
}

/// Errors that abort a run before any step executes
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("workflow validation failed:\n  {}", format_issues(.issues))]
    Invalid { issues: Vec<ValidationIssue> },

    #[error("cyclic dependency: {}", .steps.join(" -> "))]
    Cycle { steps: Vec<String> },

    #[error("missing required input '{name}'")]
    MissingInput { name: String },
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n  ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_messages() {
        let issue = ValidationIssue::UnknownTool {
            step: "find".into(),
            tool: "serch".into(),
            suggestion: Some("search".into()),
        };
        assert_eq!(
            issue.to_string(),
            "step 'find' uses unknown tool 'serch' (did you mean 'search'?)"
        );

        let issue = ValidationIssue::UnknownTool {
            step: "find".into(),
            tool: "xyz".into(),
            suggestion: None,
        };
        assert_eq!(issue.to_string(), "step 'find' uses unknown tool 'xyz'");
    }

    #[test]
    fn test_error_messages() {
        let err = ValidationError::Cycle {
            steps: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");

        let err = ValidationError::Invalid {
            issues: vec![
                ValidationIssue::DuplicateStep { id: "a".into() },
                ValidationIssue::MissingLoopSource { step: "l".into() },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("duplicate step id: a"));
        assert!(msg.contains("loop step 'l' has no forEach source"));
    }
}
