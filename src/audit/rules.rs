//! Per-step audit rules

use super::{Auditor, SecurityFinding, Severity};
use crate::config::{Step, ToolKind};
use crate::expression::has_fragment;
use regex::Regex;
use reqwest::Url;
use serde_json::Value;
use std::sync::LazyLock;

/// Aggregation stages that write to a collection
const WRITE_STAGES: &[&str] = &["$out", "$merge"];

/// Prompt fields of a `generate` step
const PROMPT_FIELDS: &[&str] = &["prompt", "systemPrompt", "system"];

static IGNORE_INSTRUCTIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(ignore|disregard|forget)\s+(all\s+|any\s+)?(the\s+)?(previous|prior|above|earlier|all)\s+(instructions|prompts|rules|directions)",
    )
    .expect("valid regex")
});

static ROLE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*system\s*:").expect("valid regex"));

pub(super) fn audit_step(
    auditor: &Auditor,
    step: &Step,
    label: &str,
    findings: &mut Vec<SecurityFinding>,
) {
    match step.tool_kind() {
        Some(ToolKind::Http) => audit_http(auditor, step, label, findings),
        Some(ToolKind::Aggregate) => audit_aggregate(step, label, findings),
        Some(ToolKind::Generate) => audit_generate(step, label, findings),
        Some(ToolKind::Ingest) => audit_ingest(step, label, findings),
        _ => {}
    }

    if step.iterates() {
        audit_iteration(auditor, step, label, findings);
    }

    if step.tool_kind() == Some(ToolKind::Loop) {
        if let Some(Ok(body)) = step.loop_body() {
            for inner in &body {
                audit_step(auditor, inner, &format!("{}.{}", label, inner.id), findings);
            }
        }
    }
}

fn audit_http(auditor: &Auditor, step: &Step, label: &str, findings: &mut Vec<SecurityFinding>) {
    let Some(url) = step.input_str("url") else {
        return;
    };

    if has_fragment(url) {
        findings.push(SecurityFinding::new(
            Severity::High,
            format!("dynamic URL '{}' needs review: it cannot be verified statically", url),
            Some(label),
        ));
        return;
    }

    let parsed = match Url::parse(url.trim()) {
        Ok(parsed) => parsed,
        Err(e) => {
            findings.push(SecurityFinding::new(
                Severity::Low,
                format!("URL '{}' could not be parsed: {}", url, e),
                Some(label),
            ));
            return;
        }
    };

    if let Some(host) = parsed.host_str() {
        let host = host.trim_matches(['[', ']']);
        if auditor.is_denied_host(host) {
            findings.push(SecurityFinding::new(
                Severity::Critical,
                format!("request to disallowed host '{}'", host),
                Some(label),
            ));
        }
    }

    if parsed.scheme() == "http" {
        findings.push(SecurityFinding::new(
            Severity::Medium,
            format!("insecure transport: '{}' uses http://", url),
            Some(label),
        ));
    }
}

fn audit_aggregate(step: &Step, label: &str, findings: &mut Vec<SecurityFinding>) {
    if step.allow_writes {
        findings.push(SecurityFinding::new(
            Severity::High,
            "aggregation is allowed to write (allowWrites)",
            Some(label),
        ));
    }

    if let Some(stage) = write_stage(&step.inputs) {
        findings.push(SecurityFinding::new(
            Severity::Critical,
            format!("pipeline contains a '{}' write stage", stage),
            Some(label),
        ));
    }
}

fn audit_generate(step: &Step, label: &str, findings: &mut Vec<SecurityFinding>) {
    for field in PROMPT_FIELDS {
        let Some(text) = step.input_str(field) else {
            continue;
        };
        if IGNORE_INSTRUCTIONS.is_match(text) {
            findings.push(SecurityFinding::new(
                Severity::High,
                format!("{} contains an instruction-override phrase", field),
                Some(label),
            ));
        }
        if ROLE_PREFIX.is_match(text) {
            findings.push(SecurityFinding::new(
                Severity::Medium,
                format!("{} contains a 'system:' role prefix", field),
                Some(label),
            ));
        }
    }
}

fn audit_ingest(step: &Step, label: &str, findings: &mut Vec<SecurityFinding>) {
    for field in ["database", "collection"] {
        if step.input_str(field).is_some_and(has_fragment) {
            findings.push(SecurityFinding::new(
                Severity::Medium,
                format!("{} name is templated: non-deterministic write target", field),
                Some(label),
            ));
        }
    }
}

fn audit_iteration(
    auditor: &Auditor,
    step: &Step,
    label: &str,
    findings: &mut Vec<SecurityFinding>,
) {
    let ceiling = auditor.max_iterations_ceiling;
    let message = match step.max_iterations {
        None => "unbounded iteration: no maxIterations".to_string(),
        Some(n) if n > ceiling => {
            format!("unbounded iteration: maxIterations {} exceeds {}", n, ceiling)
        }
        Some(_) => return,
    };
    findings.push(SecurityFinding::new(Severity::Medium, message, Some(label)));
}

/// First `$out`/`$merge` stage key found anywhere in a value
pub(super) fn write_stage(value: &Value) -> Option<&'static str> {
    match value {
        Value::Object(map) => WRITE_STAGES
            .iter()
            .find(|stage| map.contains_key(**stage))
            .copied()
            .or_else(|| map.values().find_map(write_stage)),
        Value::Array(items) => items.iter().find_map(write_stage),
        _ => None,
    }
}
