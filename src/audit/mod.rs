//! Capability and security audit of workflow definitions
//!
//! The audit is a read-only pass. It never refuses anything itself; callers
//! such as the `run` gate decide what to do with the findings via
//! [`AuditReport::blocks`].

mod capabilities;
mod package;
mod rules;

pub use capabilities::derive_capabilities;

use crate::config::{AuditConfig, WorkflowDefinition};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Finding severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit finding
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityFinding {
    pub severity: Severity,
    pub message: String,
    /// Step the finding is about; `loopId.bodyId` for loop bodies, absent
    /// for package-level findings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl SecurityFinding {
    pub fn new(severity: Severity, message: impl Into<String>, step_id: Option<&str>) -> Self {
        Self {
            severity,
            message: message.into(),
            step_id: step_id.map(str::to_string),
        }
    }
}

impl fmt::Display for SecurityFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "[{}] {}: {}", self.severity, step, self.message),
            None => write!(f, "[{}] {}", self.severity, self.message),
        }
    }
}

/// Ordered findings of one audit
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub findings: Vec<SecurityFinding>,
}

impl AuditReport {
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }

    /// Number of findings per severity; every severity is present
    pub fn counts(&self) -> BTreeMap<Severity, usize> {
        let mut counts: BTreeMap<Severity, usize> =
            Severity::ALL.iter().map(|s| (*s, 0)).collect();
        for finding in &self.findings {
            *counts.entry(finding.severity).or_default() += 1;
        }
        counts
    }

    /// Findings at or above `threshold`
    pub fn at_least(&self, threshold: Severity) -> impl Iterator<Item = &SecurityFinding> {
        self.findings.iter().filter(move |f| f.severity >= threshold)
    }

    /// Whether a gate with this threshold should refuse
    pub fn blocks(&self, threshold: Severity) -> bool {
        self.at_least(threshold).next().is_some()
    }
}

/// Runs the audit rules with a given policy
#[derive(Debug, Clone)]
pub struct Auditor {
    denied_hosts: Vec<String>,
    max_iterations_ceiling: u64,
}

impl Default for Auditor {
    fn default() -> Self {
        Self::new(&AuditConfig::default())
    }
}

impl Auditor {
    pub fn new(config: &AuditConfig) -> Self {
        Self {
            denied_hosts: config
                .all_denied_hosts()
                .map(|h| h.trim().trim_matches(['[', ']']).to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            max_iterations_ceiling: config.max_iterations_ceiling,
        }
    }

    /// Audit a definition's steps, in authoring order
    pub fn audit_definition(&self, definition: &WorkflowDefinition) -> AuditReport {
        let mut findings = Vec::new();
        for step in &definition.steps {
            rules::audit_step(self, step, &step.id, &mut findings);
        }

        tracing::debug!(
            workflow = %definition.name,
            findings = findings.len(),
            "audited definition"
        );
        AuditReport { findings }
    }

    /// Audit a definition and, when given, the package directory shipped with it
    pub fn audit(
        &self,
        definition: &WorkflowDefinition,
        package_dir: Option<&Path>,
    ) -> Result<AuditReport> {
        let mut report = self.audit_definition(definition);
        if let Some(dir) = package_dir {
            report.findings.extend(package::audit_package(dir)?);
        }
        Ok(report)
    }

    fn is_denied_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.denied_hosts.iter().any(|denied| {
            host == *denied
                || host
                    .strip_suffix(denied.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(steps: serde_json::Value) -> WorkflowDefinition {
        serde_json::from_value(json!({"name": "wf", "steps": steps})).unwrap()
    }

    #[test]
    fn test_severity_ordering_and_serde() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(serde_json::to_value(Severity::High).unwrap(), json!("high"));
        let parsed: Severity = serde_json::from_value(json!("critical")).unwrap();
        assert_eq!(parsed, Severity::Critical);
    }

    #[test]
    fn test_report_summary() {
        let report = AuditReport {
            findings: vec![
                SecurityFinding::new(Severity::Medium, "insecure transport", Some("a")),
                SecurityFinding::new(Severity::High, "dynamic URL", Some("b")),
                SecurityFinding::new(Severity::Medium, "unbounded iteration", Some("c")),
            ],
        };

        assert_eq!(report.max_severity(), Some(Severity::High));
        assert_eq!(report.counts()[&Severity::Medium], 2);
        assert_eq!(report.counts()[&Severity::Critical], 0);
        assert!(report.blocks(Severity::High));
        assert!(!report.blocks(Severity::Critical));
        assert!(AuditReport::default().max_severity().is_none());
    }

    #[test]
    fn test_finding_display_and_shape() {
        let finding = SecurityFinding::new(Severity::Critical, "write stage", Some("agg"));
        assert_eq!(finding.to_string(), "[critical] agg: write stage");

        let package = SecurityFinding::new(Severity::Critical, "install script", None);
        let value = serde_json::to_value(&package).unwrap();
        assert_eq!(value, json!({"severity": "critical", "message": "install script"}));
    }

    #[test]
    fn test_denied_host_matching() {
        let auditor = Auditor::default();
        assert!(auditor.is_denied_host("localhost"));
        assert!(auditor.is_denied_host("LOCALHOST."));
        assert!(auditor.is_denied_host("api.metadata.google.internal"));
        assert!(auditor.is_denied_host("::1"));
        assert!(!auditor.is_denied_host("notlocalhost"));
        assert!(!auditor.is_denied_host("example.com"));
    }

    #[test]
    fn test_extra_denied_hosts() {
        let config = AuditConfig {
            extra_denied_hosts: vec!["internal.corp".into()],
            ..AuditConfig::default()
        };
        let auditor = Auditor::new(&config);
        assert!(auditor.is_denied_host("wiki.internal.corp"));
        assert!(auditor.is_denied_host("localhost"));
    }

    #[test]
    fn test_audit_keeps_step_order() {
        let def = definition(json!([
            {"id": "fetch", "tool": "http", "inputs": {"url": "{{ inputs.url }}"}},
            {"id": "merge", "tool": "aggregate", "inputs": {"pipeline": [{"$merge": "out"}]}},
            {"id": "each", "tool": "loop", "forEach": "{{ fetch.output }}",
             "inputs": {"steps": [{"id": "x", "tool": "embed"}]}}
        ]));

        let report = Auditor::default().audit_definition(&def);
        let seen: Vec<(Severity, Option<&str>)> = report
            .findings
            .iter()
            .map(|f| (f.severity, f.step_id.as_deref()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (Severity::High, Some("fetch")),
                (Severity::Critical, Some("merge")),
                (Severity::Medium, Some("each")),
            ]
        );
    }
}
