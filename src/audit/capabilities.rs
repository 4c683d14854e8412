//! Capabilities a workflow needs, derived from its steps

use super::rules::write_stage;
use crate::config::{Step, ToolKind, WorkflowDefinition};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Network,
    ReadDb,
    WriteDb,
    Llm,
    Loop,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Network => "NETWORK",
            Capability::ReadDb => "READ_DB",
            Capability::WriteDb => "WRITE_DB",
            Capability::Llm => "LLM",
            Capability::Loop => "LOOP",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Union of the capabilities of every step, loop bodies included
pub fn derive_capabilities(definition: &WorkflowDefinition) -> BTreeSet<Capability> {
    let mut capabilities = BTreeSet::new();
    for step in &definition.steps {
        collect(step, &mut capabilities);
    }
    capabilities
}

fn collect(step: &Step, capabilities: &mut BTreeSet<Capability>) {
    match step.tool_kind() {
        Some(ToolKind::Http) => {
            capabilities.insert(Capability::Network);
        }
        Some(ToolKind::Ingest | ToolKind::Insert) => {
            capabilities.insert(Capability::WriteDb);
        }
        Some(ToolKind::Aggregate) => {
            capabilities.insert(Capability::ReadDb);
            if step.allow_writes || write_stage(&step.inputs).is_some() {
                capabilities.insert(Capability::WriteDb);
            }
        }
        Some(ToolKind::Generate | ToolKind::Embed) => {
            capabilities.insert(Capability::Llm);
        }
        Some(ToolKind::Query | ToolKind::Search | ToolKind::Collections) => {
            capabilities.insert(Capability::ReadDb);
        }
        Some(ToolKind::Loop) => {
            if let Some(Ok(body)) = step.loop_body() {
                for inner in &body {
                    collect(inner, capabilities);
                }
            }
        }
        Some(ToolKind::Chunk) | None => {}
    }

    if step.iterates() {
        capabilities.insert(Capability::Loop);
    }
}
