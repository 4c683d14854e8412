//! Workflow definition model

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Tool a step is bound to
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// HTTP request
    Http,
    /// Document ingestion (database write)
    Ingest,
    /// Database aggregation pipeline
    Aggregate,
    /// Text generation with a model
    Generate,
    /// Database query
    Query,
    /// Vector search
    Search,
    /// Collection listing
    Collections,
    /// Sequential body executed per element
    Loop,
    /// Embedding generation
    Embed,
    /// Text chunking
    Chunk,
    /// Raw document insert
    Insert,
}

impl ToolKind {
    pub const ALL: [ToolKind; 11] = [
        ToolKind::Http,
        ToolKind::Ingest,
        ToolKind::Aggregate,
        ToolKind::Generate,
        ToolKind::Query,
        ToolKind::Search,
        ToolKind::Collections,
        ToolKind::Loop,
        ToolKind::Embed,
        ToolKind::Chunk,
        ToolKind::Insert,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Http => "http",
            ToolKind::Ingest => "ingest",
            ToolKind::Aggregate => "aggregate",
            ToolKind::Generate => "generate",
            ToolKind::Query => "query",
            ToolKind::Search => "search",
            ToolKind::Collections => "collections",
            ToolKind::Loop => "loop",
            ToolKind::Embed => "embed",
            ToolKind::Chunk => "chunk",
            ToolKind::Insert => "insert",
        }
    }

    /// Every tool name, for "did you mean" suggestions
    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|kind| kind.as_str()).collect()
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared workflow input
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InputDef {
    /// Declared type (`string`, `number`, `boolean`, `array`, `object`)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,

    /// Whether the caller must supply this input
    #[serde(default)]
    pub required: bool,

    /// Value used when the caller omits the input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Description for help text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl InputDef {
    pub fn is_string(&self) -> bool {
        self.input_type.as_deref() == Some("string")
    }
}

/// A single unit of work bound to one tool
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Step {
    /// Unique id within the definition
    pub id: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Tool name, checked against [`ToolKind`] during validation
    pub tool: String,

    /// Tool inputs; string leaves may contain fragments
    #[serde(default = "empty_inputs")]
    pub inputs: Value,

    /// Run only when this expression is truthy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Expression producing the sequence to iterate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<String>,

    /// Iteration bound for loops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,

    /// Failure of this step does not fail the run
    #[serde(default)]
    pub continue_on_error: bool,

    /// Permit `$out`/`$merge` in aggregate pipelines
    #[serde(default)]
    pub allow_writes: bool,

    /// Explicit edges merged with those inferred from fragments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Timeout for the tool call in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn empty_inputs() -> Value {
    Value::Object(Map::new())
}

impl Default for Step {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: None,
            description: None,
            tool: String::new(),
            inputs: empty_inputs(),
            condition: None,
            for_each: None,
            max_iterations: None,
            continue_on_error: false,
            allow_writes: false,
            depends_on: Vec::new(),
            timeout_ms: None,
        }
    }
}

impl Step {
    pub fn tool_kind(&self) -> Option<ToolKind> {
        ToolKind::parse(&self.tool)
    }

    /// Whether the step iterates (`loop` tool or any `forEach`)
    pub fn iterates(&self) -> bool {
        self.for_each.is_some() || self.tool_kind() == Some(ToolKind::Loop)
    }

    /// A string-valued input
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(Value::as_str)
    }

    /// Body of a `loop` step, read from `inputs.steps`
    ///
    /// Returns `None` when the step has no body at all.
    pub fn loop_body(&self) -> Option<Result<Vec<Step>, serde_json::Error>> {
        self.inputs
            .get("steps")
            .map(|steps| serde_json::from_value(steps.clone()))
    }

    /// Inputs with the loop body removed
    pub fn inputs_without_body(&self) -> Value {
        match &self.inputs {
            Value::Object(map) if self.tool_kind() == Some(ToolKind::Loop) => {
                let mut map = map.clone();
                map.remove("steps");
                Value::Object(map)
            }
            other => other.clone(),
        }
    }

    /// Name used in progress output
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A complete workflow document
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkflowDefinition {
    /// Workflow name
    pub name: String,

    /// Document version; numbers are kept in their textual form
    #[serde(
        default,
        deserialize_with = "deserialize_version",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared inputs
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDef>,

    /// Workflow-level defaults, visible to fragments as `defaults`
    #[serde(default)]
    pub defaults: Map<String, Value>,

    /// Steps in authoring order; execution order comes from the graph
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn deserialize_version<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl WorkflowDefinition {
    /// Look up a top-level step by id
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}
