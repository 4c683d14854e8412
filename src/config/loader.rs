//! Configuration loading with multi-layer merge

use super::WorkflowDefinition;
use crate::audit::Severity;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hosts an http step may never target when its URL is static
pub const DEFAULT_DENIED_HOSTS: &[&str] = &[
    "localhost",
    "127.0.0.1",
    "0.0.0.0",
    "::1",
    "169.254.169.254",
    "metadata.google.internal",
    "metadata.azure.com",
];

/// Top-level flowgate configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FlowgateConfig {
    /// Scheduler settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Audit policy
    #[serde(default)]
    pub audit: AuditConfig,

    /// Built-in http tool settings
    #[serde(default)]
    pub http: HttpConfig,
}

/// Scheduler settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Max simultaneously running steps
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Max concurrent iterations of a non-loop `forEach` step
    #[serde(default = "default_loop_concurrency")]
    pub loop_concurrency: usize,

    /// Iteration clamp when a step sets no `maxIterations`
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u64,

    /// Timeout for every tool call in milliseconds (none by default)
    pub step_timeout_ms: Option<u64>,
}

fn default_max_concurrency() -> usize {
    8
}

fn default_loop_concurrency() -> usize {
    1
}

fn default_max_iterations() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            loop_concurrency: default_loop_concurrency(),
            default_max_iterations: default_max_iterations(),
            step_timeout_ms: None,
        }
    }
}

/// Audit policy
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Findings at or above this severity block `run`
    #[serde(default = "default_block_on")]
    pub block_on: Severity,

    /// Largest `maxIterations` accepted without a finding
    #[serde(default = "default_max_iterations")]
    pub max_iterations_ceiling: u64,

    /// Replaces the built-in host denylist
    #[serde(default = "default_denied_hosts")]
    pub denied_hosts: Vec<String>,

    /// Added to the denylist
    #[serde(default)]
    pub extra_denied_hosts: Vec<String>,
}

fn default_block_on() -> Severity {
    Severity::Critical
}

fn default_denied_hosts() -> Vec<String> {
    DEFAULT_DENIED_HOSTS.iter().map(|h| h.to_string()).collect()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            block_on: default_block_on(),
            max_iterations_ceiling: default_max_iterations(),
            denied_hosts: default_denied_hosts(),
            extra_denied_hosts: Vec::new(),
        }
    }
}

impl AuditConfig {
    /// Effective denylist
    pub fn all_denied_hosts(&self) -> impl Iterator<Item = &str> {
        self.denied_hosts
            .iter()
            .chain(self.extra_denied_hosts.iter())
            .map(String::as_str)
    }
}

/// Built-in http tool settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,

    /// Retries on transient failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// User-Agent header
    pub user_agent: Option<String>,
}

fn default_http_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            user_agent: None,
        }
    }
}

impl FlowgateConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/flowgate/config.toml
    /// 3. .flowgate/config.toml (project)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let project_config_path = project_dir
            .map(|p| p.join(".flowgate/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".flowgate/config.toml"));
        let layers: Vec<PathBuf> = Self::user_config_path()
            .into_iter()
            .chain(std::iter::once(project_config_path))
            .collect();
        Self::load_layers(&layers)
    }

    /// Merge config files in order over the built-in defaults
    ///
    /// Every key a later file sets wins, including one that restates a
    /// built-in default. Arrays are replaced, not appended. Missing files
    /// are skipped.
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Table::new();
        for path in paths.iter().filter(|p| p.exists()) {
            merge_tables(&mut merged, Self::read_layer(path)?);
        }
        Self::deserialize(toml::Value::Table(merged)).context("merging configuration layers")
    }

    /// Read one config file, rejecting unknown keys against that file
    fn read_layer(path: &Path) -> Result<toml::Table> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let table: toml::Table =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Self::deserialize(toml::Value::Table(table.clone()))
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(table)
    }

    /// Get the user config path (~/.config/flowgate/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("flowgate/config.toml"))
    }
}

/// Overlay `overlay` onto `base`; nested tables merge key by key
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(nested) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, nested);
                continue;
            }
            base.insert(key, toml::Value::Table(nested));
        } else {
            base.insert(key, value);
        }
    }
}

/// Locate a workflow document
///
/// An existing path is used as is. Otherwise `name` is looked up as
/// `{name}.json` or `{name}.toml` in:
/// 1. .flowgate/workflows/ (project)
/// 2. ~/.config/flowgate/workflows/ (user)
pub fn resolve_workflow_path(name: &str, project_dir: Option<&Path>) -> Result<PathBuf> {
    let expanded = shellexpand::tilde(name);
    let direct = PathBuf::from(expanded.as_ref());
    if direct.is_file() {
        return Ok(direct);
    }

    let project_workflows = project_dir
        .map(|p| p.join(".flowgate/workflows"))
        .unwrap_or_else(|| PathBuf::from(".flowgate/workflows"));
    let user_workflows = dirs::config_dir().map(|p| p.join("flowgate/workflows"));

    for dir in std::iter::once(project_workflows).chain(user_workflows) {
        for ext in ["json", "toml"] {
            let candidate = dir.join(format!("{}.{}", name, ext));
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    anyhow::bail!("workflow '{}' not found", name)
}

/// Load a workflow by path or name
pub fn load_workflow(name: &str, project_dir: Option<&Path>) -> Result<WorkflowDefinition> {
    let path = resolve_workflow_path(name, project_dir)?;
    load_workflow_file(&path)
}

/// Parse a workflow document; the format follows the file extension
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    let workflow: WorkflowDefinition = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => {
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?
        }
        Some("json") | None => serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?,
        Some(other) => anyhow::bail!(
            "unsupported workflow format '.{}' for {} (expected .json or .toml)",
            other,
            path.display()
        ),
    };

    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = FlowgateConfig::default();
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.engine.loop_concurrency, 1);
        assert_eq!(config.engine.default_max_iterations, 1000);
        assert_eq!(config.engine.step_timeout_ms, None);
        assert_eq!(config.audit.block_on, Severity::Critical);
        assert!(config.audit.denied_hosts.contains(&"169.254.169.254".to_string()));
    }

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
            [engine]
            max_concurrency = 2
            step_timeout_ms = 5000

            [audit]
            block_on = "high"
            extra_denied_hosts = ["internal.corp"]

            [http]
            max_retries = 0
        "#
        )
        .unwrap();

        let config = FlowgateConfig::load_layers(&[config_path]).unwrap();
        assert_eq!(config.engine.max_concurrency, 2);
        assert_eq!(config.engine.step_timeout_ms, Some(5000));
        assert_eq!(config.audit.block_on, Severity::High);
        assert!(config.audit.all_denied_hosts().any(|h| h == "internal.corp"));
        assert!(config.audit.all_denied_hosts().any(|h| h == "localhost"));
        assert_eq!(config.http.max_retries, 0);
    }

    #[test]
    fn test_unknown_config_keys_rejected() {
        let result: Result<FlowgateConfig, _> = toml::from_str("[engine]\nworkers = 3\n");
        assert!(result.is_err());
    }

    fn write_config(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_later_layer_wins() {
        let dir = TempDir::new().unwrap();
        let user = write_config(
            &dir,
            "user.toml",
            "[engine]\nmax_concurrency = 4\n\n[audit]\nblock_on = \"high\"\n\n[http]\nuser_agent = \"base\"\n",
        );
        let project = write_config(
            &dir,
            "project.toml",
            "[engine]\nloop_concurrency = 3\n\n[audit]\nblock_on = \"critical\"\n",
        );

        let config = FlowgateConfig::load_layers(&[user, project]).unwrap();

        // Untouched fields keep the earlier layer
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.http.user_agent.as_deref(), Some("base"));
        // A later layer can restore a built-in default
        assert_eq!(config.audit.block_on, Severity::Critical);
        assert_eq!(config.engine.loop_concurrency, 3);
    }

    #[test]
    fn test_layers_skip_missing_and_name_bad_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.toml");
        let config = FlowgateConfig::load_layers(&[missing]).unwrap();
        assert_eq!(config, FlowgateConfig::default());

        let bad = write_config(&dir, "bad.toml", "[engine]\nworkers = 3\n");
        let err = FlowgateConfig::load_layers(&[bad]).unwrap_err();
        assert!(format!("{:#}", err).contains("bad.toml"));
    }

    #[test]
    fn test_load_project_config() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".flowgate")).unwrap();
        std::fs::write(
            dir.path().join(".flowgate/config.toml"),
            "[engine]\nmax_concurrency = 16\n",
        )
        .unwrap();

        let config = FlowgateConfig::load(Some(dir.path())).unwrap();
        assert_eq!(config.engine.max_concurrency, 16);
    }

    #[test]
    fn test_load_workflow_by_extension() {
        let dir = TempDir::new().unwrap();
        let json_path = dir.path().join("a.json");
        std::fs::write(
            &json_path,
            r#"{"name": "a", "steps": [{"id": "s", "tool": "search"}]}"#,
        )
        .unwrap();
        let toml_path = dir.path().join("b.toml");
        std::fs::write(&toml_path, "name = \"b\"\n[[steps]]\nid = \"s\"\ntool = \"query\"\n")
            .unwrap();
        let yaml_path = dir.path().join("c.yaml");
        std::fs::write(&yaml_path, "name: c\n").unwrap();

        assert_eq!(load_workflow_file(&json_path).unwrap().name, "a");
        assert_eq!(load_workflow_file(&toml_path).unwrap().steps[0].tool, "query");
        assert!(load_workflow_file(&yaml_path).is_err());
    }

    #[test]
    fn test_resolve_workflow_by_name() {
        let dir = TempDir::new().unwrap();
        let workflows = dir.path().join(".flowgate/workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(workflows.join("ingest.toml"), "name = \"ingest\"\n").unwrap();

        let path = resolve_workflow_path("ingest", Some(dir.path())).unwrap();
        assert!(path.ends_with("ingest.toml"));
        assert_eq!(load_workflow("ingest", Some(dir.path())).unwrap().name, "ingest");
        assert!(resolve_workflow_path("missing-workflow", Some(dir.path())).is_err());
    }
}
