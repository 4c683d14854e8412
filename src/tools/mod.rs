//! Tool collaborators invoked by workflow steps
//!
//! The engine only resolves inputs, looks a tool up by name and records
//! what it returns. Implementations live behind the [`Tool`] trait and are
//! registered in a [`ToolRegistry`].

mod http;
mod retry;

pub use http::HttpTool;
pub use retry::{RetryPolicy, RetryTool};

use crate::config::HttpConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors a tool may return
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// Inputs missing or of the wrong shape
    #[error("invalid inputs: {message}")]
    InvalidInput { message: String },

    /// Request timed out
    #[error("timeout after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// Rate limited by the remote service
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit { retry_after: Option<Duration> },

    /// Connection or transport failure
    #[error("network error: {message}")]
    Network { message: String },

    /// Remote service answered with a failure status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Any other tool failure
    #[error("{message}")]
    Failed { message: String },
}

impl ToolError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ToolError::Timeout { .. } | ToolError::RateLimit { .. } | ToolError::Network { .. } => {
                true
            }
            ToolError::Status { status, .. } => *status >= 500,
            ToolError::InvalidInput { .. } | ToolError::Failed { .. } => false,
        }
    }

    /// Server-suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ToolError::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// A tool a step can be bound to
#[async_trait]
pub trait Tool: Send + Sync {
    /// Invoke the tool with fully resolved inputs
    async fn invoke(&self, inputs: Value) -> Result<Value, ToolError>;

    /// Name steps use to select this tool
    fn name(&self) -> &str;
}

/// Maps tool names to implementations
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `http` tool
    pub fn with_builtins(config: &HttpConfig) -> Result<Self, ToolError> {
        let mut registry = Self::new();
        let http = HttpTool::from_config(config)?;
        registry.register(Arc::new(RetryTool::new(http, RetryPolicy::from_config(config))));
        Ok(registry)
    }

    /// Register a tool under its own name, replacing any previous one
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        async fn invoke(&self, inputs: Value) -> Result<Value, ToolError> {
            Ok(inputs)
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    #[test]
    fn test_tool_error_retryable() {
        assert!(ToolError::Timeout { elapsed: Duration::from_secs(1) }.is_retryable());
        assert!(ToolError::RateLimit { retry_after: None }.is_retryable());
        assert!(ToolError::network("reset").is_retryable());
        assert!(ToolError::Status { status: 503, body: String::new() }.is_retryable());

        assert!(!ToolError::Status { status: 404, body: String::new() }.is_retryable());
        assert!(!ToolError::invalid_input("missing url").is_retryable());
        assert!(!ToolError::failed("boom").is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = ToolError::RateLimit {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(ToolError::failed("x").retry_after(), None);
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));

        assert!(registry.get("ingest").is_none());

        let tool = registry.get("echo").unwrap();
        let out = tool.invoke(json!({"q": 1})).await.unwrap();
        assert_eq!(out, json!({"q": 1}));
    }

    #[test]
    fn test_builtins_register_http() {
        let registry = ToolRegistry::with_builtins(&HttpConfig::default()).unwrap();
        assert!(registry.get("http").is_some());
    }
}
