//! Mock tools for engine and executor tests

use crate::tools::{Tool, ToolError, ToolRegistry};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Handler = Box<dyn Fn(Value) -> Result<Value, ToolError> + Send + Sync>;

/// Tool backed by a closure, with an optional artificial latency
pub struct FnTool {
    name: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
    handler: Handler,
}

impl FnTool {
    pub fn new(
        name: &str,
        handler: impl Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay: None,
            calls: AtomicUsize::new(0),
            handler: Box::new(handler),
        })
    }

    pub fn slow(
        name: &str,
        delay: Duration,
        handler: impl Fn(Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
            handler: Box::new(handler),
        })
    }

    /// Returns its inputs unchanged
    pub fn echo(name: &str) -> Arc<Self> {
        Self::new(name, Ok)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FnTool {
    async fn invoke(&self, inputs: Value) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(inputs)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub fn registry(tools: &[Arc<FnTool>]) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool.clone());
    }
    Arc::new(registry)
}
