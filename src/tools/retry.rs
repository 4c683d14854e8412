//! Retry wrapper with exponential backoff

use super::{Tool, ToolError};
use crate::config::HttpConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            // Up to 25% extra
            capped_delay + rand::random::<f64>() * 0.25 * capped_delay
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Wrapper that retries transient failures of any tool
pub struct RetryTool<T: Tool> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: Tool> RetryTool<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<T: Tool> Tool for RetryTool<T> {
    async fn invoke(&self, inputs: Value) -> Result<Value, ToolError> {
        let mut attempt = 0;
        loop {
            match self.inner.invoke(inputs.clone()).await {
                Ok(output) => return Ok(output),
                Err(e) if !e.is_retryable() || attempt >= self.policy.max_retries => return Err(e),
                Err(e) => {
                    let delay = e
                        .retry_after()
                        .unwrap_or_else(|| self.policy.delay_for_attempt(attempt));
                    tracing::debug!(
                        tool = self.inner.name(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying tool call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
