//! Built-in `http` tool

use super::{Tool, ToolError};
use crate::config::HttpConfig;
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Issues HTTP requests described by step inputs
///
/// Inputs: `url` (required), `method` (default GET), `headers`, `query`
/// and `body`. Output: `{status, headers, body}` where `body` is parsed as
/// JSON when possible.
#[derive(Debug, Clone)]
pub struct HttpTool {
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpRequest {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, Value>,
    #[serde(default)]
    query: BTreeMap<String, Value>,
    #[serde(default)]
    body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpTool {
    pub fn from_config(config: &HttpConfig) -> Result<Self, ToolError> {
        let timeout = Duration::from_secs(config.timeout);
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        let client = builder
            .build()
            .map_err(|e| ToolError::failed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }

    fn map_request_error(&self, e: reqwest::Error, elapsed: Duration) -> ToolError {
        if e.is_timeout() {
            ToolError::Timeout { elapsed }
        } else if e.is_connect() {
            ToolError::network(format!("connection failed: {}", e))
        } else {
            ToolError::network(format!("request failed: {}", e))
        }
    }
}

/// Map a failure status to a tool error
fn map_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> ToolError {
    match status.as_u16() {
        429 => ToolError::RateLimit { retry_after },
        code => ToolError::Status { status: code, body },
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Tool for HttpTool {
    async fn invoke(&self, inputs: Value) -> Result<Value, ToolError> {
        let request: HttpRequest = serde_json::from_value(inputs)
            .map_err(|e| ToolError::invalid_input(e.to_string()))?;

        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| ToolError::invalid_input(format!("invalid method '{}'", request.method)))?;
        let url = Url::parse(&request.url)
            .map_err(|e| ToolError::invalid_input(format!("invalid url '{}': {}", request.url, e)))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value_text(value));
        }
        if !request.query.is_empty() {
            let query: Vec<(&str, String)> = request
                .query
                .iter()
                .map(|(k, v)| (k.as_str(), value_text(v)))
                .collect();
            builder = builder.query(&query);
        }
        builder = match request.body {
            Some(Value::String(text)) => builder.body(text),
            Some(Value::Null) | None => builder,
            Some(structured) => builder.json(&structured),
        };

        let start = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| self.map_request_error(e, start.elapsed()))?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();
        let retry_after = headers
            .get("retry-after")
            .and_then(Value::as_str)
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let text = response
            .text()
            .await
            .map_err(|e| self.map_request_error(e, start.elapsed()))?;

        if !status.is_success() {
            return Err(map_status(status, text, retry_after));
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        tracing::debug!(
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            timeout_secs = self.timeout.as_secs(),
            "http request finished"
        );

        Ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        }))
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response and return the raw request text
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    fn tool() -> HttpTool {
        HttpTool::from_config(&HttpConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_get_parses_json_body() {
        let (base, server) = serve_once("200 OK", r#"{"items":[1,2]}"#).await;

        let out = tool()
            .invoke(json!({
                "url": format!("{}/search", base),
                "query": {"q": "rust", "limit": 5},
                "headers": {"x-trace": "abc"}
            }))
            .await
            .unwrap();

        assert_eq!(out["status"], 200);
        assert_eq!(out["body"], json!({"items": [1, 2]}));
        assert_eq!(out["headers"]["content-type"], "application/json");

        let raw = server.await.unwrap();
        assert!(raw.starts_with("GET /search?limit=5&q=rust"));
        assert!(raw.to_lowercase().contains("x-trace: abc"));
    }

    #[tokio::test]
    async fn test_failure_status_is_an_error() {
        let (base, _server) = serve_once("503 Service Unavailable", "down").await;
        let err = tool().invoke(json!({"url": base})).await.unwrap_err();
        assert!(matches!(err, ToolError::Status { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let err = tool().invoke(json!({"method": "GET"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { .. }));

        let err = tool().invoke(json!({"url": "not a url"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { .. }));

        let err = tool()
            .invoke(json!({"url": "http://example.com", "method": "GE T"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { .. }));
    }

    #[test]
    fn test_map_status() {
        let err = map_status(StatusCode::TOO_MANY_REQUESTS, String::new(), Some(Duration::from_secs(3)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));

        let err = map_status(StatusCode::NOT_FOUND, "nope".into(), None);
        assert!(matches!(err, ToolError::Status { status: 404, .. }));
        assert!(!err.is_retryable());
    }
}
