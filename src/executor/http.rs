//! `http` requests via reqwest.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ExecutorError;
use crate::executor::request::HttpMethod;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum response body kept in the result (256KB).
const MAX_BODY_SIZE: usize = 256 * 1024;

/// Borrowed view of one `http` request.
#[derive(Debug, Clone, Copy)]
pub struct HttpCall<'a> {
    pub method: HttpMethod,
    pub url: &'a str,
    pub headers: &'a BTreeMap<String, String>,
    pub body: Option<&'a Value>,
    pub expect_status: Option<u16>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HttpCapability {
    client: Client,
}

impl Default for HttpCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCapability {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub async fn send(&self, call: HttpCall<'_>) -> Result<Value, ExecutorError> {
        let url = reqwest::Url::parse(call.url).map_err(|e| ExecutorError::InvalidRequest {
            reason: format!("invalid url {}: {e}", call.url),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ExecutorError::InvalidRequest {
                reason: format!("unsupported scheme: {}", url.scheme()),
            });
        }

        let method = match call.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        };
        let timeout = call
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        let mut request = self.client.request(method, url).timeout(timeout);
        for (name, value) in call.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = match call.body {
            Some(Value::String(text)) => request.body(text.clone()),
            Some(body) => request.json(body),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Timeout {
                    op: "http".to_string(),
                    timeout,
                }
            } else {
                ExecutorError::Http(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutorError::Http(e.to_string()))?;
        debug!(status, bytes = text.len(), "HTTP response received");

        if let Some(expected) = call.expect_status {
            if expected != status {
                return Err(ExecutorError::Http(format!(
                    "expected status {expected}, got {status}"
                )));
            }
        }

        Ok(json!({
            "status": status,
            "success": (200..300).contains(&status),
            "headers": headers,
            "body": parse_body(&text),
        }))
    }
}

/// JSON bodies are kept structured; anything else as (truncated) text.
fn parse_body(text: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return value;
    }
    if text.len() <= MAX_BODY_SIZE {
        return Value::String(text.to_string());
    }
    let mut end = MAX_BODY_SIZE;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    Value::String(format!("{}... [truncated]", &text[..end]))
}
