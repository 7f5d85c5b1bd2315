use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use thiserror::Error;

use super::router::EndpointMember;

/// Token counts reported by the upstream, zero when it reports none.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn from_body(body: &Value) -> Self {
        let usage = body.get("usage");
        let field = |name: &str| {
            usage
                .and_then(|usage| usage.get(name))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        Self {
            input_tokens: field("prompt_tokens"),
            output_tokens: field("completion_tokens"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamReply {
    pub body: Value,
    pub usage: TokenUsage,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UpstreamFailure {
    #[error("upstream timed out")]
    Timeout,
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream returned {code}")]
    Status { code: u16, body: String },
}

impl UpstreamFailure {
    /// Failures worth trying on the next replica.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamFailure::Timeout | UpstreamFailure::Transport(_) => true,
            UpstreamFailure::Status { code, .. } => *code == 429 || *code >= 500,
        }
    }

    /// Failures that say something about the endpoint itself. A 429 is the
    /// upstream's own rate limit and does not trip the breaker.
    pub fn counts_against_endpoint(&self) -> bool {
        match self {
            UpstreamFailure::Timeout | UpstreamFailure::Transport(_) => true,
            UpstreamFailure::Status { code, .. } => *code >= 500,
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn complete(
        &self,
        endpoint: &EndpointMember,
        body: &Value,
        timeout: Duration,
    ) -> Result<UpstreamReply, UpstreamFailure>;

    /// A minimal request used by administrative health checks.
    async fn probe(
        &self,
        endpoint: &EndpointMember,
        timeout: Duration,
    ) -> Result<(), UpstreamFailure>;
}

/// OpenAI-compatible chat completions over HTTP. `endpoint.url` is the full
/// completions URL.
#[derive(Clone, Debug)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new() -> Result<Self, UpstreamFailure> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| UpstreamFailure::Transport(format!("http client error: {err}")))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn headers(endpoint: &EndpointMember) -> Result<HeaderMap, UpstreamFailure> {
        let mut headers = HeaderMap::new();
        if !endpoint.api_key.trim().is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", endpoint.api_key.trim()))
                .map_err(|_| UpstreamFailure::Transport("invalid api key header".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &endpoint.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| UpstreamFailure::Transport(format!("invalid header name: {name}")))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                UpstreamFailure::Transport(format!("invalid value for header {name}"))
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn post(
        &self,
        endpoint: &EndpointMember,
        body: &Value,
        timeout: Duration,
    ) -> Result<String, UpstreamFailure> {
        let response = self
            .client
            .post(&endpoint.url)
            .headers(Self::headers(endpoint)?)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_reqwest_error)?;
        if !(200..300).contains(&status) {
            return Err(UpstreamFailure::Status {
                code: status,
                body: text,
            });
        }
        Ok(text)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> UpstreamFailure {
    if err.is_timeout() {
        UpstreamFailure::Timeout
    } else {
        UpstreamFailure::Transport(err.to_string())
    }
}

/// Copies the request body, swapping in the endpoint's upstream model name.
pub fn upstream_body(endpoint: &EndpointMember, body: &Value) -> Value {
    let mut body = body.clone();
    if let (Some(model), Some(obj)) = (endpoint.upstream_model.as_deref(), body.as_object_mut()) {
        obj.insert("model".to_string(), Value::String(model.to_string()));
    }
    body
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn complete(
        &self,
        endpoint: &EndpointMember,
        body: &Value,
        timeout: Duration,
    ) -> Result<UpstreamReply, UpstreamFailure> {
        let text = self
            .post(endpoint, &upstream_body(endpoint, body), timeout)
            .await?;
        let body: Value = serde_json::from_str(&text)
            .map_err(|err| UpstreamFailure::Transport(format!("invalid upstream json: {err}")))?;
        let usage = TokenUsage::from_body(&body);
        Ok(UpstreamReply { body, usage })
    }

    async fn probe(
        &self,
        endpoint: &EndpointMember,
        timeout: Duration,
    ) -> Result<(), UpstreamFailure> {
        let model = endpoint
            .upstream_model
            .clone()
            .unwrap_or_else(|| endpoint.endpoint_id.clone());
        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": "ping" }],
            "max_tokens": 1,
        });
        self.post(endpoint, &body, timeout).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn member(upstream_model: Option<&str>) -> EndpointMember {
        EndpointMember {
            endpoint_id: "gpt-a".to_string(),
            url: "http://localhost/v1/chat/completions".to_string(),
            api_key: "sk-up".to_string(),
            headers: BTreeMap::from([("x-tenant".to_string(), "eng".to_string())]),
            upstream_model: upstream_model.map(str::to_string),
            sort_order: 0,
            enabled: true,
        }
    }

    #[test]
    fn parses_openai_usage() {
        let usage = TokenUsage::from_body(&json!({
            "usage": { "prompt_tokens": 11, "completion_tokens": 7, "total_tokens": 18 }
        }));
        assert_eq!(
            usage,
            TokenUsage {
                input_tokens: 11,
                output_tokens: 7
            }
        );
        assert_eq!(TokenUsage::from_body(&json!({})), TokenUsage::default());
    }

    #[test]
    fn rewrites_model_only_when_configured() {
        let body = json!({ "model": "gpt", "messages": [] });
        assert_eq!(upstream_body(&member(None), &body)["model"], "gpt");
        assert_eq!(
            upstream_body(&member(Some("gpt-4o-2024")), &body)["model"],
            "gpt-4o-2024"
        );
    }

    #[test]
    fn builds_auth_and_extra_headers() {
        let headers = HttpUpstream::headers(&member(None)).expect("headers");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-up");
        assert_eq!(headers.get("x-tenant").unwrap(), "eng");
    }

    #[test]
    fn classifies_failures() {
        let status = |code| UpstreamFailure::Status {
            code,
            body: String::new(),
        };
        assert!(status(429).is_retryable());
        assert!(!status(429).counts_against_endpoint());
        assert!(status(503).counts_against_endpoint());
        assert!(!status(400).is_retryable());
        assert!(UpstreamFailure::Timeout.counts_against_endpoint());
    }
}
