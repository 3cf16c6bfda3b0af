//! Outbound HTTP tool. Destinations are classified before any socket connect,
//! and every redirect hop goes through the same SSRF check.

use crate::errors::{CodedError, ErrorCode};
use crate::safety::net::validate_url;
use crate::tools::{Tool, ToolContext};
use crate::utils::truncate_at_utf8_boundary;
use async_trait::async_trait;
use serde_json::Value;

const MAX_REDIRECTS: usize = 5;

pub struct HttpRequestTool {
    client: reqwest::Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        let policy = reqwest::redirect::Policy::custom(|attempt| {
            if attempt.previous().len() > MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            match validate_url(attempt.url().as_str()) {
                Ok(_) => attempt.follow(),
                Err(err) => attempt.error(err),
            }
        });
        let client = reqwest::Client::builder()
            .redirect(policy)
            .build()
            .expect("http client construction cannot fail with static options");
        Self { client }
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn id(&self) -> &str {
        "http.request"
    }

    fn description(&self) -> &str {
        "Perform an HTTP request against a public http/https endpoint."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string", "enum": ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"] },
                "headers": { "type": "object", "additionalProperties": { "type": "string" } },
                "body": { "type": "string" }
            },
            "required": ["url"]
        })
    }

    async fn run(&self, input: Value, ctx: &ToolContext) -> Result<Value, CodedError> {
        let url = validate_url(input["url"].as_str().unwrap_or_default())?;
        let method = match input["method"].as_str().unwrap_or("GET") {
            "GET" => reqwest::Method::GET,
            "POST" => reqwest::Method::POST,
            "PUT" => reqwest::Method::PUT,
            "DELETE" => reqwest::Method::DELETE,
            "PATCH" => reqwest::Method::PATCH,
            "HEAD" => reqwest::Method::HEAD,
            other => {
                return Err(CodedError::new(
                    ErrorCode::InvalidInput,
                    format!("unsupported method '{}'", other),
                ))
            }
        };

        let mut request = self.client.request(method, url);
        if let Some(headers) = input["headers"].as_object() {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }
        if let Some(body) = input["body"].as_str() {
            request = request.body(body.to_string());
        }

        let response = request.send().await.map_err(|e| {
            // A blocked redirect surfaces as a reqwest redirect error wrapping
            // our own classification.
            let text = e.to_string();
            if text.contains("not allowed") {
                CodedError::new(ErrorCode::SsrfBlocked, "redirect target is not allowed")
                    .with_internal(text)
            } else if e.is_timeout() {
                CodedError::new(ErrorCode::Timeout, "request timed out").with_internal(text)
            } else {
                CodedError::new(ErrorCode::Unknown, "request failed").with_internal(text)
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await.map_err(|e| {
            CodedError::new(ErrorCode::Unknown, "failed to read response body")
                .with_internal(e.to_string())
        })?;

        let truncated = bytes.len() > ctx.policy.max_bytes;
        let body = String::from_utf8_lossy(truncate_at_utf8_boundary(
            &bytes,
            ctx.policy.max_bytes,
        ))
        .into_owned();

        Ok(serde_json::json!({
            "status": status,
            "contentType": content_type,
            "body": body,
            "truncated": truncated,
        }))
    }
}
