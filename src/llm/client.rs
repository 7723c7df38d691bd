//! HTTP transport to the Messages API.
//!
//! Knows nothing about sessions or retries; one call in, one response or
//! one `SynthesisError` out.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::types::{MessagesRequest, MessagesResponse};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
/// Generation of a long program can take a while; anything past this is a hang.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors talking to the code-generation service. Always terminal for a request.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("empty response from code generation service")]
    EmptyResponse,

    #[error("missing API key: {0}")]
    MissingApiKey(String),
}

/// Error envelope the API returns with 4xx/5xx statuses.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// Readable message from an error body; the raw body when it is not JSON.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => format!("{}: {}", env.error.kind, env.error.message),
        Err(_) if body.trim().is_empty() => "(no body)".into(),
        Err(_) => body.trim().to_string(),
    }
}

#[derive(Debug)]
pub struct AnthropicClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.into())
    }

    /// Point at another host (a local stub in tests).
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("quantloop/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn messages(
        &self,
        request: &MessagesRequest,
    ) -> Result<MessagesResponse, SynthesisError> {
        let url = format!("{}/v1/messages", self.base_url);
        debug!(model = %request.model, messages = request.messages.len(), "sending synthesis request");

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            return Err(SynthesisError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisError::ApiError {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| SynthesisError::InvalidResponse(format!("failed to parse response: {e}")))
    }
}
