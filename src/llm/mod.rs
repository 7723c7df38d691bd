//! Code Synthesis Client: one request/response round trip to the generator.
//!
//! `SynthesisClient` is the seam the rest of the crate talks to;
//! `AnthropicSynthesizer` is the production implementation. A service
//! fault is terminal for the request and is never retried here.

pub mod client;
pub mod prompts;
pub mod types;

use async_trait::async_trait;
use tracing::info;

use crate::conversation::ConversationTurn;
use crate::CodeLanguage;
pub use client::SynthesisError;
use client::AnthropicClient;
use types::{build_messages, resolve_model, MessagesRequest};

/// Everything the service needs for one call.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    /// Selects the role prompt.
    pub language: CodeLanguage,
    /// Already windowed by the caller.
    pub history: Vec<ConversationTurn>,
    pub message: String,
    pub current_code: Option<String>,
    pub last_error: Option<String>,
}

impl SynthesisRequest {
    /// User message with the current-code / last-error block in front.
    pub fn composed_message(&self) -> String {
        prompts::compose_user_message(
            &self.message,
            self.current_code.as_deref(),
            self.last_error.as_deref(),
        )
    }
}

/// A code-generation backend.
#[async_trait]
pub trait SynthesisClient: Send + Sync {
    /// Return the raw free-text response.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, SynthesisError>;
}

/// Synthesis over the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicSynthesizer {
    client: AnthropicClient,
    model: String,
    max_tokens: u32,
}

impl AnthropicSynthesizer {
    /// Create a synthesizer with an explicit API key.
    pub fn new(api_key: String, model: &str, max_tokens: u32) -> Self {
        Self {
            client: AnthropicClient::new(api_key),
            model: resolve_model(model).to_string(),
            max_tokens,
        }
    }

    /// Create a synthesizer reading ANTHROPIC_API_KEY from the environment.
    pub fn from_env(model: &str, max_tokens: u32) -> Result<Self, SynthesisError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            SynthesisError::MissingApiKey("ANTHROPIC_API_KEY environment variable not set".into())
        })?;
        Ok(Self::new(api_key, model, max_tokens))
    }

    /// Create a synthesizer with a custom base URL (for testing).
    pub fn with_base_url(api_key: String, model: &str, max_tokens: u32, base_url: String) -> Self {
        Self {
            client: AnthropicClient::with_base_url(api_key, base_url),
            model: resolve_model(model).to_string(),
            max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, request: &SynthesisRequest) -> MessagesRequest {
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: build_messages(&request.history, &request.composed_message()),
            system: Some(prompts::role_prompt(request.language)),
            temperature: None,
        }
    }
}

#[async_trait]
impl SynthesisClient for AnthropicSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, SynthesisError> {
        let api_request = self.build_request(request);
        info!(
            model = %self.model,
            language = %request.language,
            repair = request.last_error.is_some(),
            "requesting code synthesis"
        );
        let response = self.client.messages(&api_request).await?;
        info!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "synthesis response received"
        );
        response.text().ok_or(SynthesisError::EmptyResponse)
    }
}
