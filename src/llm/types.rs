//! Rust types for the Anthropic Messages API.
//!
//! Serde-serializable to JSON for HTTP calls. Internal types stay Rust-native.

use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationTurn, Role};

/// Resolve model aliases to full Anthropic model IDs.
pub fn resolve_model(alias: &str) -> &str {
    match alias {
        "opus" => "claude-opus-4-20250514",
        "sonnet" => "claude-sonnet-4-5-20250514",
        "haiku" => "claude-haiku-4-5-20251001",
        _ => alias, // pass through full model IDs
    }
}

/// Request body for the Anthropic Messages API.
#[derive(Debug, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// A single message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Response from the Anthropic Messages API.
#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

/// A content block in the response.
#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
}

/// Token usage from the API response.
#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl MessagesResponse {
    /// Concatenated text of all text blocks, if any.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter(|b| b.content_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(""))
        }
    }
}

/// Map history plus a final user message onto API messages.
///
/// The API wants alternating roles starting with `user`: leading assistant
/// turns are dropped and consecutive same-role turns are merged.
pub fn build_messages(history: &[ConversationTurn], user_message: &str) -> Vec<Message> {
    let mut messages: Vec<Message> = Vec::new();
    let turns = history
        .iter()
        .map(|t| (t.role, t.content.as_str()))
        .chain(std::iter::once((Role::User, user_message)));

    for (role, content) in turns {
        if messages.is_empty() && role == Role::Assistant {
            continue;
        }
        match messages.last_mut() {
            Some(last) if last.role == role.as_str() => {
                last.content.push_str("\n\n");
                last.content.push_str(content);
            }
            _ => messages.push(Message {
                role: role.as_str().into(),
                content: content.to_string(),
            }),
        }
    }
    messages
}
