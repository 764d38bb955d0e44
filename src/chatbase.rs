use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::{keys, required, ConfigSource};
use crate::error::AdapterError;

const SERVICE: &str = "chatbase";

/// Sent when the backend answers successfully but with no usable text.
pub const FALLBACK_REPLY: &str =
    "Sorry, I couldn't put an answer together just now. Please try again in a moment.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiReply {
    pub text: String,
    pub conversation_id: String,
}

/// Conversational backend queried with the accumulated user text.
#[async_trait]
pub trait AiAgent: Send + Sync {
    async fn query(
        &self,
        content: &str,
        conversation_id: Option<&str>,
        user_id: &str,
    ) -> Result<AiReply, AdapterError>;
}

pub struct ChatbaseClient {
    http: reqwest::Client,
    config: Arc<dyn ConfigSource>,
    api_base: String,
}

impl ChatbaseClient {
    pub fn new(http: reqwest::Client, config: Arc<dyn ConfigSource>, api_base: &str) -> Self {
        Self {
            http,
            config,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

fn new_conversation_id(user_id: &str) -> String {
    let digits = user_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>();
    format!("wa-{digits}-{}", Uuid::new_v4().simple())
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Reply text in priority order `text`, `message`, `answer`, then the same
/// keys under `data`. Never empty.
pub fn resolve_reply_text(payload: &Value) -> String {
    const FIELDS: [&str; 3] = ["text", "message", "answer"];
    let scopes = [Some(payload), payload.get("data")];
    scopes
        .into_iter()
        .flatten()
        .find_map(|scope| {
            FIELDS
                .iter()
                .find_map(|field| scope.get(*field).and_then(non_empty_str))
        })
        .map(str::to_string)
        .unwrap_or_else(|| FALLBACK_REPLY.to_string())
}

pub fn resolve_conversation_id(payload: &Value) -> Option<String> {
    ["conversationId", "conversation_id"]
        .iter()
        .find_map(|field| payload.get(*field).and_then(non_empty_str))
        .map(str::to_string)
}

pub fn chat_request_body(chatbot_id: &str, conversation_id: &str, content: &str) -> Value {
    json!({
        "messages": [
            { "role": "user", "content": content }
        ],
        "chatbotId": chatbot_id,
        "conversationId": conversation_id,
        "stream": false
    })
}

#[async_trait]
impl AiAgent for ChatbaseClient {
    async fn query(
        &self,
        content: &str,
        conversation_id: Option<&str>,
        user_id: &str,
    ) -> Result<AiReply, AdapterError> {
        let chatbot_id = required(self.config.as_ref(), keys::CHATBASE_CHATBOT_ID).await?;
        let api_key = required(self.config.as_ref(), keys::CHATBASE_API_KEY).await?;
        let conversation_id = conversation_id
            .map(str::to_string)
            .unwrap_or_else(|| new_conversation_id(user_id));

        let response = self
            .http
            .post(format!("{}/chat", self.api_base))
            .bearer_auth(api_key)
            .json(&chat_request_body(&chatbot_id, &conversation_id, content))
            .send()
            .await
            .map_err(|e| AdapterError::request(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Api {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|e| AdapterError::invalid(SERVICE, e.to_string()))?;

        Ok(AiReply {
            text: resolve_reply_text(&payload),
            conversation_id: resolve_conversation_id(&payload).unwrap_or(conversation_id),
        })
    }
}
