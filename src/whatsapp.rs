use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde_json::{json, Value};
use sha2::Sha256;

use crate::config::{keys, optional, required, ConfigSource};
use crate::error::AdapterError;

const SERVICE: &str = "whatsapp";
const MAX_TEXT_BODY_CHARS: usize = 4096;

/// Delivers reply text to an end user.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendMode {
    Text,
    Template { name: String, language: String },
}

pub struct WhatsAppClient {
    http: reqwest::Client,
    config: Arc<dyn ConfigSource>,
    graph_base: String,
}

impl WhatsAppClient {
    pub fn new(http: reqwest::Client, config: Arc<dyn ConfigSource>, graph_base: &str) -> Self {
        Self {
            http,
            config,
            graph_base: graph_base.trim_end_matches('/').to_string(),
        }
    }

    async fn send_mode(&self) -> Result<SendMode, AdapterError> {
        let mode = optional(self.config.as_ref(), keys::WHATSAPP_SEND_MODE)
            .await?
            .unwrap_or_else(|| "text".to_string())
            .to_ascii_lowercase();
        if mode != "template" {
            return Ok(SendMode::Text);
        }
        let name = required(self.config.as_ref(), keys::WHATSAPP_TEMPLATE_NAME).await?;
        let language = optional(self.config.as_ref(), keys::WHATSAPP_TEMPLATE_LANGUAGE)
            .await?
            .unwrap_or_else(|| "en_US".to_string());
        Ok(SendMode::Template { name, language })
    }
}

#[async_trait]
impl OutboundChannel for WhatsAppClient {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), AdapterError> {
        let access_token = required(self.config.as_ref(), keys::WHATSAPP_ACCESS_TOKEN).await?;
        let phone_number_id =
            required(self.config.as_ref(), keys::WHATSAPP_PHONE_NUMBER_ID).await?;
        let to_phone = normalize_whatsapp_phone(to)
            .ok_or_else(|| AdapterError::invalid(SERVICE, format!("invalid recipient '{to}'")))?;
        let formatted = format_reply_for_whatsapp(text);
        let payload = message_payload(&to_phone, &formatted, &self.send_mode().await?);

        let response = self
            .http
            .post(format!("{}/{}/messages", self.graph_base, phone_number_id))
            .bearer_auth(&access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::request(SERVICE, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(AdapterError::Api {
            service: SERVICE,
            status: status.as_u16(),
            body,
        })
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

pub fn message_payload(to_phone: &str, text: &str, mode: &SendMode) -> Value {
    let body = truncate_chars(text, MAX_TEXT_BODY_CHARS);
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to_phone,
    });
    match mode {
        SendMode::Text => {
            payload["type"] = json!("text");
            payload["text"] = json!({
                "preview_url": false,
                "body": body
            });
        }
        SendMode::Template { name, language } => {
            payload["type"] = json!("template");
            payload["template"] = json!({
                "name": name,
                "language": { "code": language },
                "components": [{
                    "type": "body",
                    "parameters": [{ "type": "text", "text": body }]
                }]
            });
        }
    }
    payload
}

/// Rewrites Markdown from the AI backend into WhatsApp's own formatting.
pub fn format_reply_for_whatsapp(markdown: &str) -> String {
    let bold_re = Regex::new(r"\*\*(.+?)\*\*").ok();
    let underline_bold_re = Regex::new(r"__(.+?)__").ok();
    let links_re = Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").ok();
    let headings_re = Regex::new(r"(?m)^#{1,6}\s*").ok();

    let mut text = markdown.to_string();
    if let Some(re) = bold_re.as_ref() {
        text = re.replace_all(&text, "*$1*").to_string();
    }
    if let Some(re) = underline_bold_re.as_ref() {
        text = re.replace_all(&text, "*$1*").to_string();
    }
    if let Some(re) = links_re.as_ref() {
        text = re.replace_all(&text, "$1 ($2)").to_string();
    }
    if let Some(re) = headings_re.as_ref() {
        text = re.replace_all(&text, "").to_string();
    }
    let text = text.trim();
    if text.is_empty() {
        markdown.trim().to_string()
    } else {
        text.to_string()
    }
}

pub fn normalize_whatsapp_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Checks `x-hub-signature-256`. An empty secret disables the check.
pub fn verify_whatsapp_signature(
    app_secret: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn whatsapp_contact_profile_names(value: &Value) -> HashMap<String, String> {
    let contacts = value
        .get("contacts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut map = HashMap::new();
    for contact in contacts {
        let wa_id = contact
            .get("wa_id")
            .and_then(Value::as_str)
            .or_else(|| contact.get("input").and_then(Value::as_str))
            .unwrap_or("");
        let Some(digits) = normalize_whatsapp_phone(wa_id) else {
            continue;
        };
        let name = contact
            .get("profile")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        map.insert(digits, name);
    }
    map
}

/// Text carried by an inbound message, for the types the relay answers.
pub fn inbound_text(message: &Value) -> Option<String> {
    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_ascii_lowercase();

    let text = match msg_type.as_str() {
        "text" => message
            .get("text")
            .and_then(|v| v.get("body"))
            .and_then(Value::as_str),
        "button" => message
            .get("button")
            .and_then(|v| v.get("text"))
            .and_then(Value::as_str),
        "interactive" => message.get("interactive").and_then(|v| {
            v.get("button_reply")
                .and_then(|r| r.get("title"))
                .and_then(Value::as_str)
                .or_else(|| {
                    v.get("list_reply")
                        .and_then(|r| r.get("title"))
                        .and_then(Value::as_str)
                })
        }),
        _ => None,
    }?;

    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub user_id: String,
    pub text: String,
    pub display_name: Option<String>,
}

/// Flattens a webhook body into the text messages it carries, in order.
/// Changes addressed to a different phone number id are ignored.
pub fn inbound_messages(payload: &Value, expected_phone_number_id: &str) -> Vec<InboundMessage> {
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::new();
    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for change in changes {
            let value = change.get("value").cloned().unwrap_or_else(|| json!({}));
            let metadata_phone_id = value
                .get("metadata")
                .and_then(|m| m.get("phone_number_id"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if !expected_phone_number_id.is_empty()
                && !metadata_phone_id.is_empty()
                && expected_phone_number_id != metadata_phone_id
            {
                continue;
            }
            let profile_names = whatsapp_contact_profile_names(&value);

            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for message in messages {
                let from = message.get("from").and_then(Value::as_str).unwrap_or("");
                let Some(user_id) = normalize_whatsapp_phone(from) else {
                    continue;
                };
                let Some(text) = inbound_text(&message) else {
                    continue;
                };
                let display_name = profile_names
                    .get(&user_id)
                    .filter(|name| !name.is_empty())
                    .cloned();
                out.push(InboundMessage {
                    user_id,
                    text,
                    display_name,
                });
            }
        }
    }
    out
}
