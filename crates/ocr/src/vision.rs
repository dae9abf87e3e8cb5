use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use billscan_core::Money;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::types::ExtractedReceipt;

const SYSTEM_PROMPT: &str = r#"You extract fields from receipts. Respond ONLY with compact JSON: {"organization":"string","amount":number,"tip":number}"#;
const USER_PROMPT: &str =
    "Analyze this bill/receipt image and extract the fields. Respond ONLY with JSON.";

/// Organization used when the hosted model leaves the field out.
const UNKNOWN_ORGANIZATION: &str = "Unknown";

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Remote extraction is not configured")]
    NotConfigured,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Vision API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Empty response from vision model")]
    EmptyResponse,
    #[error("Could not parse vision model reply: {0}")]
    Parse(String),
}

/// A hosted model that reads the three receipt fields straight from the image.
/// Drop-in replacement for local OCR + extraction.
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    async fn extract(&self, image: &[u8], mime_type: &str) -> Result<ExtractedReceipt, VisionError>;
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiVisionExtractor {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiVisionExtractor {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[async_trait]
impl VisionExtractor for OpenAiVisionExtractor {
    async fn extract(&self, image: &[u8], mime_type: &str) -> Result<ExtractedReceipt, VisionError> {
        info!(model = %self.model, bytes = image.len(), "Sending receipt image to vision model");

        let data_url = format!("data:{mime_type};base64,{}", BASE64.encode(image));
        let body = json!({
            "model": self.model,
            "temperature": 0.2,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": USER_PROMPT },
                        { "type": "image_url", "image_url": { "url": data_url } }
                    ]
                }
            ]
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Api { status, body });
        }

        let chat: ChatResponse = response.json().await?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(VisionError::EmptyResponse)?;

        parse_vision_reply(&content)
    }
}

#[derive(Debug, Deserialize)]
struct VisionReply {
    organization: Option<String>,
    amount: Option<Decimal>,
    tip: Option<Decimal>,
}

/// Strip markdown fences or surrounding chatter, then read the JSON object.
pub fn parse_vision_reply(content: &str) -> Result<ExtractedReceipt, VisionError> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let start = trimmed.find('{').ok_or_else(|| VisionError::Parse("no JSON object".into()))?;
    let end = trimmed.rfind('}').ok_or_else(|| VisionError::Parse("no JSON object".into()))?;
    if end <= start {
        return Err(VisionError::Parse("malformed JSON object".into()));
    }

    let reply: VisionReply = serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| VisionError::Parse(e.to_string()))?;

    let organization = reply
        .organization
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .unwrap_or_else(|| UNKNOWN_ORGANIZATION.to_string());
    // Same windows the local extractor enforces; anything outside becomes zero.
    let bounded = |d: Option<Decimal>, cap: Money| {
        d.map(Money::from_decimal)
            .filter(|m| m.is_between(Money::zero(), cap))
            .unwrap_or_default()
    };

    Ok(ExtractedReceipt {
        organization,
        amount: bounded(reply.amount, Money::from_cents(1_000_000)),
        tip: bounded(reply.tip, Money::from_cents(100_000)),
        diagnostics: Vec::new(),
    })
}
