use crate::channels::MessageHandler;
use crate::config::HandlerConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelConfig<'a> {
    provider: &'a str,
    model_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest<'a> {
    message: &'a str,
    history: &'a [serde_json::Value],
    phone: &'a str,
    model_config: ModelConfig<'a>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Forwards each message to the dashboard chat endpoint.
pub struct ChatApiHandler {
    client: reqwest::Client,
    url: String,
    provider: String,
    model_id: String,
}

impl ChatApiHandler {
    pub fn new(url: impl Into<String>, config: &HandlerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build chat API client")?;
        Ok(Self {
            client,
            url: url.into(),
            provider: config.provider.clone(),
            model_id: config.model_id.clone(),
        })
    }
}

/// `"56912345678@s.whatsapp.net"` → `"56912345678"`.
fn sender_phone(sender: &str) -> &str {
    sender.split('@').next().unwrap_or(sender)
}

#[async_trait]
impl MessageHandler for ChatApiHandler {
    async fn handle(&self, text: &str, sender: &str) -> Result<String> {
        let body = ChatRequest {
            message: text,
            history: &[],
            phone: sender_phone(sender),
            model_config: ModelConfig {
                provider: &self.provider,
                model_id: &self.model_id,
            },
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Chat API request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat API returned {status}: {detail}");
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Chat API returned an unreadable body")?;
        if !parsed.success {
            anyhow::bail!(
                "Chat API reported failure: {}",
                parsed.error.as_deref().unwrap_or("unknown error")
            );
        }
        parsed
            .response
            .filter(|reply| !reply.trim().is_empty())
            .context("Chat API returned no response text")
    }
}

/// Replies with the inbound text. Used when no chat endpoint is configured.
pub struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, text: &str, _sender: &str) -> Result<String> {
        Ok(text.to_string())
    }
}

pub fn build_handler(config: &HandlerConfig) -> Result<Arc<dyn MessageHandler>> {
    match config.chat_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            tracing::info!("Relaying WhatsApp messages to chat API at {url}");
            Ok(Arc::new(ChatApiHandler::new(url, config)?))
        }
        _ => {
            tracing::warn!("No chat endpoint configured; WhatsApp messages will be echoed");
            Ok(Arc::new(EchoHandler))
        }
    }
}
