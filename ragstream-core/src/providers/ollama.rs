//! Ollama native chat provider.
//!
//! Talks to `POST {base}/api/chat`. Streaming responses are newline-delimited
//! JSON objects, each carrying `message.content` and a `done` flag. No
//! authentication is sent.

use super::wire::{self, ConnectionLease, FragmentStream, WireFormat};
use super::{ChatProvider, EMPTY_RESPONSE_TEXT, build_client, map_http_error, map_send_error};
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::prompt::AssembledPrompt;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

/// Ollama chat provider.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    num_ctx: u32,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.effective_base_url().to_string(),
            model: config.effective_model().to_string(),
            temperature: config.temperature,
            num_ctx: config.num_ctx,
        })
    }

    fn request_body(&self, prompt: &AssembledPrompt, stream: bool) -> Value {
        json!({
            "model": self.model,
            "stream": stream,
            "options": {
                "temperature": self.temperature,
                "num_ctx": self.num_ctx,
            },
            "messages": prompt.messages(),
        })
    }

    fn parse_response(body: &Value) -> String {
        body.get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .unwrap_or(EMPTY_RESPONSE_TEXT)
            .to_string()
    }

    async fn send(&self, prompt: &AssembledPrompt, stream: bool) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(url = %url, model = %self.model, stream, "Sending Ollama chat request");

        let response = self
            .client
            .post(&url)
            .json(&self.request_body(prompt, stream))
            .send()
            .await
            .map_err(|e| map_send_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    async fn complete(&self, prompt: &AssembledPrompt) -> Result<String, LlmError> {
        let response = self.send(prompt, false).await?;
        let json: Value = response.json().await.map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid JSON: {}", e),
        })?;
        Ok(Self::parse_response(&json))
    }

    async fn stream(&self, prompt: &AssembledPrompt) -> Result<FragmentStream, LlmError> {
        let response = self.send(prompt, true).await?;
        Ok(wire::adapt(
            WireFormat::NdjsonMessage,
            wire::body_stream(response),
            ConnectionLease::new(self.name()),
        ))
    }

    fn name(&self) -> &str {
        "ollama"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::NdjsonMessage
    }
}
