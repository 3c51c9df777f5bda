//! OpenAI-compatible chat provider.
//!
//! Supports OpenRouter, OpenAI, vLLM, LM Studio, and any endpoint that follows
//! the OpenAI chat completions API format. Streaming responses arrive as SSE
//! `data:` lines carrying `choices[0].delta.content`.

use super::wire::{self, ConnectionLease, FragmentStream, WireFormat};
use super::{ChatProvider, EMPTY_RESPONSE_TEXT, build_client, map_http_error, map_send_error};
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::prompt::AssembledPrompt;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::net::IpAddr;
use tracing::debug;

/// OpenAI-compatible chat provider.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_key_env: String,
    model: String,
    temperature: f32,
    referer: Option<String>,
    app_title: Option<String>,
}

impl OpenAiCompatibleProvider {
    /// Create a new provider from configuration.
    ///
    /// The API key is taken from `config.api_key`, which the config loader fills
    /// from the variable named by `api_key_env`. A missing key is reported on
    /// the first request rather than here.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.effective_base_url().to_string(),
            api_key: config.api_key.clone(),
            api_key_env: config.api_key_env.clone(),
            model: config.effective_model().to_string(),
            temperature: config.temperature,
            referer: config.referer.clone(),
            app_title: config.app_title.clone(),
        })
    }

    fn is_local(&self) -> bool {
        is_loopback_url(&self.base_url)
    }

    /// Build the chat completions request body.
    fn request_body(&self, prompt: &AssembledPrompt, stream: bool) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "stream": stream,
            "messages": prompt.messages(),
        })
    }

    /// Parse a non-streaming response body into the answer text.
    fn parse_response(body: &Value) -> String {
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .unwrap_or(EMPTY_RESPONSE_TEXT)
            .to_string()
    }

    /// POST the prompt and return the response once a success status arrives.
    async fn send(&self, prompt: &AssembledPrompt, stream: bool) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&self.request_body(prompt, stream));

        match &self.api_key {
            Some(key) => request = request.header("Authorization", format!("Bearer {}", key)),
            None if self.is_local() => {
                debug!("No API key set for local endpoint; sending without Authorization");
            }
            None => {
                return Err(LlmError::MissingCredential {
                    provider: self.name().to_string(),
                    var: self.api_key_env.clone(),
                });
            }
        }
        if let Some(referer) = &self.referer {
            request = request.header("HTTP-Referer", referer);
        }
        if let Some(title) = &self.app_title {
            request = request.header("X-Title", title);
        }

        debug!(url = %url, model = %self.model, stream, "Sending chat completion request");

        let response = request.send().await.map_err(|e| map_send_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    async fn complete(&self, prompt: &AssembledPrompt) -> Result<String, LlmError> {
        let response = self.send(prompt, false).await?;
        let body = response.text().await.map_err(|e| LlmError::Connection {
            message: format!("Failed to read response body: {}", e),
        })?;
        let json: Value = serde_json::from_str(&body).map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid JSON: {}", e),
        })?;
        Ok(Self::parse_response(&json))
    }

    async fn stream(&self, prompt: &AssembledPrompt) -> Result<FragmentStream, LlmError> {
        let response = self.send(prompt, true).await?;
        Ok(wire::adapt(
            WireFormat::SseDelta,
            wire::body_stream(response),
            ConnectionLease::new(self.name()),
        ))
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::SseDelta
    }
}

/// Whether `url` points at this machine (`localhost` or a loopback address).
fn is_loopback_url(url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(url) else {
        return false;
    };
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback()),
        None => false,
    }
}
