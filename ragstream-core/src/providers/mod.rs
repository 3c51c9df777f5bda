//! Chat provider implementations.
//!
//! Provides concrete implementations of the [`ChatProvider`] trait for:
//! - OpenAI-compatible chat completions APIs (OpenRouter, OpenAI, vLLM), streaming SSE deltas
//! - Ollama's native chat API, streaming NDJSON messages
//!
//! Use [`create_provider()`] to instantiate the appropriate provider based on config.

pub mod mock;
pub mod ollama;
pub mod openai_compat;
pub mod wire;

use crate::config::{LlmConfig, ProviderKind};
use crate::error::LlmError;
use crate::prompt::AssembledPrompt;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub use mock::ScriptedProvider;
pub use ollama::OllamaProvider;
pub use openai_compat::OpenAiCompatibleProvider;
pub use wire::{ConnectionLease, FragmentStream, LineOutcome, WireFormat, adapt};

/// Text returned by the non-streaming path when the model produced nothing.
pub const EMPTY_RESPONSE_TEXT: &str = "(no response)";

/// An upstream chat model.
///
/// Both methods send the two-message prompt exactly once and never retry.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send the prompt with streaming disabled and return the full answer.
    ///
    /// Returns [`EMPTY_RESPONSE_TEXT`] when the upstream answer has no content.
    async fn complete(&self, prompt: &AssembledPrompt) -> Result<String, LlmError>;

    /// Send the prompt with streaming enabled.
    ///
    /// Resolves once response headers arrive with a success status; the body is
    /// consumed lazily through the returned stream.
    async fn stream(&self, prompt: &AssembledPrompt) -> Result<FragmentStream, LlmError>;

    /// Short provider identifier for logs.
    fn name(&self) -> &str;

    /// The model requested upstream.
    fn model_name(&self) -> &str;

    /// Streaming encoding used by this provider.
    fn wire_format(&self) -> WireFormat;
}

/// Map a non-success upstream status to an error carrying the response body.
pub(crate) fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
    debug!(status = status.as_u16(), body = %body, "Upstream returned error status");
    LlmError::UpstreamStatus {
        status: status.as_u16(),
        body: body.to_string(),
    }
}

/// Map a transport failure before any response arrived.
pub(crate) fn map_send_error(url: &str, err: reqwest::Error) -> LlmError {
    LlmError::Connection {
        message: format!("{}: {}", url, err),
    }
}

/// Shared HTTP client honoring the configured connect timeout.
///
/// No overall request timeout is set so long generations are not cut off.
pub(crate) fn build_client(config: &LlmConfig) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
        .build()
        .map_err(|e| LlmError::Connection {
            message: format!("failed to build HTTP client: {}", e),
        })
}

/// Create a chat provider based on the configuration.
///
/// Routes to the appropriate provider implementation:
/// - `openai` (alias `openrouter`) → [`OpenAiCompatibleProvider`]
/// - `ollama` → [`OllamaProvider`]
///
/// A missing API key is not an error here; it surfaces on the first request.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn ChatProvider>, LlmError> {
    let provider: Arc<dyn ChatProvider> = match config.provider {
        ProviderKind::OpenAi => Arc::new(OpenAiCompatibleProvider::new(config)?),
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(config)?),
    };
    debug!(
        provider = provider.name(),
        model = provider.model_name(),
        "Chat provider created"
    );
    Ok(provider)
}
