//! Configuration system for ragstream.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/ragstream/config.toml` and/or `ragstream.toml`
//! in the working directory. The resulting [`AppConfig`] is built once at startup and
//! handed to the components that need it; nothing downstream reads the environment.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Name of the workspace-local configuration file.
pub const CONFIG_FILE_NAME: &str = "ragstream.toml";

/// Top-level configuration for ragstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Which upstream wire protocol family the LLM provider speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions (OpenRouter, OpenAI, vLLM...), SSE streaming.
    #[default]
    #[serde(alias = "openrouter")]
    OpenAi,
    /// Ollama `/api/chat`, NDJSON streaming.
    Ollama,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::Ollama => write!(f, "ollama"),
        }
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider family: "openai" or "ollama".
    pub provider: ProviderKind,
    /// Model identifier. Falls back to a per-provider default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Base URL override for the API endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Resolved API key. Populated from `api_key_env` at load time, never serialized.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Context window requested from Ollama (`options.num_ctx`).
    pub num_ctx: u32,
    /// `HTTP-Referer` attribution header sent to OpenRouter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    /// `X-Title` attribution header sent to OpenRouter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_title: Option<String>,
    /// TCP connect timeout for upstream calls. Reads are unbounded.
    pub connect_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: None,
            base_url: None,
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            api_key: None,
            temperature: 0.2,
            num_ctx: 8192,
            referer: None,
            app_title: None,
            connect_timeout_secs: 10,
        }
    }
}

impl LlmConfig {
    /// The model to request, honoring the per-provider default.
    pub fn effective_model(&self) -> &str {
        match (&self.model, self.provider) {
            (Some(model), _) => model,
            (None, ProviderKind::OpenAi) => "tngtech/deepseek-r1t2-chimera:free",
            (None, ProviderKind::Ollama) => "llama3.1:8b-instruct-q4_K_M",
        }
    }

    /// The provider base URL without a trailing slash.
    pub fn effective_base_url(&self) -> &str {
        let url = match (&self.base_url, self.provider) {
            (Some(url), _) => url.as_str(),
            (None, ProviderKind::OpenAi) => "https://openrouter.ai/api/v1",
            (None, ProviderKind::Ollama) => "http://localhost:11434",
        };
        url.trim_end_matches('/')
    }

    /// Validate this LLM config and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !(0.0..=2.0).contains(&self.temperature) {
            warnings.push(format!(
                "temperature ({}) is outside the typical range 0.0-2.0",
                self.temperature
            ));
        }
        if self.provider == ProviderKind::OpenAi && self.api_key.is_none() {
            warnings.push(format!(
                "no API key found in '{}'; chat requests will fail until it is set",
                self.api_key_env
            ));
        }
        warnings
    }
}

/// What to do when the retrieval backend cannot be queried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalFailurePolicy {
    /// Fail the request with the retrieval error.
    #[default]
    Fail,
    /// Log a warning and answer without context.
    Degrade,
}

/// Retrieval backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Base URL of the retrieval service (`/query`, `/insert`).
    pub base_url: String,
    /// Number of chunks requested per query.
    pub top_k: usize,
    /// Behavior when the backend call fails.
    pub on_failure: RetrievalFailurePolicy,
    /// Whole-request timeout for retrieval calls.
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            top_k: 6,
            on_failure: RetrievalFailurePolicy::Fail,
            timeout_secs: 30,
        }
    }
}

/// Streaming relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Buffered characters that trigger a flush to the client.
    pub flush_threshold: usize,
    /// Capacity of the per-request event channel.
    pub channel_capacity: usize,
    /// Interval of SSE keep-alive comments (0 disables them).
    pub keep_alive_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 40,
            channel_capacity: 64,
            keep_alive_secs: 15,
        }
    }
}

/// Document ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Directory of documents to index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_dir: Option<PathBuf>,
    /// Window size in characters.
    pub chunk_size: usize,
    /// Characters shared by consecutive windows.
    pub chunk_overlap: usize,
    /// File extensions (without dot) picked up by the walker.
    pub extensions: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            docs_dir: None,
            chunk_size: 800,
            chunk_overlap: 200,
            extensions: vec!["txt".to_string()],
        }
    }
}

impl AppConfig {
    /// Validate the whole configuration and return human-readable warnings.
    ///
    /// Returns an empty Vec if the config is valid. Warnings never abort startup.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.llm.validate();
        if self.ingest.chunk_size == 0 {
            warnings.push("ingest.chunk_size is 0; ingestion will be rejected".to_string());
        } else if self.ingest.chunk_overlap >= self.ingest.chunk_size {
            warnings.push(format!(
                "ingest.chunk_overlap ({}) >= ingest.chunk_size ({}); ingestion will be rejected",
                self.ingest.chunk_overlap, self.ingest.chunk_size
            ));
        }
        if self.relay.flush_threshold == 0 {
            warnings.push(
                "relay.flush_threshold is 0; every fragment is sent as its own event".to_string(),
            );
        }
        if self.retrieval.top_k == 0 {
            warnings.push("retrieval.top_k is 0; prompts will never carry context".to_string());
        }
        warnings
    }

    /// Render the configuration as TOML (the API key is never included).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            message: e.to_string(),
        })
    }
}

/// Map the legacy provider variables onto config keys.
fn legacy_env() -> Env {
    Env::raw().filter_map(|key| {
        match key.as_str().to_ascii_uppercase().as_str() {
            "OPENROUTER_BASE_URL" => Some("llm.base_url".into()),
            "OPENROUTER_MODEL" => Some("llm.model".into()),
            _ => None,
        }
    })
}

/// Settings given on the command line. Only the fields that are set win over
/// the file and environment layers.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Build the figment used by [`load_config`].
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `RAGSTREAM_`, `__` separates sections)
/// 3. Legacy `OPENROUTER_BASE_URL` / `OPENROUTER_MODEL`
/// 4. Explicit config file, or `ragstream.toml` in the working directory
/// 5. User config (`~/.config/ragstream/config.toml`)
/// 6. Built-in defaults
pub fn figment(config_file: Option<&Path>, overrides: &ConfigOverrides) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "ragstream", "ragstream") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    match config_file {
        Some(path) => figment = figment.merge(Toml::file(path)),
        None => {
            let local = Path::new(CONFIG_FILE_NAME);
            if local.exists() {
                figment = figment.merge(Toml::file(local));
            }
        }
    }

    figment = figment
        .merge(legacy_env())
        .merge(Env::prefixed("RAGSTREAM_").split("__"));

    if let Some(host) = &overrides.host {
        figment = figment.merge(Serialized::default("server.host", host));
    }
    if let Some(port) = overrides.port {
        figment = figment.merge(Serialized::default("server.port", port));
    }

    figment
}

/// Load configuration and resolve the provider credential.
///
/// The API key is read once here from the variable named by `llm.api_key_env`.
/// A missing key is not an error at this point: it surfaces as a
/// `MissingCredential` failure on the first chat request.
pub fn load_config(
    config_file: Option<&Path>,
    overrides: &ConfigOverrides,
) -> crate::error::Result<AppConfig> {
    if let Some(path) = config_file
        && !path.exists()
    {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }

    let mut config: AppConfig = figment(config_file, overrides)
        .extract()
        .map_err(|e| ConfigError::Invalid {
            message: e.to_string(),
        })?;

    if config.llm.api_key.is_none() {
        config.llm.api_key = std::env::var(&config.llm.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
    }

    Ok(config)
}
