//! Error types for the ragstream core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering the LLM upstream, the retrieval backend, chunking, and
//! configuration.

use std::path::PathBuf;

/// Top-level error type for the ragstream core library.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Chunking error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{provider}: credential not configured (set the {var} environment variable)")]
    MissingCredential { provider: String, var: String },

    #[error("upstream returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Upstream protocol error: {message}")]
    Protocol { message: String },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },
}

/// Errors from the retrieval backend.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// The backend could not be reached at all (connection refused, DNS, timeout).
    #[error("retrieval backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("retrieval backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid retrieval response: {message}")]
    Decode { message: String },
}

/// Invalid chunking parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk size must be greater than zero")]
    ZeroSize,

    #[error("chunk overlap ({overlap}) must be smaller than chunk size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// A type alias for results using the top-level `RagError`.
pub type Result<T> = std::result::Result<T, RagError>;
