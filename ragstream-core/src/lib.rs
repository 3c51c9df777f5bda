//! # Ragstream Core
//!
//! Core library for the ragstream chat relay.
//! Provides document chunking and ingestion, the retrieval client, prompt
//! assembly, the dual-protocol upstream adapter, the streaming relay, the
//! HTTP gateway, configuration, and error types.

pub mod chunker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod pipeline;
pub mod prompt;
pub mod providers;
pub mod relay;
pub mod retrieval;
pub mod types;

// Re-export commonly used types at the crate root.
pub use config::{
    AppConfig, ConfigOverrides, ProviderKind, RetrievalFailurePolicy, load_config,
};
pub use error::{ChunkError, ConfigError, LlmError, RagError, Result, RetrievalError};
pub use gateway::{GatewayState, SharedGateway, gateway_router, run_gateway};
pub use ingest::{IngestStats, ingest_directory};
pub use pipeline::RagPipeline;
pub use prompt::{AssembledPrompt, assemble};
pub use providers::{ChatProvider, ScriptedProvider, WireFormat, create_provider};
pub use relay::{EventSink, FlushBuffer, RelayEvent, RelayOutcome, RelayState, StreamingRelay};
pub use retrieval::{HttpRetrievalClient, MockRetrieval, RetrievalBackend};
pub use types::{PromptMessage, Role, StreamFragment};
