//! The RAG request pipeline shared by both response paths.
//!
//! [`RagPipeline::prepare`] runs retrieval, deduplication, and prompt
//! assembly. The non-streaming path sends the result upstream once; the
//! streaming path hands it to a [`StreamingRelay`] running on its own task.

use crate::config::{AppConfig, RelayConfig, RetrievalConfig, RetrievalFailurePolicy};
use crate::error::RagError;
use crate::prompt::{AssembledPrompt, assemble};
use crate::providers::{ChatProvider, create_provider};
use crate::relay::{EventSink, RelayEvent, StreamingRelay};
use crate::retrieval::{HttpRetrievalClient, RetrievalBackend, dedup_preserving_order};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Retrieval plus generation against one provider.
pub struct RagPipeline {
    retrieval: Arc<dyn RetrievalBackend>,
    provider: Arc<dyn ChatProvider>,
    top_k: usize,
    on_failure: RetrievalFailurePolicy,
}

impl RagPipeline {
    pub fn new(
        retrieval: Arc<dyn RetrievalBackend>,
        provider: Arc<dyn ChatProvider>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            retrieval,
            provider,
            top_k: config.top_k,
            on_failure: config.on_failure,
        }
    }

    /// Build the pipeline with the HTTP retrieval client and the configured provider.
    pub fn from_config(config: &AppConfig) -> Result<Self, RagError> {
        let retrieval = HttpRetrievalClient::new(&config.retrieval)?;
        let provider = create_provider(&config.llm)?;
        Ok(Self::new(Arc::new(retrieval), provider, &config.retrieval))
    }

    pub fn provider(&self) -> &Arc<dyn ChatProvider> {
        &self.provider
    }

    pub fn retrieval(&self) -> &Arc<dyn RetrievalBackend> {
        &self.retrieval
    }

    /// Fetch deduplicated context for `prompt`, applying the failure policy.
    pub async fn retrieve(&self, prompt: &str) -> Result<Vec<String>, RagError> {
        match self.retrieval.query(prompt, self.top_k).await {
            Ok(chunks) => Ok(dedup_preserving_order(chunks)),
            Err(e) => match self.on_failure {
                RetrievalFailurePolicy::Fail => Err(e.into()),
                RetrievalFailurePolicy::Degrade => {
                    warn!(error = %e, "Retrieval failed; answering without context");
                    Ok(Vec::new())
                }
            },
        }
    }

    /// Retrieve context and assemble the two-message prompt.
    pub async fn prepare(&self, prompt: &str) -> Result<AssembledPrompt, RagError> {
        let context = self.retrieve(prompt).await?;
        let assembled = assemble(prompt, &context);
        info!(context_chunks = assembled.context_chunks, "Prompt assembled");
        Ok(assembled)
    }

    /// Answer `prompt` with a single non-streaming upstream call.
    pub async fn generate(&self, prompt: &str) -> Result<String, RagError> {
        let assembled = self.prepare(prompt).await?;
        let answer = self.provider.complete(&assembled).await?;
        debug!(chars = answer.chars().count(), "Generation complete");
        Ok(answer)
    }

    /// Like [`generate`](Self::generate), rendering failures as `Error: <message>`.
    pub async fn generate_text(&self, prompt: &str) -> String {
        match self.generate(prompt).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "Generation failed");
                format!("Error: {}", e)
            }
        }
    }

    /// Start a streaming relay for `prompt` on its own task.
    ///
    /// The returned receiver is the only handle shared with the task; dropping
    /// it cancels the relay and releases the upstream connection.
    pub fn spawn_stream(
        self: &Arc<Self>,
        prompt: String,
        relay_config: &RelayConfig,
    ) -> mpsc::Receiver<RelayEvent> {
        let (tx, rx) = mpsc::channel(relay_config.channel_capacity.max(1));
        let request_id = Uuid::new_v4();
        let span = info_span!("relay", %request_id);
        let pipeline = Arc::clone(self);
        let relay = StreamingRelay::new(Arc::clone(&self.provider), relay_config);

        tokio::spawn(
            async move {
                debug!(prompt_chars = prompt.chars().count(), "Relay started");
                let outcome = relay.run(pipeline.prepare(&prompt), EventSink::new(tx)).await;
                debug!(?outcome, "Relay finished");
            }
            .instrument(span),
        );
        rx
    }
}
