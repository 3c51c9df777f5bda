//! Scripted chat provider for tests and offline runs.
//!
//! Replays raw upstream wire lines through the same adapter the real
//! providers use, so framing, parsing, and connection release behave exactly
//! as they would against a live endpoint.

use super::wire::{self, ByteStream, ConnectionLease, FragmentStream, WireFormat};
use super::{ChatProvider, EMPTY_RESPONSE_TEXT};
use crate::error::LlmError;
use crate::prompt::AssembledPrompt;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A [`ChatProvider`] that answers from a fixed script.
pub struct ScriptedProvider {
    format: WireFormat,
    lines: Vec<String>,
    answer: String,
    line_delay: Option<Duration>,
    hold_open: bool,
    failure: Option<(u16, String)>,
    released: Arc<AtomicBool>,
    prompts: Mutex<Vec<AssembledPrompt>>,
}

impl ScriptedProvider {
    /// Replay raw wire lines in the given format. Lines must not include `\n`.
    pub fn from_lines<I, S>(format: WireFormat, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            format,
            lines: lines.into_iter().map(Into::into).collect(),
            answer: EMPTY_RESPONSE_TEXT.to_string(),
            line_delay: None,
            hold_open: false,
            failure: None,
            released: Arc::new(AtomicBool::new(false)),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// SSE-delta script streaming `pieces` then `data: [DONE]`.
    ///
    /// `complete` answers with the concatenated pieces.
    pub fn sse<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pieces: Vec<String> = pieces.into_iter().map(Into::into).collect();
        let mut lines: Vec<String> = pieces
            .iter()
            .map(|p| format!("data: {}", json!({"choices": [{"delta": {"content": p}}]})))
            .collect();
        lines.push("data: [DONE]".to_string());
        Self::from_lines(WireFormat::SseDelta, lines).with_answer(pieces.concat())
    }

    /// NDJSON script streaming `pieces` then a `done: true` line.
    pub fn ndjson<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pieces: Vec<String> = pieces.into_iter().map(Into::into).collect();
        let mut lines: Vec<String> = pieces
            .iter()
            .map(|p| json!({"message": {"role": "assistant", "content": p}, "done": false}).to_string())
            .collect();
        lines.push(json!({"message": {"role": "assistant", "content": ""}, "done": true}).to_string());
        Self::from_lines(WireFormat::NdjsonMessage, lines).with_answer(pieces.concat())
    }

    /// Text returned by `complete`. Empty text yields the no-response marker.
    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        let answer = answer.into();
        self.answer = if answer.is_empty() {
            EMPTY_RESPONSE_TEXT.to_string()
        } else {
            answer
        };
        self
    }

    /// Sleep before delivering each line.
    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = Some(delay);
        self
    }

    /// Keep the body open after the last scripted line instead of closing it.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Fail every request as if upstream returned `status` with `body`.
    pub fn failing(mut self, status: u16, body: impl Into<String>) -> Self {
        self.failure = Some((status, body.into()));
        self
    }

    /// Flag raised when the most recent stream's connection is released.
    pub fn released(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }

    /// Prompts received, in call order.
    pub fn prompts(&self) -> Vec<AssembledPrompt> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn record(&self, prompt: &AssembledPrompt) -> Result<(), LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        match &self.failure {
            Some((status, body)) => Err(LlmError::UpstreamStatus {
                status: *status,
                body: body.clone(),
            }),
            None => Ok(()),
        }
    }

    fn body(&self) -> ByteStream {
        let chunks: Vec<Result<Bytes, String>> = self
            .lines
            .iter()
            .map(|l| Ok(Bytes::from(format!("{}\n", l))))
            .collect();
        let delay = self.line_delay;
        let body = futures::stream::iter(chunks).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            chunk
        });
        if self.hold_open {
            Box::pin(body.chain(futures::stream::pending()))
        } else {
            Box::pin(body)
        }
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn complete(&self, prompt: &AssembledPrompt) -> Result<String, LlmError> {
        self.record(prompt)?;
        Ok(self.answer.clone())
    }

    async fn stream(&self, prompt: &AssembledPrompt) -> Result<FragmentStream, LlmError> {
        self.record(prompt)?;
        self.released.store(false, Ordering::SeqCst);
        Ok(wire::adapt(
            self.format,
            self.body(),
            ConnectionLease::new(self.name()).with_probe(self.released.clone()),
        ))
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    fn wire_format(&self) -> WireFormat {
        self.format
    }
}
