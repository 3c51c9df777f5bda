//! Upstream stream framing for the two provider wire formats.
//!
//! Both formats are line oriented. Bytes from the HTTP body are buffered until
//! a full line is available, decoded, and handed to the format's line parser:
//!
//! ```text
//! SSE delta (OpenAI-compatible):
//!   data: {"choices":[{"delta":{"content":"Hel"}}]}
//!   data: {"choices":[{"delta":{"content":"lo"}}]}
//!   data: [DONE]
//!
//! NDJSON message (Ollama):
//!   {"message":{"role":"assistant","content":"Hel"},"done":false}
//!   {"message":{"role":"assistant","content":"lo"},"done":true}
//! ```
//!
//! [`adapt`] turns a body byte stream into a [`FragmentStream`] that yields
//! text fragments and exactly one terminal fragment. The byte stream is owned
//! by the returned stream and released as soon as it is dropped.

use crate::error::LlmError;
use crate::types::StreamFragment;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Lazy sequence of fragments from one upstream response.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<StreamFragment, LlmError>> + Send>>;

/// Raw upstream body chunks. Transport errors are pre-rendered to text.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// The streaming encodings spoken by supported providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `data:`-prefixed JSON deltas terminated by `data: [DONE]`.
    SseDelta,
    /// One JSON message object per line with an explicit `done` flag.
    NdjsonMessage,
}

/// What one upstream line contributes to the fragment sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Nothing: blank, comment, non-data, empty delta, or a skipped bad line.
    Skip,
    /// A piece of model text.
    Text(String),
    /// The terminal signal, optionally carrying final text from the same line.
    Terminal(Option<String>),
}

impl WireFormat {
    /// Parse one line (without its line terminator).
    pub fn parse_line(self, line: &str) -> Result<LineOutcome, LlmError> {
        match self {
            WireFormat::SseDelta => Ok(parse_sse_line(line)),
            WireFormat::NdjsonMessage => parse_ndjson_line(line),
        }
    }
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

/// SSE lines never fail: malformed payloads are logged and skipped.
fn parse_sse_line(line: &str) -> LineOutcome {
    let Some(data) = line.strip_prefix("data:") else {
        return LineOutcome::Skip;
    };
    let data = data.trim();
    if data.is_empty() {
        return LineOutcome::Skip;
    }
    if data == "[DONE]" {
        return LineOutcome::Terminal(None);
    }

    let json: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            let preview: String = data.chars().take(200).collect();
            warn!(error = %e, data_preview = %preview, "Skipping malformed SSE data line");
            return LineOutcome::Skip;
        }
    };

    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("");

    match non_empty(content) {
        Some(text) => LineOutcome::Text(text),
        None => LineOutcome::Skip,
    }
}

/// NDJSON lines are complete objects; one that does not parse is fatal.
fn parse_ndjson_line(line: &str) -> Result<LineOutcome, LlmError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(LineOutcome::Skip);
    }

    let json: Value = serde_json::from_str(line).map_err(|e| LlmError::Protocol {
        message: format!("invalid NDJSON line: {}", e),
    })?;

    if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
        return Err(LlmError::Protocol {
            message: format!("upstream reported error: {}", err),
        });
    }

    let text = json
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .and_then(non_empty);

    // `done` is checked after the content of the same line.
    let done = json.get("done").and_then(|d| d.as_bool()).unwrap_or(false);

    Ok(match (text, done) {
        (text, true) => LineOutcome::Terminal(text),
        (Some(text), false) => LineOutcome::Text(text),
        (None, false) => LineOutcome::Skip,
    })
}

/// Longest line accepted from an upstream body, in bytes.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Accumulates body bytes and splits them into lines.
///
/// Splitting happens on raw bytes, so a multi-byte character divided across
/// two network chunks is reassembled before decoding. Bytes already searched
/// for a newline are not searched again, and a partial line longer than the
/// limit is rejected instead of buffered.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Start of the first unconsumed line.
    start: usize,
    /// Everything before this offset is known to contain no `\n`.
    scanned: usize,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            scanned: 0,
            max_line,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete line, without its `\n` or `\r\n`.
    ///
    /// Fails once a line, complete or not, exceeds the length limit.
    pub fn next_line(&mut self) -> Result<Option<String>, LlmError> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.buf.len();
            let partial = self.scanned - self.start;
            return if partial > self.max_line {
                Err(self.too_long(partial))
            } else {
                Ok(None)
            };
        };

        let end = self.scanned + offset;
        let line = &self.buf[self.start..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() > self.max_line {
            return Err(self.too_long(line.len()));
        }
        let text = String::from_utf8_lossy(line).into_owned();
        self.start = end + 1;
        self.scanned = self.start;
        Ok(Some(text))
    }

    /// Take whatever is left after the body ended without a final newline.
    pub fn take_remainder(&mut self) -> Option<String> {
        let rest = &self.buf[self.start..];
        if rest.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(rest).trim_end_matches('\r').to_string();
        self.buf.clear();
        self.start = 0;
        self.scanned = 0;
        Some(text)
    }

    fn too_long(&self, len: usize) -> LlmError {
        LlmError::Protocol {
            message: format!(
                "upstream line of {} bytes exceeds the {} byte limit",
                len, self.max_line
            ),
        }
    }
}

/// Holds an upstream connection open for as long as its stream is alive.
///
/// Dropping the lease is the release point for the upstream body, on every
/// exit path. An optional probe flag is raised on release.
#[derive(Debug)]
pub struct ConnectionLease {
    provider: String,
    probe: Option<Arc<AtomicBool>>,
}

impl ConnectionLease {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            probe: None,
        }
    }

    /// Raise `flag` when the lease is released.
    pub fn with_probe(mut self, flag: Arc<AtomicBool>) -> Self {
        self.probe = Some(flag);
        self
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(flag) = &self.probe {
            flag.store(true, Ordering::SeqCst);
        }
        debug!(provider = %self.provider, "Upstream connection released");
    }
}

struct AdapterState {
    format: WireFormat,
    bytes: ByteStream,
    lines: LineBuffer,
    pending: VecDeque<StreamFragment>,
    eof: bool,
    finished: bool,
    _lease: ConnectionLease,
}

impl AdapterState {
    fn enqueue(&mut self, outcome: LineOutcome) {
        match outcome {
            LineOutcome::Skip => {}
            LineOutcome::Text(text) => self.pending.push_back(StreamFragment::text(text)),
            LineOutcome::Terminal(text) => {
                if let Some(text) = text {
                    self.pending.push_back(StreamFragment::text(text));
                }
                self.pending.push_back(StreamFragment::terminal());
            }
        }
    }

    fn terminal_queued(&self) -> bool {
        self.pending.back().is_some_and(|f| f.done)
    }

    async fn step(mut self) -> Option<(Result<StreamFragment, LlmError>, Self)> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                if fragment.done {
                    self.finished = true;
                }
                return Some((Ok(fragment), self));
            }
            if self.finished {
                return None;
            }

            let next_line = if self.terminal_queued() {
                None
            } else if self.eof {
                self.lines.take_remainder()
            } else {
                match self.lines.next_line() {
                    Ok(line) => line,
                    Err(e) => {
                        self.finished = true;
                        return Some((Err(e), self));
                    }
                }
            };

            if let Some(line) = next_line {
                match self.format.parse_line(&line) {
                    Ok(outcome) => self.enqueue(outcome),
                    Err(e) => {
                        self.finished = true;
                        return Some((Err(e), self));
                    }
                }
                continue;
            }

            if self.eof {
                debug!(format = ?self.format, "Upstream closed without a terminal signal");
                self.pending.push_back(StreamFragment::terminal());
                continue;
            }

            match self.bytes.next().await {
                Some(Ok(chunk)) => self.lines.push(&chunk),
                Some(Err(message)) => {
                    self.finished = true;
                    return Some((
                        Err(LlmError::Streaming {
                            message: format!("Failed to read upstream stream: {}", message),
                        }),
                        self,
                    ));
                }
                None => self.eof = true,
            }
        }
    }
}

/// Adapt a raw upstream body into a [`FragmentStream`].
///
/// The stream yields non-empty text fragments in arrival order followed by a
/// single terminal fragment, or stops after the first error. Body end without
/// an in-band terminal signal counts as the terminal signal.
pub fn adapt(format: WireFormat, bytes: ByteStream, lease: ConnectionLease) -> FragmentStream {
    let state = AdapterState {
        format,
        bytes,
        lines: LineBuffer::new(),
        pending: VecDeque::new(),
        eof: false,
        finished: false,
        _lease: lease,
    };
    Box::pin(futures::stream::unfold(state, AdapterState::step))
}

/// Box a `reqwest` body stream as a [`ByteStream`].
pub fn body_stream(response: reqwest::Response) -> ByteStream {
    Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| e.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bytes_of(chunks: &[&str]) -> ByteStream {
        let owned: Vec<Result<Bytes, String>> = chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c.as_bytes())))
            .collect();
        Box::pin(futures::stream::iter(owned))
    }

    async fn collect(format: WireFormat, chunks: &[&str]) -> Vec<Result<StreamFragment, String>> {
        adapt(format, bytes_of(chunks), ConnectionLease::new("test"))
            .map(|r| r.map_err(|e| e.to_string()))
            .collect()
            .await
    }

    fn text(t: &str) -> Result<StreamFragment, String> {
        Ok(StreamFragment::text(t))
    }

    fn done() -> Result<StreamFragment, String> {
        Ok(StreamFragment::terminal())
    }

    // --- line parsing ---

    #[test]
    fn test_sse_line_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(
            WireFormat::SseDelta.parse_line(line).unwrap(),
            LineOutcome::Text("Hi".into())
        );
    }

    #[test]
    fn test_sse_line_without_space_after_prefix() {
        let line = r#"data:{"choices":[{"delta":{"content":"x"}}]}"#;
        assert_eq!(
            WireFormat::SseDelta.parse_line(line).unwrap(),
            LineOutcome::Text("x".into())
        );
    }

    #[test]
    fn test_sse_line_done_sentinel() {
        assert_eq!(
            WireFormat::SseDelta.parse_line("data: [DONE]").unwrap(),
            LineOutcome::Terminal(None)
        );
    }

    #[test]
    fn test_sse_line_skips() {
        for line in [
            "",
            ": OPENROUTER PROCESSING",
            "event: message",
            "data: not-json",
            r#"data: {"choices":[]}"#,
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":""}}]}"#,
        ] {
            assert_eq!(
                WireFormat::SseDelta.parse_line(line).unwrap(),
                LineOutcome::Skip,
                "line: {line:?}"
            );
        }
    }

    #[test]
    fn test_ndjson_line_content_and_done() {
        let fmt = WireFormat::NdjsonMessage;
        assert_eq!(
            fmt.parse_line(r#"{"message":{"content":"Hi"},"done":false}"#)
                .unwrap(),
            LineOutcome::Text("Hi".into())
        );
        assert_eq!(
            fmt.parse_line(r#"{"message":{"content":""},"done":true}"#)
                .unwrap(),
            LineOutcome::Terminal(None)
        );
        assert_eq!(
            fmt.parse_line(r#"{"message":{"content":"bye"},"done":true}"#)
                .unwrap(),
            LineOutcome::Terminal(Some("bye".into()))
        );
        assert_eq!(fmt.parse_line("   ").unwrap(), LineOutcome::Skip);
    }

    #[test]
    fn test_ndjson_invalid_line_is_protocol_error() {
        let err = WireFormat::NdjsonMessage.parse_line("{oops").unwrap_err();
        assert!(matches!(err, LlmError::Protocol { .. }));
    }

    #[test]
    fn test_ndjson_error_object_is_protocol_error() {
        let err = WireFormat::NdjsonMessage
            .parse_line(r#"{"error":"model not found"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("model not found"));
    }

    // --- line buffering ---

    #[test]
    fn test_line_buffer_splits_and_strips_cr() {
        let mut buf = LineBuffer::new();
        buf.push(b"one\r\ntw");
        assert_eq!(buf.next_line().unwrap().as_deref(), Some("one"));
        assert_eq!(buf.next_line().unwrap(), None);
        buf.push(b"o\n");
        assert_eq!(buf.next_line().unwrap().as_deref(), Some("two"));
        assert_eq!(buf.take_remainder(), None);
    }

    #[test]
    fn test_line_buffer_reassembles_split_utf8() {
        let bytes = "héllo\n".as_bytes();
        let mut buf = LineBuffer::new();
        // Split inside the two-byte 'é'.
        buf.push(&bytes[..2]);
        assert_eq!(buf.next_line().unwrap(), None);
        buf.push(&bytes[2..]);
        assert_eq!(buf.next_line().unwrap().as_deref(), Some("héllo"));
    }

    #[test]
    fn test_line_buffer_many_lines_in_one_chunk_then_partial() {
        let mut buf = LineBuffer::new();
        buf.push(b"a\nbb\nccc\ndd");
        assert_eq!(buf.next_line().unwrap().as_deref(), Some("a"));
        assert_eq!(buf.next_line().unwrap().as_deref(), Some("bb"));
        assert_eq!(buf.next_line().unwrap().as_deref(), Some("ccc"));
        assert_eq!(buf.next_line().unwrap(), None);
        buf.push(b"d\ne");
        assert_eq!(buf.next_line().unwrap().as_deref(), Some("ddd"));
        assert_eq!(buf.next_line().unwrap(), None);
        assert_eq!(buf.take_remainder().as_deref(), Some("e"));
        assert_eq!(buf.take_remainder(), None);
    }

    #[test]
    fn test_line_buffer_rejects_unterminated_oversized_line() {
        let mut buf = LineBuffer::with_max_line(8);
        buf.push(b"12345");
        assert_eq!(buf.next_line().unwrap(), None);
        buf.push(b"6789");
        let err = buf.next_line().unwrap_err();
        assert!(matches!(err, LlmError::Protocol { .. }));
        assert!(err.to_string().contains("exceeds the 8 byte limit"));
    }

    #[test]
    fn test_line_buffer_limit_applies_to_complete_lines() {
        let mut buf = LineBuffer::with_max_line(4);
        buf.push(b"abcd\r\nabcdef\n");
        assert_eq!(buf.next_line().unwrap().as_deref(), Some("abcd"));
        assert!(buf.next_line().is_err());
    }

    // --- adapted streams ---

    #[tokio::test]
    async fn test_sse_stream_yields_fragment_then_terminal() {
        let out = collect(
            WireFormat::SseDelta,
            &[
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n",
                "data: [DONE]\n",
            ],
        )
        .await;
        assert_eq!(out, vec![text("Hi"), done()]);
    }

    #[tokio::test]
    async fn test_sse_stream_skips_bad_lines_and_ignores_after_done() {
        let out = collect(
            WireFormat::SseDelta,
            &[
                ": keep-alive\n\n",
                "data: not-json\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\n\n",
                "data: {\"choices\":[{\"del",
                "ta\":{\"content\":\"B\"}}]}\n",
                "data: [DONE]\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
            ],
        )
        .await;
        assert_eq!(out, vec![text("A"), text("B"), done()]);
    }

    #[tokio::test]
    async fn test_ndjson_stream_final_empty_line() {
        let out = collect(
            WireFormat::NdjsonMessage,
            &[
                "{\"message\":{\"content\":\"Hi\"},\"done\":false}\n",
                "{\"message\":{\"content\":\"\"},\"done\":true}\n",
            ],
        )
        .await;
        assert_eq!(out, vec![text("Hi"), done()]);
    }

    #[tokio::test]
    async fn test_ndjson_stream_text_on_done_line() {
        let out = collect(
            WireFormat::NdjsonMessage,
            &["{\"message\":{\"content\":\"last\"},\"done\":true}"],
        )
        .await;
        assert_eq!(out, vec![text("last"), done()]);
    }

    #[tokio::test]
    async fn test_eof_without_terminal_signal_terminates() {
        let out = collect(
            WireFormat::SseDelta,
            &["data: {\"choices\":[{\"delta\":{\"content\":\"cut\"}}]}\n"],
        )
        .await;
        assert_eq!(out, vec![text("cut"), done()]);
    }

    #[tokio::test]
    async fn test_ndjson_bad_line_stops_stream_with_error() {
        let out = collect(
            WireFormat::NdjsonMessage,
            &[
                "{\"message\":{\"content\":\"ok\"},\"done\":false}\n",
                "garbage\n",
                "{\"message\":{\"content\":\"never\"},\"done\":false}\n",
            ],
        )
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], text("ok"));
        assert!(out[1].as_ref().unwrap_err().contains("invalid NDJSON line"));
    }

    #[tokio::test]
    async fn test_endless_line_stops_stream_with_error() {
        let released = Arc::new(AtomicBool::new(false));
        let filler = Bytes::from(vec![b'a'; 64 * 1024]);
        let body: ByteStream = Box::pin(futures::stream::repeat(Ok(filler)));
        let out: Vec<_> = adapt(
            WireFormat::SseDelta,
            body,
            ConnectionLease::new("test").with_probe(released.clone()),
        )
        .collect()
        .await;
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Err(LlmError::Protocol { .. })));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_transport_error_stops_stream() {
        let chunks: Vec<Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n")),
            Err("connection reset".to_string()),
        ];
        let out: Vec<_> = adapt(
            WireFormat::SseDelta,
            Box::pin(futures::stream::iter(chunks)),
            ConnectionLease::new("test"),
        )
        .collect()
        .await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(LlmError::Streaming { .. })));
    }

    #[tokio::test]
    async fn test_lease_released_when_stream_dropped_early() {
        let released = Arc::new(AtomicBool::new(false));
        let body: ByteStream = Box::pin(
            futures::stream::iter(vec![Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n",
            ))])
            .chain(futures::stream::pending()),
        );
        let mut stream = adapt(
            WireFormat::SseDelta,
            body,
            ConnectionLease::new("test").with_probe(released.clone()),
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            StreamFragment::text("x")
        );
        assert!(!released.load(Ordering::SeqCst));
        drop(stream);
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lease_released_after_terminal() {
        let released = Arc::new(AtomicBool::new(false));
        let stream = adapt(
            WireFormat::SseDelta,
            bytes_of(&["data: [DONE]\n"]),
            ConnectionLease::new("test").with_probe(released.clone()),
        );
        let out: Vec<_> = stream.collect().await;
        assert_eq!(out.len(), 1);
        assert!(released.load(Ordering::SeqCst));
    }
}
