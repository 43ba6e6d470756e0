//! Decoding of streamed response bodies.
//!
//! Both streaming protocols the backends speak are line oriented, and
//! neither guarantees that a transport chunk ends on a line boundary:
//!
//! - TGI endpoints send one JSON object per line, prefixed with `data:`,
//!   carrying the next token in `token.text`.
//! - OpenAI-compatible servers send server-sent events whose `data:` lines
//!   carry `choices[0].delta.content`, terminated by `data: [DONE]`.
//!
//! [`LineBuffer`] reassembles lines across chunks; the two decoders turn the
//! lines into text deltas.

use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Deserialize;
use std::collections::VecDeque;

use crate::clients::{ByteStream, ClientError, DeltaStream};

/// Token TGI emits at the end of a generation.
pub const STOP_TOKEN: &str = "</s>";

/// Accumulates bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, without the
    /// line terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(decode_line(&line[..end]));
        }
        lines
    }

    /// Flush a trailing line that had no terminator.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(decode_line(&line))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Split a byte stream into lines.
///
/// A transport error is yielded once and ends the stream.
pub fn decode_lines(bytes: ByteStream) -> BoxStream<'static, Result<String, ClientError>> {
    let state = (bytes, LineBuffer::new(), VecDeque::new(), false);

    stream::unfold(state, |(mut bytes, mut buffer, mut ready, mut finished)| async move {
        loop {
            if let Some(line) = ready.pop_front() {
                return Some((Ok(line), (bytes, buffer, ready, finished)));
            }
            if finished {
                return None;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => ready.extend(buffer.push(&chunk)),
                Some(Err(e)) => {
                    finished = true;
                    return Some((Err(e), (bytes, buffer, ready, finished)));
                }
                None => {
                    finished = true;
                    ready.extend(buffer.finish());
                }
            }
        }
    })
    .boxed()
}

// ============================================================================
// TGI token stream
// ============================================================================

#[derive(Debug, Deserialize)]
struct TgiEvent {
    token: TgiToken,
}

#[derive(Debug, Deserialize)]
struct TgiToken {
    text: String,
}

/// Extract the token text from one TGI stream line.
///
/// Lines without a JSON object and the stop token yield `None`.
pub fn tgi_token(line: &str) -> Result<Option<String>, ClientError> {
    let Some(start) = line.find('{') else {
        return Ok(None);
    };

    let event: TgiEvent = serde_json::from_str(&line[start..])
        .map_err(|e| ClientError::Decode(format!("TGI stream line: {e}")))?;

    if event.token.text == STOP_TOKEN {
        Ok(None)
    } else {
        Ok(Some(event.token.text))
    }
}

/// Decode a TGI response body into token deltas.
pub fn tgi_deltas(bytes: ByteStream) -> DeltaStream {
    decode_lines(bytes)
        .try_filter_map(|line| future::ready(tgi_token(&line)))
        .boxed()
}

// ============================================================================
// OpenAI-compatible server-sent events
// ============================================================================

/// One interpreted SSE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// A `data:` payload
    Data(String),

    /// The `[DONE]` terminator
    Done,

    /// Blank lines, comments and other fields
    Skip,
}

impl SseLine {
    /// Classify a raw line.
    pub fn parse(line: &str) -> Self {
        match line.strip_prefix("data:") {
            Some(data) if data.trim() == "[DONE]" => SseLine::Done,
            Some(data) => SseLine::Data(data.trim().to_string()),
            None => SseLine::Skip,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the content delta from one chat completion chunk.
///
/// Role-only and empty deltas yield `None`.
pub fn chat_delta(data: &str) -> Result<Option<String>, ClientError> {
    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| ClientError::Decode(format!("chat stream chunk: {e}")))?;

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

/// Decode an SSE chat completion body into content deltas.
pub fn chat_deltas(bytes: ByteStream) -> DeltaStream {
    decode_lines(bytes)
        .map_ok(|line| SseLine::parse(&line))
        .take_while(|line| future::ready(!matches!(line, Ok(SseLine::Done))))
        .try_filter_map(|line| {
            future::ready(match line {
                SseLine::Data(data) => chat_delta(&data),
                _ => Ok(None),
            })
        })
        .boxed()
}
