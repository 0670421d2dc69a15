//! Re-framing of backend output into the canonical client frame protocol.
//!
//! The backend either hands back a complete text, which is split into
//! small token frames, or a byte stream of blank-line delimited events
//! whose boundaries have nothing to do with transport chunk boundaries.
//! Either way the client sees `token*`, optionally one `error`, then one
//! `done` and one sentinel, and nothing after that.
//!
//! Fragment policy: a delimiter-terminated segment whose payload is not
//! valid JSON is held back as a carry-over fragment. The next complete
//! segment carrying a payload is first tried joined onto it; if the join
//! parses, the fragment was recovered. If not, the fragment is dropped with
//! a warning and the new segment is handled on its own. Comment-only and
//! keep-alive events leave a held fragment alone. At most one fragment is
//! ever held.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::generators::ByteStream;
use crate::types::{SourceRef, StreamFrame, SENTINEL};

/// Backend event delimiter after CRLF normalisation
const EVENT_DELIMITER: &str = "\n\n";

/// Undelimited text allowed to accumulate before the stream is failed
pub const MAX_PENDING_BYTES: usize = 1 << 20;

/// Message carried by the client-facing error frame
pub const GENERATION_FAILED_MESSAGE: &str = "generation failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReframerState {
    Streaming,
    Finalizing,
    Closed,
}

/// Incremental UTF-8 decoder that never splits a character
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode as much as possible; an incomplete trailing sequence is
    /// kept for the next call. Invalid sequences become U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut pos = 0;

        while pos < self.pending.len() {
            match std::str::from_utf8(&self.pending[pos..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    pos = self.pending.len();
                }
                Err(e) => {
                    let valid_end = pos + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[pos..valid_end]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            pos = valid_end + bad;
                        }
                        None => {
                            pos = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..pos);
        out
    }

    /// Flush whatever is left, lossily
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Split text into units of `unit_chars` characters
pub fn split_units(text: &str, unit_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(unit_chars.max(1))
        .map(|unit| unit.iter().collect())
        .collect()
}

/// Payload shapes recognised inside a backend event
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamPayload {
    OpenAi { choices: Vec<OpenAiChoice> },
    Anthropic { delta: AnthropicDelta },
    Token { token: String },
    Text { text: String },
    Response { response: String },
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

fn openai_delta(choices: Vec<OpenAiChoice>) -> Option<String> {
    choices.into_iter().next().and_then(|c| c.delta.content)
}

fn anthropic_delta(delta: AnthropicDelta) -> Option<String> {
    delta.text
}

fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("backend reported an error")
        .to_string()
}

#[derive(Debug, PartialEq)]
enum EventOutcome {
    Delta(String),
    Failed(String),
    /// Backend's own end-of-stream marker
    Terminator,
    Ignored,
    /// Payload present but not (yet) valid JSON
    Incomplete,
}

/// Extract the payload of one event: `data:` lines are stripped of their
/// prefix, other SSE fields and comments are skipped, anything else is
/// treated as payload continuation.
fn event_payload(segment: &str) -> String {
    let mut parts = Vec::new();
    for line in segment.split('\n') {
        if let Some(rest) = line.strip_prefix("data:") {
            parts.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if line.starts_with(':')
            || line.starts_with("event:")
            || line.starts_with("id:")
            || line.starts_with("retry:")
        {
            continue;
        } else {
            parts.push(line);
        }
    }
    parts.join("\n")
}

fn parse_event(segment: &str) -> EventOutcome {
    let payload = event_payload(segment);
    let payload = payload.trim();
    if payload.is_empty() {
        return EventOutcome::Ignored;
    }
    if payload == SENTINEL {
        return EventOutcome::Terminator;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => return EventOutcome::Incomplete,
    };

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return EventOutcome::Failed(error_message(error));
    }

    match serde_json::from_value::<StreamPayload>(value) {
        Ok(StreamPayload::OpenAi { choices }) => {
            openai_delta(choices).map_or(EventOutcome::Ignored, EventOutcome::Delta)
        }
        Ok(StreamPayload::Anthropic { delta }) => {
            anthropic_delta(delta).map_or(EventOutcome::Ignored, EventOutcome::Delta)
        }
        Ok(StreamPayload::Token { token }) => EventOutcome::Delta(token),
        Ok(StreamPayload::Text { text }) => EventOutcome::Delta(text),
        Ok(StreamPayload::Response { response }) => EventOutcome::Delta(response),
        Err(_) => {
            debug!("Ignoring backend event with unrecognised shape");
            EventOutcome::Ignored
        }
    }
}

/// Per-request re-framing state; owned by exactly one relay task
pub struct StreamReframer {
    state: ReframerState,
    decoder: Utf8Decoder,
    buffer: String,
    carry: Option<String>,
    sources: Vec<SourceRef>,
    unit_chars: usize,
}

impl StreamReframer {
    pub fn new(sources: Vec<SourceRef>, unit_chars: usize) -> Self {
        Self {
            state: ReframerState::Streaming,
            decoder: Utf8Decoder::default(),
            buffer: String::new(),
            carry: None,
            sources,
            unit_chars: unit_chars.max(1),
        }
    }

    pub fn state(&self) -> ReframerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ReframerState::Closed
    }

    /// Complete-text input: one token frame per unit, in order
    pub fn push_text(&mut self, text: &str) -> Vec<StreamFrame> {
        if self.state != ReframerState::Streaming {
            debug!("Discarding {} chars received after close", text.len());
            return Vec::new();
        }
        self.tokens(text)
    }

    /// Raw backend bytes, chunked arbitrarily
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamFrame> {
        if self.state != ReframerState::Streaming {
            debug!("Discarding {} bytes received after close", bytes.len());
            return Vec::new();
        }

        let text = self.decoder.decode(bytes);
        self.buffer.push_str(&text);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let mut frames = Vec::new();
        while let Some(idx) = self.buffer.find(EVENT_DELIMITER) {
            let segment = self.buffer[..idx].to_string();
            self.buffer.drain(..idx + EVENT_DELIMITER.len());
            self.handle_segment(segment, &mut frames);
            if self.state != ReframerState::Streaming {
                return frames;
            }
        }

        if self.buffer.len() > MAX_PENDING_BYTES {
            warn!(
                "Backend sent {} bytes without an event delimiter; failing stream",
                self.buffer.len()
            );
            self.buffer.clear();
            frames.extend(self.fail());
        }
        frames
    }

    /// Source exhausted normally: flush what is left, then `done` + sentinel
    pub fn finish(&mut self) -> Vec<StreamFrame> {
        if self.state != ReframerState::Streaming {
            return Vec::new();
        }

        self.state = ReframerState::Finalizing;
        let mut frames = Vec::new();
        let rest = self.decoder.finish();
        self.buffer.push_str(&rest);
        let trailing = std::mem::take(&mut self.buffer);
        if !trailing.trim().is_empty() {
            self.handle_segment(trailing, &mut frames);
        }
        if self.is_closed() {
            return frames;
        }
        if let Some(fragment) = self.carry.take() {
            warn!("Dropping unparseable trailing fragment ({} bytes)", fragment.len());
        }

        frames.extend(self.close(None));
        frames
    }

    /// Source failed: one `error` frame, then `done` + sentinel.
    ///
    /// Also valid while finalizing, when the trailing event carries an error.
    pub fn fail(&mut self) -> Vec<StreamFrame> {
        if self.is_closed() {
            return Vec::new();
        }
        self.carry = None;
        self.buffer.clear();
        self.close(Some(GENERATION_FAILED_MESSAGE.to_string()))
    }

    fn close(&mut self, error: Option<String>) -> Vec<StreamFrame> {
        let mut frames = Vec::with_capacity(3);
        if let Some(message) = error {
            frames.push(StreamFrame::Error(message));
        }
        frames.push(StreamFrame::Done {
            sources: std::mem::take(&mut self.sources),
        });
        frames.push(StreamFrame::Sentinel);
        self.state = ReframerState::Closed;
        frames
    }

    fn handle_segment(&mut self, segment: String, frames: &mut Vec<StreamFrame>) {
        // Comments and keep-alives carry no payload; a held fragment waits past them
        if self.carry.is_some() && event_payload(&segment).trim().is_empty() {
            debug!("Skipping payload-less event while holding fragment");
            return;
        }

        if let Some(fragment) = self.carry.take() {
            let joined = format!("{}{}{}", fragment, EVENT_DELIMITER, segment);
            match parse_event(&joined) {
                EventOutcome::Incomplete => {
                    warn!("Dropping unrecoverable fragment ({} bytes)", fragment.len());
                }
                outcome => {
                    debug!("Reassembled fragment across delimiter");
                    self.apply(outcome, frames);
                    return;
                }
            }
        }

        match parse_event(&segment) {
            EventOutcome::Incomplete => {
                debug!("Holding incomplete fragment ({} bytes)", segment.len());
                self.carry = Some(segment);
            }
            outcome => self.apply(outcome, frames),
        }
    }

    fn apply(&mut self, outcome: EventOutcome, frames: &mut Vec<StreamFrame>) {
        match outcome {
            EventOutcome::Delta(text) => frames.extend(self.tokens(&text)),
            EventOutcome::Failed(message) => {
                warn!("Backend reported error mid-stream: {}", message);
                frames.extend(self.fail());
            }
            EventOutcome::Terminator => debug!("Backend end-of-stream marker consumed"),
            EventOutcome::Ignored | EventOutcome::Incomplete => {}
        }
    }

    fn tokens(&self, text: &str) -> Vec<StreamFrame> {
        split_units(text, self.unit_chars)
            .into_iter()
            .map(StreamFrame::Token)
            .collect()
    }
}

/// How a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    ClientGone,
}

async fn send_all(tx: &mpsc::Sender<StreamFrame>, frames: Vec<StreamFrame>) -> bool {
    for frame in frames {
        if tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

/// Deliver a complete text as a synthetic stream.
///
/// `delay` only paces delivery; frame content does not depend on it.
pub async fn relay_text(
    text: &str,
    mut reframer: StreamReframer,
    tx: mpsc::Sender<StreamFrame>,
    delay: Duration,
) -> RelayOutcome {
    for frame in reframer.push_text(text) {
        if tx.send(frame).await.is_err() {
            debug!("Client disconnected during synthetic stream");
            return RelayOutcome::ClientGone;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    if !send_all(&tx, reframer.finish()).await {
        return RelayOutcome::ClientGone;
    }
    RelayOutcome::Completed
}

/// Pump a backend byte stream through the reframer into `tx`.
///
/// Stops reading as soon as the client goes away or the reframer closes;
/// dropping `stream` releases the backend connection.
pub async fn relay_stream(
    mut stream: ByteStream,
    mut reframer: StreamReframer,
    tx: mpsc::Sender<StreamFrame>,
    idle_timeout: Duration,
) -> RelayOutcome {
    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                debug!("Client disconnected while awaiting backend; releasing stream");
                return RelayOutcome::ClientGone;
            }
            next = tokio::time::timeout(idle_timeout, stream.next()) => next,
        };
        let frames = match next {
            Ok(Some(Ok(bytes))) => reframer.push(&bytes),
            Ok(Some(Err(e))) => {
                warn!("Backend stream failed: {:#}", e);
                reframer.fail()
            }
            Ok(None) => reframer.finish(),
            Err(_) => {
                warn!(
                    "Backend stream idle for {}ms; failing",
                    idle_timeout.as_millis()
                );
                reframer.fail()
            }
        };

        if !send_all(&tx, frames).await {
            debug!("Client disconnected; releasing backend stream");
            return RelayOutcome::ClientGone;
        }
        if reframer.is_closed() {
            return RelayOutcome::Completed;
        }
    }
}
