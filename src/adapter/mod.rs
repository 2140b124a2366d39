//! Model adapters: the uniform streaming contract over vendor APIs.
//!
//! A backend implements [`ModelBackend`], translating one vendor's wire
//! protocol into [`BackendDelta`] values for a single request/response
//! round. [`stream_generation`] drives the agent loop on top of any
//! backend (tool execution, guardrails, deadline, cancellation and retry
//! are identical across vendors) and emits the [`StreamEvent`] sequence
//! that crosses the adapter boundary.
//!
//! # Per-model event ordering
//!
//! `start` first, at most one `ttft` before the first non-empty `token`,
//! `tool_start`/`tool_end` pairs in invocation order (never overlapping),
//! then `done` or `error` last. The sequence is finite and
//! non-restartable.

pub mod anthropic;
pub mod gemini;
pub mod guardrails;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Citation, StreamEvent};
use crate::history::{ContentBlock, ToolResultBlock, Turn};
use crate::tools::ToolRegistry;

use guardrails::{coaching_turn, enforce_document_budget, ToolLoopGuard};

/// Backoff before the single permitted retry of a transient failure.
/// Bounded at two seconds.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// One unit of vendor output, already translated from the wire format.
#[derive(Debug, Clone)]
pub enum BackendDelta {
    /// Incremental assistant text.
    Text(String),
    /// A fully assembled tool invocation request.
    ToolUse {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// Token accounting for this round, as reported by the vendor.
    Usage { tokens_in: u64, tokens_out: u64 },
}

/// Failures raised by a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("rate limited")]
    RateLimited,
    #[error("network error: {0}")]
    Network(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl BackendError {
    /// Whether a retry could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Stream of translated vendor output for one round.
pub type BackendStream = BoxStream<'static, Result<BackendDelta, BackendError>>;

/// The wire contract each vendor backend satisfies.
///
/// `stream_turn` submits the history once and streams the response; it
/// must not mutate the history. The agent loop owns everything above that:
/// tool execution, history extension, resubmission.
#[async_trait::async_trait]
pub trait ModelBackend: Send + Sync {
    fn model_id(&self) -> &str;

    async fn stream_turn(
        &self,
        history: &[Turn],
        allow_tools: bool,
    ) -> Result<BackendStream, BackendError>;
}

/// Shared accumulator for the assistant turn being generated.
///
/// The adapter keeps it current as blocks commit; after the stream
/// terminates (including error and cancellation) the orchestrator reads it
/// to append the partial assistant turn to the canonical history.
#[derive(Clone, Default)]
pub struct TurnAccumulator {
    blocks: Arc<Mutex<Vec<ContentBlock>>>,
}

impl TurnAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, blocks: Vec<ContentBlock>) {
        *self.blocks.lock().expect("accumulator poisoned") = blocks;
    }

    /// Take the accumulated blocks, leaving the accumulator empty.
    #[must_use]
    pub fn take(&self) -> Vec<ContentBlock> {
        std::mem::take(&mut *self.blocks.lock().expect("accumulator poisoned"))
    }
}

/// Outcome of draining one vendor round.
enum RoundEnd {
    /// Vendor finished; tool requests (possibly none) collected.
    Finished,
    /// Vendor stream failed.
    Failed(BackendError),
    /// The generation was cancelled; emit a terminal error and stop.
    Cancelled,
    /// The deadline fired mid-round.
    DeadlineExceeded,
}

/// Drive one full generation for one model: the vendor round loop with
/// tool execution and guardrails, emitting wire events.
///
/// The returned stream is finite and its last event is always `done` or
/// `error`; cancellation and deadline expiry both surface as a terminal
/// `error` after the partial turn has been handed to the accumulator.
pub fn stream_generation(
    backend: Arc<dyn ModelBackend>,
    history: Vec<Turn>,
    registry: ToolRegistry,
    deadline: Duration,
    cancel: CancellationToken,
    transcript: TurnAccumulator,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    stream! {
        let model_id = backend.model_id().to_string();
        let started = Instant::now();
        let deadline_at = started + deadline;

        yield StreamEvent::start(&model_id);

        let base = history;
        let mut assistant_blocks: Vec<ContentBlock> = Vec::new();
        let mut coaching: Option<Turn> = None;
        let mut allow_tools = !registry.is_empty();

        let mut guard = ToolLoopGuard::new();
        let mut ttft_emitted = false;
        let mut retried = false;
        let mut tokens_in = 0u64;
        let mut tokens_out = 0u64;
        let mut citations: Vec<Citation> = Vec::new();

        'rounds: loop {
            let mut submission: Vec<Turn> = base.clone();
            if !assistant_blocks.is_empty() {
                submission.push(Turn::assistant(assistant_blocks.clone()));
            }
            if let Some(turn) = &coaching {
                submission.push(turn.clone());
            }
            let submission = enforce_document_budget(&submission);

            let vendor = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    transcript.set(assistant_blocks);
                    yield cancelled_error(&model_id);
                    return;
                }
                () = tokio::time::sleep_until(deadline_at) => {
                    transcript.set(assistant_blocks);
                    yield deadline_error(&model_id);
                    return;
                }
                result = backend.stream_turn(&submission, allow_tools) => result,
            };

            let mut vendor = match vendor {
                Ok(stream) => stream,
                Err(e) if e.is_transient() && !ttft_emitted && !retried => {
                    warn!(model_id = %model_id, error = %e, "transient connect failure, retrying");
                    retried = true;
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            transcript.set(assistant_blocks);
                            yield cancelled_error(&model_id);
                            return;
                        }
                        () = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                    continue 'rounds;
                }
                Err(e) => {
                    transcript.set(assistant_blocks);
                    yield backend_error(&model_id, &e);
                    return;
                }
            };

            let mut round_text = String::new();
            let mut tool_uses: Vec<(String, String, serde_json::Value)> = Vec::new();

            let end = loop {
                let item = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break RoundEnd::Cancelled,
                    () = tokio::time::sleep_until(deadline_at) => break RoundEnd::DeadlineExceeded,
                    item = vendor.next() => item,
                };

                match item {
                    None => break RoundEnd::Finished,
                    Some(Ok(BackendDelta::Text(text))) => {
                        if text.is_empty() {
                            continue;
                        }
                        if !ttft_emitted {
                            ttft_emitted = true;
                            yield StreamEvent::Ttft {
                                model_id: model_id.clone(),
                                ttft_ms: elapsed_ms(started),
                            };
                        }
                        round_text.push_str(&text);
                        yield StreamEvent::token(&model_id, text);
                    }
                    Some(Ok(BackendDelta::ToolUse { id, name, args })) => {
                        tool_uses.push((id, name, args));
                    }
                    Some(Ok(BackendDelta::Usage { tokens_in: i, tokens_out: o })) => {
                        tokens_in += i;
                        tokens_out += o;
                    }
                    Some(Err(e)) => break RoundEnd::Failed(e),
                }
            };

            match end {
                RoundEnd::Cancelled => {
                    flush_text(&mut assistant_blocks, &mut round_text);
                    transcript.set(assistant_blocks);
                    yield cancelled_error(&model_id);
                    return;
                }
                RoundEnd::DeadlineExceeded => {
                    flush_text(&mut assistant_blocks, &mut round_text);
                    transcript.set(assistant_blocks);
                    yield deadline_error(&model_id);
                    return;
                }
                RoundEnd::Failed(e) if e.is_transient() && !ttft_emitted && !retried => {
                    warn!(model_id = %model_id, error = %e, "transient stream failure, retrying");
                    retried = true;
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            transcript.set(assistant_blocks);
                            yield cancelled_error(&model_id);
                            return;
                        }
                        () = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                    continue 'rounds;
                }
                RoundEnd::Failed(e) => {
                    flush_text(&mut assistant_blocks, &mut round_text);
                    transcript.set(assistant_blocks);
                    yield backend_error(&model_id, &e);
                    return;
                }
                RoundEnd::Finished => {}
            }

            flush_text(&mut assistant_blocks, &mut round_text);
            coaching = None;

            if tool_uses.is_empty() || !allow_tools {
                // Natural end of the generation.
                transcript.set(assistant_blocks);

                if !citations.is_empty() {
                    yield StreamEvent::Citations {
                        model_id: model_id.clone(),
                        citations: std::mem::take(&mut citations),
                    };
                }
                if tokens_in == 0 && tokens_out == 0 {
                    warn!(model_id = %model_id, "vendor reported no token usage, emitting zeros");
                }
                info!(
                    model_id = %model_id,
                    total_ms = elapsed_ms(started),
                    tool_calls = guard.total(),
                    "generation complete"
                );
                yield StreamEvent::Done {
                    model_id: model_id.clone(),
                    total_ms: elapsed_ms(started),
                    tokens_in,
                    tokens_out,
                };
                return;
            }

            // Tool round: execute accepted calls sequentially, never
            // overlapping, each paired with its result in the same turn.
            for (id, name, args) in tool_uses {
                if !guard.may_accept() {
                    warn!(model_id = %model_id, tool = %name, "tool call dropped, generation cap reached");
                    continue;
                }
                guard.record(&name);

                assistant_blocks.push(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    args: args.clone(),
                });

                yield StreamEvent::tool_start(&model_id, &name);
                let tool_started = Instant::now();

                let result = match registry.get(&name) {
                    None => ToolResultBlock::error(&id, format!("unknown tool: {name}")),
                    Some(tool) => {
                        let invocation = tool.invoke(args);
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => {
                                // Pair the pending tool_use so the committed
                                // turn stays well-formed.
                                assistant_blocks.push(ContentBlock::ToolResult(
                                    ToolResultBlock::error(&id, "cancelled"),
                                ));
                                transcript.set(assistant_blocks);
                                yield cancelled_error(&model_id);
                                return;
                            }
                            () = tokio::time::sleep_until(deadline_at) => {
                                assistant_blocks.push(ContentBlock::ToolResult(
                                    ToolResultBlock::error(&id, "deadline exceeded"),
                                ));
                                transcript.set(assistant_blocks);
                                yield deadline_error(&model_id);
                                return;
                            }
                            result = invocation => match result {
                                Ok(docs) => {
                                    for doc in &docs {
                                        if !doc.metadata.is_null() {
                                            citations.push(Citation {
                                                title: doc.title.clone(),
                                                metadata: doc.metadata.clone(),
                                            });
                                        }
                                    }
                                    ToolResultBlock::new(&id, docs)
                                }
                                Err(e) => {
                                    debug!(model_id = %model_id, tool = %name, error = %e, "tool failed");
                                    ToolResultBlock::error(&id, e.to_string())
                                }
                            },
                        }
                    }
                };

                yield StreamEvent::ToolEnd {
                    model_id: model_id.clone(),
                    tool_name: name,
                    duration_ms: elapsed_ms(tool_started),
                };
                assistant_blocks.push(ContentBlock::ToolResult(result));
            }
            transcript.set(assistant_blocks.clone());

            if let Some(reason) = guard.force_reason() {
                info!(model_id = %model_id, reason = ?reason, "forcing answer, tool use disabled");
                coaching = Some(coaching_turn(&reason));
                allow_tools = false;
            }
        }
    }
}

fn flush_text(blocks: &mut Vec<ContentBlock>, text: &mut String) {
    if !text.is_empty() {
        blocks.push(ContentBlock::text(std::mem::take(text)));
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

fn deadline_error(model_id: &str) -> StreamEvent {
    StreamEvent::Error {
        model_id: model_id.to_string(),
        error: "deadline exceeded".to_string(),
        retry_after_ms: None,
    }
}

fn cancelled_error(model_id: &str) -> StreamEvent {
    StreamEvent::Error {
        model_id: model_id.to_string(),
        error: "cancelled".to_string(),
        retry_after_ms: None,
    }
}

fn backend_error(model_id: &str, e: &BackendError) -> StreamEvent {
    StreamEvent::Error {
        model_id: model_id.to_string(),
        error: e.to_string(),
        retry_after_ms: e.is_transient().then_some(2_000),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vendor SSE parsing
// ─────────────────────────────────────────────────────────────────────────────

/// A single event parsed from a vendor SSE byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental parser for vendor SSE responses.
///
/// Both vendor APIs stream `event:`/`data:` frames separated by blank
/// lines; chunk boundaries fall anywhere, so bytes are buffered until a
/// complete frame is available.
#[derive(Debug, Default)]
pub(crate) struct SseFrameBuffer {
    buf: Vec<u8>,
}

impl SseFrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((pos, sep_len)) = find_frame_end(&self.buf) {
            let raw: Vec<u8> = self.buf.drain(..pos + sep_len).collect();
            let text = String::from_utf8_lossy(&raw);

            let mut event = None;
            let mut data = String::new();
            for line in text.lines() {
                let line = line.trim_end_matches('\r');
                if let Some(name) = line.strip_prefix("event:") {
                    event = Some(name.trim().to_string());
                } else if let Some(payload) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(payload.trim_start());
                }
                // id:, retry: and comment lines are ignored.
            }

            if !data.is_empty() {
                frames.push(SseFrame { event, data });
            }
        }
        frames
    }
}

/// Position and length of the next blank-line separator, accepting both
/// `\n\n` and `\r\n\r\n`.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
    }
    None
}
