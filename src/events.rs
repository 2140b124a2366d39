//! Wire event types for streaming model responses.
//!
//! This module defines the unified event model that abstracts over the
//! different vendor streaming protocols (Anthropic Messages, Gemini
//! `generateContent`) and provides consistent streaming events for the
//! client UI. One [`StreamEvent`] union is the only type that crosses the
//! adapter boundary; vendor translation is local to each backend.
//!
//! # Ordering
//!
//! For a single `model_id`, events are strictly ordered as produced by its
//! adapter: `start` first, at most one `ttft` before the first non-empty
//! `token`, any number of `tool_start`/`tool_end` pairs, and `done` or
//! `error` last. Across model ids no ordering is guaranteed.
//!
//! # Example
//!
//! ```rust
//! use tandem::events::StreamEvent;
//!
//! let event = StreamEvent::token("gemini-2.5-pro", "Hello");
//! let frame = event.sse_frame();
//! assert!(frame.starts_with("event: token\n"));
//! ```

use serde::{Deserialize, Serialize};

/// A citation extracted from the document blocks of a generation's tool
/// results, surfaced to the UI before the model's `done` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// Human-readable source reference (e.g. an ayah id).
    pub title: String,
    /// Source metadata as returned by the tool.
    pub metadata: serde_json::Value,
}

/// Streaming events emitted by model adapters and merged by the
/// orchestrator onto a single SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A model's stream has opened.
    Start {
        model_id: String,
        /// Wall-clock time, milliseconds since the Unix epoch.
        timestamp: i64,
    },

    /// Time to first token; emitted exactly once per model, immediately
    /// before its first non-empty `token` event.
    Ttft { model_id: String, ttft_ms: f64 },

    /// Incremental assistant text.
    Token { model_id: String, content: String },

    /// A tool invocation has started.
    ToolStart {
        model_id: String,
        tool_name: String,
        timestamp: i64,
    },

    /// A tool invocation has completed.
    ToolEnd {
        model_id: String,
        tool_name: String,
        duration_ms: f64,
    },

    /// Source citations aggregated from this generation's tool results.
    Citations {
        model_id: String,
        citations: Vec<Citation>,
    },

    /// A model's stream has completed successfully.
    Done {
        model_id: String,
        total_ms: f64,
        tokens_in: u64,
        tokens_out: u64,
    },

    /// Terminal error for one model; other models continue.
    Error {
        model_id: String,
        error: String,
        /// Present only when the condition is retriable.
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },

    /// Keepalive emitted every 10 seconds while the stream is open.
    Heartbeat { timestamp: i64 },
}

impl StreamEvent {
    /// Create a `start` event stamped with the current wall-clock time.
    #[must_use]
    pub fn start(model_id: impl Into<String>) -> Self {
        Self::Start {
            model_id: model_id.into(),
            timestamp: now_ms(),
        }
    }

    /// Create a `token` event.
    #[must_use]
    pub fn token(model_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Token {
            model_id: model_id.into(),
            content: content.into(),
        }
    }

    /// Create a `tool_start` event stamped with the current wall-clock time.
    #[must_use]
    pub fn tool_start(model_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self::ToolStart {
            model_id: model_id.into(),
            tool_name: tool_name.into(),
            timestamp: now_ms(),
        }
    }

    /// Create a `heartbeat` event stamped with the current wall-clock time.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::Heartbeat { timestamp: now_ms() }
    }

    /// The SSE event name for this event.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Ttft { .. } => "ttft",
            Self::Token { .. } => "token",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Citations { .. } => "citations",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    /// The model this event belongs to; `None` for heartbeats.
    #[must_use]
    pub fn model_id(&self) -> Option<&str> {
        match self {
            Self::Start { model_id, .. }
            | Self::Ttft { model_id, .. }
            | Self::Token { model_id, .. }
            | Self::ToolStart { model_id, .. }
            | Self::ToolEnd { model_id, .. }
            | Self::Citations { model_id, .. }
            | Self::Done { model_id, .. }
            | Self::Error { model_id, .. } => Some(model_id),
            Self::Heartbeat { .. } => None,
        }
    }

    /// Whether this event terminates its model's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Serialize this event as an SSE frame.
    ///
    /// The output follows the Server-Sent Events specification with an
    /// `event:` line for `EventSource` listeners and a `data:` line holding
    /// the JSON payload. Heartbeats are additionally prefixed with a comment
    /// line (`: hb`) for proxies that strip custom event types.
    #[must_use]
    pub fn sse_frame(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "type": "error", "error": e.to_string() }).to_string()
        });

        let name = self.event_name();
        if matches!(self, Self::Heartbeat { .. }) {
            format!(": hb\n\nevent: {name}\ndata: {json}\n\n")
        } else {
            format!("event: {name}\ndata: {json}\n\n")
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
