//! Tandem
//!
//! A side-by-side LLM comparison service: a single prompt is dispatched
//! concurrently to N heterogeneous model backends (Anthropic Claude,
//! Google Gemini) and partial results (first-token latency, streamed
//! content, tool invocations, token counts, errors) are multiplexed back
//! to the browser over Server-Sent Events. Each session keeps independent
//! per-model conversation histories so follow-ups preserve context per
//! backend.
//!
//! # Architecture
//!
//! - [`adapter`]: vendor backends behind a uniform streaming contract,
//!   with the shared agent loop and tool guardrails
//! - [`orchestrator`]: fan-out, merge queue, heartbeat, lifecycle
//! - [`session`]: bounded TTL-scavenged session store
//! - [`sse`]: SSE emitter with disconnect-triggered cancellation
//! - [`server`]: axum HTTP surface with Basic auth
//! - [`events`]: the wire event union
//! - [`tools`]: tool registry and Kalimat search clients

pub mod adapter;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod sse;
pub mod tools;

/// System prompt submitted to every backend.
pub const SYSTEM_PROMPT: &str = "You are Ansari, an Islamic knowledge assistant.\n\n\
When answering questions about Islam, the Quran, or Islamic teachings:\n\
- Use the search_quran tool to find relevant ayahs\n\
- Provide accurate citations\n\
- Be respectful and educational\n\
- Cite your sources using the ayah references";
