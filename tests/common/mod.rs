//! Shared fixtures: scripted mock backends and a test tool registry.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tandem::adapter::{BackendDelta, BackendError, BackendStream, ModelBackend};
use tandem::history::{DocumentBlock, Turn};
use tandem::tools::{Tool, ToolRegistry};

/// One scripted vendor round.
pub enum Round {
    /// Stream these deltas, then end the round.
    Deltas(Vec<Result<BackendDelta, BackendError>>),
    /// Stream these deltas, then hang until cancelled.
    DeltasThenHang(Vec<Result<BackendDelta, BackendError>>),
    /// Fail before any delta is produced.
    ConnectError(BackendError),
}

/// A backend that plays back scripted rounds and records how it was
/// called.
pub struct MockBackend {
    id: String,
    rounds: Mutex<VecDeque<Round>>,
    pub calls: AtomicUsize,
    pub allow_tools_seen: Mutex<Vec<bool>>,
    pub histories_seen: Mutex<Vec<Vec<Turn>>>,
}

impl MockBackend {
    pub fn new(id: impl Into<String>, rounds: Vec<Round>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            rounds: Mutex::new(rounds.into()),
            calls: AtomicUsize::new(0),
            allow_tools_seen: Mutex::new(Vec::new()),
            histories_seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl ModelBackend for MockBackend {
    fn model_id(&self) -> &str {
        &self.id
    }

    async fn stream_turn(
        &self,
        history: &[Turn],
        allow_tools: bool,
    ) -> Result<BackendStream, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.allow_tools_seen.lock().unwrap().push(allow_tools);
        self.histories_seen.lock().unwrap().push(history.to_vec());

        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Round::Deltas(Vec::new()));

        match round {
            Round::ConnectError(e) => Err(e),
            Round::Deltas(items) => Ok(futures::stream::iter(items).boxed()),
            Round::DeltasThenHang(items) => Ok(futures::stream::iter(items)
                .chain(futures::stream::pending())
                .boxed()),
        }
    }
}

/// A tool that returns a fixed document for every invocation.
pub struct FixedTool {
    name: &'static str,
}

impl FixedTool {
    pub fn named(name: &'static str) -> Arc<Self> {
        Arc::new(Self { name })
    }
}

#[async_trait::async_trait]
impl Tool for FixedTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Return a fixed document"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"],
        })
    }

    async fn invoke(&self, args: serde_json::Value) -> anyhow::Result<Vec<DocumentBlock>> {
        let query = args["query"].as_str().unwrap_or_default().to_string();
        Ok(vec![DocumentBlock::new(
            "2:153",
            format!("result for {query}"),
            serde_json::json!({ "citation": "2:153", "query": query }),
        )])
    }
}

/// Registry with `search_quran` and `search_hadith` stand-ins.
pub fn test_registry() -> ToolRegistry {
    ToolRegistry::new(vec![
        FixedTool::named("search_quran"),
        FixedTool::named("search_hadith"),
    ])
}

/// Convenience constructors for scripted deltas.
pub fn text(s: &str) -> Result<BackendDelta, BackendError> {
    Ok(BackendDelta::Text(s.to_string()))
}

pub fn tool_use(id: &str, name: &str) -> Result<BackendDelta, BackendError> {
    Ok(BackendDelta::ToolUse {
        id: id.to_string(),
        name: name.to_string(),
        args: serde_json::json!({ "query": "patience" }),
    })
}

pub fn usage(tokens_in: u64, tokens_out: u64) -> Result<BackendDelta, BackendError> {
    Ok(BackendDelta::Usage {
        tokens_in,
        tokens_out,
    })
}
