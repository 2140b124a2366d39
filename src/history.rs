//! Conversation turns and typed content blocks.
//!
//! Each model keeps its own independent history because vendors disagree on
//! tool-call shapes. A history is an alternating sequence of user and
//! assistant [`Turn`]s; tool rounds (a `tool_use` plus its `tool_result`)
//! live inside the assistant turn that produced them.
//!
//! Content is a tagged block union rather than loose JSON so the
//! tool-result invariant (every `tool_result` carries at least one
//! document) is enforced at construction sites.

use serde::{Deserialize, Serialize};

/// Maximum number of turns retained per model history (5 full
/// user/assistant exchanges).
pub const MAX_HISTORY_TURNS: usize = 10;

/// Maximum estimated tokens retained per model history.
pub const MAX_HISTORY_TOKENS: usize = 8_000;

/// Author of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A document carried inside a `tool_result`, used by models for citation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentBlock {
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl DocumentBlock {
    #[must_use]
    pub fn new(title: impl Into<String>, text: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            metadata,
        }
    }

    /// Placeholder document inserted when a tool returned nothing.
    #[must_use]
    pub fn empty_fallback() -> Self {
        Self {
            title: "No results".to_string(),
            text: "No content found for this query.".to_string(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Result of one tool invocation.
///
/// Constructed only through [`ToolResultBlock::new`] and
/// [`ToolResultBlock::error`], both of which guarantee at least one
/// document block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub blocks: Vec<DocumentBlock>,
    pub is_error: bool,
}

impl ToolResultBlock {
    /// Build a tool result, inserting a synthetic "no content" document if
    /// the tool returned empty.
    #[must_use]
    pub fn new(tool_use_id: impl Into<String>, mut blocks: Vec<DocumentBlock>) -> Self {
        if blocks.is_empty() {
            blocks.push(DocumentBlock::empty_fallback());
        }
        Self {
            tool_use_id: tool_use_id.into(),
            blocks,
            is_error: false,
        }
    }

    /// Build an error result carrying a single error document, letting the
    /// model recover from a failed tool call.
    #[must_use]
    pub fn error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            blocks: vec![DocumentBlock::new(
                "Tool error",
                message.into(),
                serde_json::Value::Null,
            )],
            is_error: true,
        }
    }
}

/// One typed content block inside a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolResult(ToolResultBlock),
}

impl ContentBlock {
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text { text: s.into() }
    }

    /// Approximate character weight of this block, used for token
    /// estimation.
    #[must_use]
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text { text } => text.len(),
            Self::ToolUse { name, args, .. } => name.len() + args.to_string().len(),
            Self::ToolResult(r) => r
                .blocks
                .iter()
                .map(|d| d.title.len() + d.text.len())
                .sum(),
        }
    }
}

/// One turn of a per-model conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
}

impl Turn {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            blocks: vec![ContentBlock::text(text)],
        }
    }

    #[must_use]
    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            blocks,
        }
    }

    /// Concatenated text content of this turn.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }

    /// Approximate character weight of this turn.
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.blocks.iter().map(ContentBlock::char_len).sum()
    }

    /// Number of document blocks carried by this turn's tool results.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| match b {
                ContentBlock::ToolResult(r) => r.blocks.len(),
                _ => 0,
            })
            .sum()
    }
}

/// Estimate the token count of a history by character-count heuristic
/// (characters divided by four).
#[must_use]
pub fn estimate_tokens(turns: &[Turn]) -> usize {
    turns.iter().map(Turn::char_len).sum::<usize>() / 4
}

/// Truncate a history in place to the most recent [`MAX_HISTORY_TURNS`]
/// turns or [`MAX_HISTORY_TOKENS`] estimated tokens, whichever binds first.
///
/// Drops oldest complete turns only, in user/assistant pairs so the
/// alternation invariant holds, and never drops the most recent turn.
pub fn truncate_history(turns: &mut Vec<Turn>) {
    while turns.len() > MAX_HISTORY_TURNS {
        drop_oldest_pair(turns);
    }
    while turns.len() > 2 && estimate_tokens(turns) > MAX_HISTORY_TOKENS {
        drop_oldest_pair(turns);
    }
}

fn drop_oldest_pair(turns: &mut Vec<Turn>) {
    turns.remove(0);
    // Keep the front on a user turn so roles still alternate.
    if turns.first().is_some_and(|t| t.role == Role::Assistant) {
        turns.remove(0);
    }
}
