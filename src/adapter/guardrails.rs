//! Tool-loop guardrails enforced around every backend's agent loop.
//!
//! Regardless of vendor, an adapter must bound its tool behaviour: no more
//! than three consecutive calls to the same tool, a hard total of ten calls
//! per generation, and at most one hundred document blocks in any history
//! submitted to a vendor. Breaching the first two forces the model to
//! answer from what it has via an injected coaching message.

use std::borrow::Cow;

use crate::history::{ContentBlock, Turn};

/// Consecutive calls to the same tool before the model is forced to answer.
pub const MAX_CONSECUTIVE_SAME_TOOL: u32 = 3;

/// Hard cap on tool invocations in a single generation.
pub const MAX_TOOL_CALLS_PER_GENERATION: u32 = 10;

/// Maximum document blocks in a history submitted to a vendor.
pub const MAX_DOCUMENT_BLOCKS: usize = 100;

/// Why a forced answer was injected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForceReason {
    /// The same tool was called [`MAX_CONSECUTIVE_SAME_TOOL`] times in a row.
    ConsecutiveSameTool { tool: String, count: u32 },
    /// The generation hit [`MAX_TOOL_CALLS_PER_GENERATION`] calls.
    TotalCallCap,
}

/// Per-generation tool-call tracking.
#[derive(Debug, Default)]
pub struct ToolLoopGuard {
    last_tool: Option<String>,
    consecutive: u32,
    total: u32,
}

impl ToolLoopGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether another tool call may be accepted at all.
    #[must_use]
    pub fn may_accept(&self) -> bool {
        self.total < MAX_TOOL_CALLS_PER_GENERATION
    }

    /// Record an executed tool call.
    pub fn record(&mut self, tool_name: &str) {
        self.total += 1;
        if self.last_tool.as_deref() == Some(tool_name) {
            self.consecutive += 1;
        } else {
            self.last_tool = Some(tool_name.to_string());
            self.consecutive = 1;
        }
    }

    /// Total calls recorded so far.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Check whether the next assistant turn must be forced to answer.
    #[must_use]
    pub fn force_reason(&self) -> Option<ForceReason> {
        if self.total >= MAX_TOOL_CALLS_PER_GENERATION {
            return Some(ForceReason::TotalCallCap);
        }
        if self.consecutive >= MAX_CONSECUTIVE_SAME_TOOL {
            return Some(ForceReason::ConsecutiveSameTool {
                tool: self.last_tool.clone().unwrap_or_default(),
                count: self.consecutive,
            });
        }
        None
    }
}

/// The synthetic user-role coaching turn that disables further tool use.
#[must_use]
pub fn coaching_turn(reason: &ForceReason) -> Turn {
    let text = match reason {
        ForceReason::ConsecutiveSameTool { tool, count } => format!(
            "You have called {tool} {count} times in a row. Do not call any more \
             tools; answer now from the information you already have."
        ),
        ForceReason::TotalCallCap => format!(
            "You have used the maximum of {MAX_TOOL_CALLS_PER_GENERATION} tool calls \
             for this response. Do not call any more tools; answer now from the \
             information you already have."
        ),
    };
    Turn::user(text)
}

/// Enforce the document-block budget on a submission copy.
///
/// Counts document blocks across the history; if over budget, drops the
/// oldest until at or under, but never a tool result's last document, so
/// every `tool_result` still carries one. The canonical history is never
/// touched: the input is returned borrowed when already within budget.
#[must_use]
pub fn enforce_document_budget(turns: &[Turn]) -> Cow<'_, [Turn]> {
    let total: usize = turns.iter().map(Turn::document_count).sum();
    if total <= MAX_DOCUMENT_BLOCKS {
        return Cow::Borrowed(turns);
    }

    let mut trimmed = turns.to_vec();
    let mut excess = total - MAX_DOCUMENT_BLOCKS;

    'outer: for turn in &mut trimmed {
        for block in &mut turn.blocks {
            let ContentBlock::ToolResult(result) = block else {
                continue;
            };
            while excess > 0 && result.blocks.len() > 1 {
                result.blocks.remove(0);
                excess -= 1;
            }
            if excess == 0 {
                break 'outer;
            }
        }
    }

    Cow::Owned(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{DocumentBlock, ToolResultBlock};

    fn tool_round_turn(docs_per_result: usize, results: usize) -> Turn {
        let mut blocks = Vec::new();
        for i in 0..results {
            blocks.push(ContentBlock::ToolUse {
                id: format!("t{i}"),
                name: "search_quran".into(),
                args: serde_json::json!({"query": "q"}),
            });
            let docs = (0..docs_per_result)
                .map(|d| DocumentBlock::new(format!("doc {d}"), "text", serde_json::Value::Null))
                .collect();
            blocks.push(ContentBlock::ToolResult(ToolResultBlock::new(
                format!("t{i}"),
                docs,
            )));
        }
        Turn::assistant(blocks)
    }

    #[test]
    fn test_consecutive_same_tool_forces_answer() {
        let mut guard = ToolLoopGuard::new();
        guard.record("search_quran");
        guard.record("search_quran");
        assert!(guard.force_reason().is_none());

        guard.record("search_quran");
        assert!(matches!(
            guard.force_reason(),
            Some(ForceReason::ConsecutiveSameTool { count: 3, .. })
        ));
    }

    #[test]
    fn test_switching_tools_resets_consecutive_count() {
        let mut guard = ToolLoopGuard::new();
        guard.record("search_quran");
        guard.record("search_quran");
        guard.record("search_hadith");
        guard.record("search_quran");
        assert!(guard.force_reason().is_none());
    }

    #[test]
    fn test_total_cap_forces_answer() {
        let mut guard = ToolLoopGuard::new();
        for i in 0..10 {
            // Alternate names so the consecutive rule never fires.
            guard.record(if i % 2 == 0 { "search_quran" } else { "search_hadith" });
        }
        assert_eq!(guard.force_reason(), Some(ForceReason::TotalCallCap));
        assert!(!guard.may_accept());
    }

    #[test]
    fn test_coaching_turn_is_user_role() {
        let turn = coaching_turn(&ForceReason::TotalCallCap);
        assert_eq!(turn.role, crate::history::Role::User);
        assert!(turn.text().contains("Do not call any more tools"));
    }

    #[test]
    fn test_document_budget_within_limit_borrows() {
        let turns = vec![Turn::user("q"), tool_round_turn(5, 2)];
        let submission = enforce_document_budget(&turns);
        assert!(matches!(submission, Cow::Borrowed(_)));
    }

    #[test]
    fn test_document_budget_drops_oldest() {
        // 12 results x 10 docs = 120 documents, 20 over budget.
        let turns = vec![Turn::user("q"), tool_round_turn(10, 12)];
        let submission = enforce_document_budget(&turns);

        let total: usize = submission.iter().map(Turn::document_count).sum();
        assert_eq!(total, MAX_DOCUMENT_BLOCKS);

        // Oldest results were trimmed first; newest kept whole.
        let Turn { blocks, .. } = &submission[1];
        let ContentBlock::ToolResult(first) = &blocks[1] else {
            panic!("expected tool result");
        };
        let ContentBlock::ToolResult(last) = &blocks[blocks.len() - 1] else {
            panic!("expected tool result");
        };
        assert!(first.blocks.len() < last.blocks.len());

        // Canonical history unchanged.
        assert_eq!(turns[1].document_count(), 120);
    }

    #[test]
    fn test_document_budget_keeps_one_per_result() {
        // Pathological: 120 results of one doc each, nothing droppable.
        let turns = vec![tool_round_turn(1, 120)];
        let submission = enforce_document_budget(&turns);
        for turn in submission.iter() {
            for block in &turn.blocks {
                if let ContentBlock::ToolResult(result) = block {
                    assert!(!result.blocks.is_empty());
                }
            }
        }
    }
}
