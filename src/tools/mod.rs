//! Tool registry exposed to model adapters.
//!
//! A [`Tool`] is a pure async function from JSON arguments to document
//! blocks; no shared mutable state. The [`ToolRegistry`] holds the named
//! set each adapter may expose and converts tool definitions to each
//! vendor's schema format.

pub mod kalimat;

use std::collections::HashMap;
use std::sync::Arc;

use crate::history::DocumentBlock;

pub use kalimat::{KalimatClient, SearchHadith, SearchQuran};

/// A named tool callable by models during a generation.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the tool's arguments.
    fn input_schema(&self) -> serde_json::Value;

    /// Invoke the tool. Runs inside the calling adapter's task; any backing
    /// HTTP call is the implementation's responsibility to pool and time
    /// out.
    async fn invoke(&self, args: serde_json::Value) -> anyhow::Result<Vec<DocumentBlock>>;
}

/// Immutable named set of tools shared by all adapters.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        let map = tools
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        Self {
            tools: Arc::new(map),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Tool definitions in the Anthropic Messages API `tools` format.
    #[must_use]
    pub fn anthropic_tools_json(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "input_schema": t.input_schema(),
                })
            })
            .collect()
    }

    /// Tool definitions in the Gemini `functionDeclarations` format.
    #[must_use]
    pub fn gemini_declarations_json(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.input_schema(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the query back"
        }

        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"],
            })
        }

        async fn invoke(&self, args: serde_json::Value) -> anyhow::Result<Vec<DocumentBlock>> {
            let query = args["query"].as_str().unwrap_or_default();
            Ok(vec![DocumentBlock::new("echo", query, serde_json::Value::Null)])
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoTool)]);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_anthropic_schema_shape() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoTool)]);
        let defs = registry.anthropic_tools_json();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0]["name"], "echo");
        assert!(defs[0]["input_schema"]["properties"]["query"].is_object());
    }

    #[test]
    fn test_gemini_schema_shape() {
        let registry = ToolRegistry::new(vec![Arc::new(EchoTool)]);
        let defs = registry.gemini_declarations_json();
        assert_eq!(defs[0]["name"], "echo");
        // Gemini calls the schema field "parameters".
        assert!(defs[0]["parameters"].is_object());
        assert!(defs[0].get("input_schema").is_none());
    }
}
