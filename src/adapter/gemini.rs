//! Gemini `streamGenerateContent` backend (native SSE).

use std::collections::HashMap;

use async_stream::stream;
use futures::StreamExt;
use tracing::debug;

use crate::history::{ContentBlock, Role, Turn};
use crate::tools::ToolRegistry;

use super::{BackendDelta, BackendError, BackendStream, ModelBackend, SseFrameBuffer};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const MAX_OUTPUT_TOKENS: u32 = 4096;
const TEMPERATURE: f32 = 0.0;

/// Backend for one Gemini model.
pub struct GeminiBackend {
    model: String,
    http: reqwest::Client,
    api_key: String,
    registry: ToolRegistry,
    system_prompt: String,
    base_url: String,
}

impl GeminiBackend {
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
        registry: ToolRegistry,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            http: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
            api_key: api_key.into(),
            registry,
            system_prompt: system_prompt.into(),
            base_url: GEMINI_API_BASE.to_string(),
        }
    }

    fn api_url(&self) -> String {
        format!(
            "{}/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        )
    }

    /// Build the `generateContent` request body.
    ///
    /// Gemini has no tool-result role: `functionResponse` parts travel
    /// under the user role and are keyed by function name, so tool names
    /// are resolved from the `tool_use` ids collected while walking the
    /// turn. Adjacent same-role contents are merged.
    pub(crate) fn build_request_body(&self, history: &[Turn], allow_tools: bool) -> serde_json::Value {
        let mut contents: Vec<serde_json::Value> = Vec::new();

        let mut push_parts = |role: &str, parts: Vec<serde_json::Value>| {
            if parts.is_empty() {
                return;
            }
            if let Some(last) = contents.last_mut() {
                if last["role"] == role {
                    if let Some(existing) = last["parts"].as_array_mut() {
                        existing.extend(parts);
                        return;
                    }
                }
            }
            contents.push(serde_json::json!({ "role": role, "parts": parts }));
        };

        let mut tool_names: HashMap<String, String> = HashMap::new();

        for turn in history {
            match turn.role {
                Role::User => {
                    let parts = turn
                        .blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => {
                                Some(serde_json::json!({ "text": text }))
                            }
                            _ => None,
                        })
                        .collect();
                    push_parts("user", parts);
                }
                Role::Assistant => {
                    let mut run: Vec<serde_json::Value> = Vec::new();
                    for block in &turn.blocks {
                        match block {
                            ContentBlock::Text { text } => {
                                run.push(serde_json::json!({ "text": text }));
                            }
                            ContentBlock::ToolUse { id, name, args } => {
                                tool_names.insert(id.clone(), name.clone());
                                run.push(serde_json::json!({
                                    "functionCall": { "name": name, "args": args }
                                }));
                            }
                            ContentBlock::ToolResult(result) => {
                                push_parts("model", std::mem::take(&mut run));
                                let name = tool_names
                                    .get(&result.tool_use_id)
                                    .cloned()
                                    .unwrap_or_else(|| "unknown".to_string());
                                let documents: Vec<String> = result
                                    .blocks
                                    .iter()
                                    .map(|doc| format!("**{}**\n{}", doc.title, doc.text))
                                    .collect();
                                push_parts(
                                    "user",
                                    vec![serde_json::json!({
                                        "functionResponse": {
                                            "name": name,
                                            "response": { "content": documents.join("\n---\n") },
                                        }
                                    })],
                                );
                            }
                        }
                    }
                    push_parts("model", run);
                }
            }
        }

        let mut body = serde_json::json!({
            "contents": contents,
            "systemInstruction": {
                "parts": [{ "text": self.system_prompt }]
            },
            "generationConfig": {
                "temperature": TEMPERATURE,
                "maxOutputTokens": MAX_OUTPUT_TOKENS,
            }
        });

        if allow_tools && !self.registry.is_empty() {
            body["tools"] = serde_json::json!([{
                "functionDeclarations": self.registry.gemini_declarations_json()
            }]);
        }

        body
    }
}

#[async_trait::async_trait]
impl ModelBackend for GeminiBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream_turn(
        &self,
        history: &[Turn],
        allow_tools: bool,
    ) -> Result<BackendStream, BackendError> {
        let body = self.build_request_body(history, allow_tools);

        debug!(model = %self.model, "Gemini streaming request");

        let response = self
            .http
            .post(self.api_url())
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = text.chars().take(200).collect::<String>();
            return Err(BackendError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let byte_stream = response.bytes_stream();

        let out = stream! {
            futures::pin_mut!(byte_stream);
            let mut parser = SseFrameBuffer::new();

            // Gemini repeats cumulative usage on every chunk; keep the last.
            let mut tokens_in = 0u64;
            let mut tokens_out = 0u64;

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(BackendError::Network(e.to_string()));
                        return;
                    }
                };

                for frame in parser.push(&chunk) {
                    let Ok(data) = serde_json::from_str::<serde_json::Value>(&frame.data) else {
                        continue;
                    };

                    if let Some(error) = data.get("error") {
                        let message = error["message"]
                            .as_str()
                            .unwrap_or("unknown vendor error")
                            .to_string();
                        let status = error["code"].as_u64().unwrap_or(0) as u16;
                        yield Err(BackendError::Api { status, message });
                        return;
                    }

                    if let Some(parts) = data["candidates"][0]["content"]["parts"].as_array() {
                        for part in parts {
                            if let Some(text) = part["text"].as_str() {
                                yield Ok(BackendDelta::Text(text.to_string()));
                            }
                            if let Some(call) = part.get("functionCall") {
                                yield Ok(BackendDelta::ToolUse {
                                    // Gemini does not assign call ids.
                                    id: uuid::Uuid::new_v4().to_string(),
                                    name: call["name"].as_str().unwrap_or("").to_string(),
                                    args: call.get("args").cloned()
                                        .unwrap_or(serde_json::json!({})),
                                });
                            }
                        }
                    }

                    if let Some(meta) = data.get("usageMetadata") {
                        if let Some(n) = meta["promptTokenCount"].as_u64() {
                            tokens_in = n;
                        }
                        if let Some(n) = meta["candidatesTokenCount"].as_u64() {
                            tokens_out = n;
                        }
                    }
                }
            }

            yield Ok(BackendDelta::Usage { tokens_in, tokens_out });
        };

        Ok(Box::pin(out))
    }
}
