//! Anthropic Messages API backend (native SSE).

use async_stream::stream;
use futures::StreamExt;
use tracing::debug;

use crate::history::{ContentBlock, Role, Turn};
use crate::tools::ToolRegistry;

use super::{BackendDelta, BackendError, BackendStream, ModelBackend, SseFrameBuffer};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROMPT_CACHING_BETA: &str = "prompt-caching-2024-07-31";

/// Identical generation settings across vendors, for fair comparison.
const MAX_OUTPUT_TOKENS: u32 = 4096;
const TEMPERATURE: f32 = 0.0;

/// Backend for one Claude model.
pub struct AnthropicBackend {
    model: String,
    http: reqwest::Client,
    api_key: String,
    registry: ToolRegistry,
    system_prompt: String,
    base_url: String,
}

impl AnthropicBackend {
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
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    /// Build the Messages API request body.
    ///
    /// Tool rounds live inside our assistant turns; on the wire Anthropic
    /// wants `tool_use` under the assistant role and `tool_result` under
    /// the user role, so each turn is split into alternating wire messages
    /// and adjacent same-role messages are merged. The last content block
    /// gets the prompt-caching marker.
    pub(crate) fn build_request_body(&self, history: &[Turn], allow_tools: bool) -> serde_json::Value {
        let mut messages: Vec<serde_json::Value> = Vec::new();

        let mut push_blocks = |role: &str, blocks: Vec<serde_json::Value>| {
            if blocks.is_empty() {
                return;
            }
            if let Some(last) = messages.last_mut() {
                if last["role"] == role {
                    if let Some(content) = last["content"].as_array_mut() {
                        content.extend(blocks);
                        return;
                    }
                }
            }
            messages.push(serde_json::json!({ "role": role, "content": blocks }));
        };

        for turn in history {
            match turn.role {
                Role::User => {
                    let blocks = turn
                        .blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => {
                                Some(serde_json::json!({ "type": "text", "text": text }))
                            }
                            _ => None,
                        })
                        .collect();
                    push_blocks("user", blocks);
                }
                Role::Assistant => {
                    let mut run: Vec<serde_json::Value> = Vec::new();
                    for block in &turn.blocks {
                        match block {
                            ContentBlock::Text { text } => {
                                run.push(serde_json::json!({ "type": "text", "text": text }));
                            }
                            ContentBlock::ToolUse { id, name, args } => {
                                run.push(serde_json::json!({
                                    "type": "tool_use",
                                    "id": id,
                                    "name": name,
                                    "input": args,
                                }));
                            }
                            ContentBlock::ToolResult(result) => {
                                push_blocks("assistant", std::mem::take(&mut run));
                                let content: Vec<serde_json::Value> = result
                                    .blocks
                                    .iter()
                                    .map(|doc| {
                                        serde_json::json!({
                                            "type": "text",
                                            "text": format!("**{}**\n{}", doc.title, doc.text),
                                        })
                                    })
                                    .collect();
                                push_blocks(
                                    "user",
                                    vec![serde_json::json!({
                                        "type": "tool_result",
                                        "tool_use_id": result.tool_use_id,
                                        "is_error": result.is_error,
                                        "content": content,
                                    })],
                                );
                            }
                        }
                    }
                    push_blocks("assistant", run);
                }
            }
        }

        // Prompt-caching marker on the last block of the last message.
        if let Some(last) = messages.last_mut() {
            if let Some(block) = last["content"]
                .as_array_mut()
                .and_then(|blocks| blocks.last_mut())
            {
                block["cache_control"] = serde_json::json!({ "type": "ephemeral" });
            }
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "temperature": TEMPERATURE,
            "stream": true,
            "system": self.system_prompt,
            "messages": messages,
        });

        if allow_tools && !self.registry.is_empty() {
            body["tools"] = serde_json::json!(self.registry.anthropic_tools_json());
        }

        body
    }
}

#[async_trait::async_trait]
impl ModelBackend for AnthropicBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream_turn(
        &self,
        history: &[Turn],
        allow_tools: bool,
    ) -> Result<BackendStream, BackendError> {
        let body = self.build_request_body(history, allow_tools);

        debug!(model = %self.model, "Anthropic streaming request");

        let response = self
            .http
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", PROMPT_CACHING_BETA)
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

            // Tool-use block currently being assembled from deltas.
            let mut tool_id = String::new();
            let mut tool_name = String::new();
            let mut tool_json = String::new();

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
                    let event_type = frame.event.as_deref().unwrap_or("");
                    let Ok(data) = serde_json::from_str::<serde_json::Value>(&frame.data) else {
                        continue;
                    };

                    match event_type {
                        "message_start" => {
                            if let Some(n) = data["message"]["usage"]["input_tokens"].as_u64() {
                                tokens_in = n;
                            }
                        }
                        "content_block_start" => {
                            if data["content_block"]["type"] == "tool_use" {
                                tool_id = data["content_block"]["id"]
                                    .as_str()
                                    .unwrap_or("")
                                    .to_string();
                                tool_name = data["content_block"]["name"]
                                    .as_str()
                                    .unwrap_or("")
                                    .to_string();
                                tool_json.clear();
                            }
                        }
                        "content_block_delta" => {
                            match data["delta"]["type"].as_str().unwrap_or("") {
                                "text_delta" => {
                                    if let Some(text) = data["delta"]["text"].as_str() {
                                        yield Ok(BackendDelta::Text(text.to_string()));
                                    }
                                }
                                "input_json_delta" => {
                                    if let Some(part) = data["delta"]["partial_json"].as_str() {
                                        tool_json.push_str(part);
                                    }
                                }
                                _ => {}
                            }
                        }
                        "content_block_stop" => {
                            if !tool_name.is_empty() {
                                let args = serde_json::from_str(&tool_json)
                                    .unwrap_or(serde_json::json!({}));
                                yield Ok(BackendDelta::ToolUse {
                                    id: std::mem::take(&mut tool_id),
                                    name: std::mem::take(&mut tool_name),
                                    args,
                                });
                                tool_json.clear();
                            }
                        }
                        "message_delta" => {
                            if let Some(n) = data["usage"]["output_tokens"].as_u64() {
                                tokens_out = n;
                            }
                        }
                        "error" => {
                            let message = data["error"]["message"]
                                .as_str()
                                .unwrap_or("unknown vendor error")
                                .to_string();
                            yield Err(BackendError::Api { status: 0, message });
                            return;
                        }
                        _ => {}
                    }
                }
            }

            // Usage is reported once, with the vendor's final counts.
            yield Ok(BackendDelta::Usage { tokens_in, tokens_out });
        };

        Ok(Box::pin(out))
    }
}
