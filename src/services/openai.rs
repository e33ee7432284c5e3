// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! OpenAI-compatible streaming chat-completion client.
//!
//! Talks to the `/v1/chat/completions` endpoint (or any compatible API)
//! with `stream: true`, parses the SSE response line-by-line, and emits
//! [`LlmEvent`]s over a channel: content deltas as [`LlmEvent::Token`],
//! accumulated tool calls as [`LlmEvent::ToolCallRequested`], and a final
//! [`LlmEvent::Done`].
//!
//! Tool results resume generation as a continuation request: the caller
//! appends the `assistant.tool_calls` message plus a `role: "tool"` message
//! (see [`tool_result_messages`]) and opens a fresh stream with the
//! extended message list.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::LlmError;
use crate::events::{FinishReason, LlmEvent, ToolCallRequest};
use crate::services::{GenerationBounds, LanguageModel};

// ---------------------------------------------------------------------------
// API request / response types (subset needed for streaming)
// ---------------------------------------------------------------------------

/// Body sent to `/v1/chat/completions`.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Value],
    stream: bool,
    temperature: f64,
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

/// A single SSE chunk from the streaming completions endpoint.
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates streamed tool-call fragments by index.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: Vec<(String, String, String)>, // (id, name, raw arguments)
    current_idx: Option<usize>,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, fragment: &ChunkToolCall) {
        if self.current_idx != Some(fragment.index) {
            self.calls.push((String::new(), String::new(), String::new()));
            self.current_idx = Some(fragment.index);
        }
        let entry = self.calls.last_mut().expect("just pushed");
        if let Some(ref id) = fragment.id {
            entry.0.push_str(id);
        }
        if let Some(ref func) = fragment.function {
            if let Some(ref name) = func.name {
                entry.1.push_str(name);
            }
            if let Some(ref args) = func.arguments {
                entry.2.push_str(args);
            }
        }
    }

    fn finish(self) -> Vec<ToolCallRequest> {
        self.calls
            .into_iter()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, raw_args)| {
                let arguments: Value = serde_json::from_str(&raw_args).unwrap_or_else(|e| {
                    warn!(error = %e, raw = %raw_args, "Failed to parse tool call arguments");
                    Value::Object(serde_json::Map::new())
                });
                ToolCallRequest {
                    id,
                    name,
                    arguments,
                }
            })
            .collect()
    }
}

/// Build the two messages that feed a tool result back to the model.
pub fn tool_result_messages(request: &ToolCallRequest, result: &Value) -> [Value; 2] {
    [
        serde_json::json!({
            "role": "assistant",
            "tool_calls": [{
                "id": request.id,
                "type": "function",
                "function": {
                    "name": request.name,
                    "arguments": request.arguments.to_string(),
                }
            }]
        }),
        serde_json::json!({
            "role": "tool",
            "tool_call_id": request.id,
            "content": result.to_string(),
        }),
    ]
}

// ---------------------------------------------------------------------------
// OpenAILLMClient
// ---------------------------------------------------------------------------

/// Streaming chat-completion client for OpenAI-compatible endpoints.
pub struct OpenAILLMClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAILLMClient {
    /// Default model used when none is specified.
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";

    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let model = if model.is_empty() {
            Self::DEFAULT_MODEL.to_string()
        } else {
            model
        };
        Self {
            api_key: api_key.into(),
            model,
            base_url: "https://api.openai.com".to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(90))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    /// Builder method: set a custom base URL (Azure, local proxies, mocks).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Parse the SSE byte stream, pushing events until `[DONE]` or error.
    async fn pump_sse(
        response: reqwest::Response,
        events_tx: mpsc::Sender<LlmEvent>,
    ) {
        let mut byte_stream = response.bytes_stream();
        // Buffer for incomplete SSE lines; the byte stream may split mid-line.
        let mut line_buffer = String::with_capacity(256);
        let mut accumulator = ToolCallAccumulator::default();
        let mut finish_reason: Option<String> = None;

        'stream: while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "LLM SSE read error");
                    break;
                }
            };
            let text = match std::str::from_utf8(&chunk) {
                Ok(t) => t,
                Err(_) => {
                    warn!("Non-UTF-8 data in LLM SSE stream, skipping chunk");
                    continue;
                }
            };
            line_buffer.push_str(text);

            while let Some(newline_pos) = line_buffer.find('\n') {
                let line: String = line_buffer[..newline_pos].to_string();
                line_buffer.drain(..=newline_pos);

                let line = line.trim();
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    debug!("LLM SSE stream completed");
                    break 'stream;
                }

                let parsed: ChatCompletionChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, data, "Failed to parse LLM SSE chunk");
                        continue;
                    }
                };

                let Some(choice) = parsed.choices.first() else {
                    continue;
                };
                if let Some(ref reason) = choice.finish_reason {
                    finish_reason = Some(reason.clone());
                }
                let Some(delta) = choice.delta.as_ref() else {
                    continue;
                };

                if let Some(ref tool_calls) = delta.tool_calls {
                    for fragment in tool_calls {
                        accumulator.absorb(fragment);
                    }
                } else if let Some(ref content) = delta.content {
                    if !content.is_empty()
                        && events_tx
                            .send(LlmEvent::Token(content.clone()))
                            .await
                            .is_err()
                    {
                        // Receiver dropped: generation was cancelled.
                        return;
                    }
                }
            }
        }

        let tool_requests = accumulator.finish();
        let finish = match finish_reason.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("tool_calls") => FinishReason::ToolCalls,
            _ if !tool_requests.is_empty() => FinishReason::ToolCalls,
            Some(_) | None => FinishReason::Unknown,
        };

        for request in tool_requests {
            debug!(tool = %request.name, "LLM requested tool call");
            if events_tx
                .send(LlmEvent::ToolCallRequested(request))
                .await
                .is_err()
            {
                return;
            }
        }
        let _ = events_tx.send(LlmEvent::Done(finish)).await;
    }
}

#[async_trait]
impl LanguageModel for OpenAILLMClient {
    async fn stream_chat(
        &self,
        messages: Vec<Value>,
        tools: Vec<Value>,
        bounds: GenerationBounds,
    ) -> Result<mpsc::Receiver<LlmEvent>, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
            temperature: bounds.temperature,
            max_tokens: bounds.max_tokens,
            tools: if tools.is_empty() { None } else { Some(&tools) },
            tool_choice: if tools.is_empty() { None } else { Some("auto") },
        };

        debug!(
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "Starting streaming chat completion"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(status, body = %body, "LLM API returned an error");
            return Err(LlmError::Api { status, body });
        }

        let (events_tx, events_rx) = mpsc::channel(256);
        tokio::spawn(Self::pump_sse(response, events_tx));
        Ok(events_rx)
    }
}

impl fmt::Debug for OpenAILLMClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAILLMClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
