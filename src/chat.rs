//! Chat model abstraction and the OpenAI-compatible implementation.
//!
//! The seam is step-based: one [`ChatModel::step`] call per model turn,
//! returning text, optional reasoning, tool calls, a finish reason, and
//! usage. The agent driver owns the loop — it executes tool calls and
//! feeds results back as messages. Provider types never leak past this
//! module; tool inputs and outputs are free-form JSON.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// A tool the model may call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input.
    pub input_schema: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Conversation history entry.
#[derive(Debug, Clone)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant {
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    ToolResult {
        call_id: String,
        name: String,
        output: serde_json::Value,
    },
}

/// Token usage summary, summed across steps.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Why a model turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other,
}

/// One model turn.
#[derive(Debug, Clone)]
pub struct ModelStep {
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish: FinishReason,
    pub usage: Usage,
}

/// A chat completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier for logging and stream metadata.
    fn model_name(&self) -> &str;

    /// Run one model turn over the conversation so far.
    async fn step(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ModelStep>;
}

/// Chat backend speaking the OpenAI chat-completions wire format.
pub struct OpenAiChatModel {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    /// # Errors
    ///
    /// `Validation` when the API key is empty.
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::Validation("chat API key not set".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            model: model.into(),
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            client,
        })
    }

    /// Override the API base URL for compatible providers and tests.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| match m {
                ChatMessage::System(text) => {
                    serde_json::json!({ "role": "system", "content": text })
                }
                ChatMessage::User(text) => {
                    serde_json::json!({ "role": "user", "content": text })
                }
                ChatMessage::Assistant { text, tool_calls } => {
                    let mut msg = serde_json::json!({ "role": "assistant", "content": text });
                    if !tool_calls.is_empty() {
                        msg["tool_calls"] = tool_calls
                            .iter()
                            .map(|tc| {
                                serde_json::json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.input.to_string(),
                                    },
                                })
                            })
                            .collect();
                    }
                    msg
                }
                ChatMessage::ToolResult {
                    call_id, output, ..
                } => serde_json::json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": output.to_string(),
                }),
            })
            .collect()
    }

    fn wire_tools(tools: &[ToolSpec]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect()
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn step(&self, messages: &[ChatMessage], tools: &[ToolSpec]) -> Result<ModelStep> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": Self::wire_messages(messages),
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(Self::wire_tools(tools));
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!("chat API {status}: {body_text}")));
        }

        let json: serde_json::Value = response.json().await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<ModelStep> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| Error::Upstream("chat response missing choices".to_string()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| Error::Upstream("chat response missing message".to_string()))?;

    let text = message
        .get("content")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("")
        .to_string();
    let reasoning = message
        .get("reasoning_content")
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string);

    let tool_calls = message
        .get("tool_calls")
        .and_then(|t| t.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id")?.as_str()?.to_string();
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = function.get("arguments")?.as_str().unwrap_or("{}");
                    let input = serde_json::from_str(arguments)
                        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                    Some(ToolCall { id, name, input })
                })
                .collect()
        })
        .unwrap_or_default();

    let finish = match choice.get("finish_reason").and_then(|f| f.as_str()) {
        Some("stop") => FinishReason::Stop,
        Some("tool_calls") => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        _ => FinishReason::Other,
    };

    let usage = json
        .get("usage")
        .map(|u| Usage {
            input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: u
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        })
        .unwrap_or_default();

    Ok(ModelStep {
        text,
        reasoning,
        tool_calls,
        finish,
        usage,
    })
}
