//! Model client for the response loop.
//!
//! The loop only needs one capability: given the system prompt, the transcript
//! and the bound tool definitions, produce the next assistant turn. The default
//! implementation talks to any OpenAI-compatible `/chat/completions` endpoint
//! (Ollama, LM Studio, vLLM, OpenAI, ...).

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::http_client::build_http_client;
use crate::tools::{ToolCall, ToolDef};

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<LlmToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Tool call as returned by the LLM (OpenAI format)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub call_type: String,
    pub function: LlmFunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmFunctionCall {
    pub name: String,
    pub arguments: String, // JSON string
}

/// One model response: optional visible text plus zero or more tool calls.
#[derive(Debug, Clone, Default)]
pub struct AssistantTurn {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl AssistantTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(text: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { text, tool_calls }
    }

    /// Transcript entry for this turn, in the same wire shape the model produced.
    pub fn to_message(&self) -> Message {
        let tool_calls = if self.tool_calls.is_empty() {
            None
        } else {
            Some(
                self.tool_calls
                    .iter()
                    .map(|call| LlmToolCall {
                        id: call.id.clone(),
                        call_type: "function".to_string(),
                        function: LlmFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.to_string(),
                        },
                    })
                    .collect(),
            )
        };

        Message {
            role: "assistant".to_string(),
            content: self.text.clone(),
            tool_calls,
            tool_call_id: None,
        }
    }
}

/// Produces the next assistant turn for a transcript.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete_turn(
        &self,
        system_prompt: &str,
        transcript: &[Message],
        tools: &[ToolDef],
    ) -> Result<AssistantTurn>;
}

/// OpenAI-compatible chat completions client with tool binding.
#[derive(Clone)]
pub struct OpenAiModelClient {
    api_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiModelClient {
    pub fn new(api_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            api_url: normalize_api_url(&api_url),
            model,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            temperature: 0.7,
            max_tokens: 2048,
            client: build_http_client(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let mut client = Self::new(
            config.llm_api_url.clone(),
            config.llm_model.clone(),
            config.llm_api_key.clone(),
        );
        client.temperature = config.llm_temperature;
        client.max_tokens = config.llm_max_tokens;
        client
    }
}

#[async_trait]
impl ModelClient for OpenAiModelClient {
    async fn complete_turn(
        &self,
        system_prompt: &str,
        transcript: &[Message],
        tools: &[ToolDef],
    ) -> Result<AssistantTurn> {
        let url = format!("{}/chat/completions", self.api_url);

        let mut messages = Vec::with_capacity(transcript.len() + 1);
        messages.push(Message::system(system_prompt));
        messages.extend_from_slice(transcript);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        // Only include tools if we have any
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)?;
        }

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, body);
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        parse_completion(&response_json)
    }
}

/// Extract the assistant turn from a chat completions response body.
fn parse_completion(response_json: &serde_json::Value) -> Result<AssistantTurn> {
    let choice = response_json["choices"]
        .as_array()
        .and_then(|arr| arr.first())
        .context("Empty choices in LLM response")?;

    let message = &choice["message"];
    let text = message["content"]
        .as_str()
        .map(|raw| split_visible_and_thinking(raw).0)
        .filter(|visible| !visible.is_empty());

    let raw_calls: Vec<LlmToolCall> = message
        .get("tool_calls")
        .and_then(|tc| serde_json::from_value(tc.clone()).ok())
        .unwrap_or_default();

    let tool_calls = raw_calls
        .into_iter()
        .enumerate()
        .map(|(idx, tc)| {
            let arguments = if tc.function.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&tc.function.arguments).unwrap_or_else(|e| {
                    tracing::warn!(
                        tool = %tc.function.name,
                        "Failed to parse tool arguments as JSON: {}",
                        e
                    );
                    serde_json::json!({})
                })
            };
            ToolCall {
                id: if tc.id.trim().is_empty() {
                    format!("tool_call_{}", idx)
                } else {
                    tc.id
                },
                name: tc.function.name,
                arguments,
            }
        })
        .collect();

    Ok(AssistantTurn { text, tool_calls })
}

/// Accept both `http://host:port` and `http://host:port/v1` style base URLs.
fn normalize_api_url(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    let trimmed = trimmed
        .strip_suffix("/chat/completions")
        .unwrap_or(trimmed);
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

/// Remove `<thinking>`/`<think>` blocks, returning the visible text and the
/// extracted thoughts.
pub fn split_visible_and_thinking(input: &str) -> (String, Vec<String>) {
    fn extract_tag(text: String, open_tag: &str, close_tag: &str) -> (String, Vec<String>) {
        let mut rest = text;
        let mut thoughts = Vec::new();

        while let Some(start) = rest.find(open_tag) {
            let content_start = start + open_tag.len();
            let (thought, remove_end) = match rest[content_start..].find(close_tag) {
                Some(rel_end) => {
                    let end = content_start + rel_end;
                    (rest[content_start..end].trim().to_string(), end + close_tag.len())
                }
                // Unterminated block swallows the remainder.
                None => (rest[content_start..].trim().to_string(), rest.len()),
            };
            if !thought.is_empty() {
                thoughts.push(thought);
            }
            rest.replace_range(start..remove_end, "");
        }

        (rest, thoughts)
    }

    let (without_thinking_tag, mut thoughts) =
        extract_tag(input.to_string(), "<thinking>", "</thinking>");
    let (visible, mut more) = extract_tag(without_thinking_tag, "<think>", "</think>");
    thoughts.append(&mut more);

    (visible.trim().to_string(), thoughts)
}
