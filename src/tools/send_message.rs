//! `send_message`: deliver a persona message into the current stream.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::safety::check_outgoing_message;
use super::{Tool, ToolCategory, ToolContext, ToolOutput};

pub const SEND_MESSAGE_TOOL: &str = "send_message";

pub struct SendMessageTool;

impl SendMessageTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SendMessageTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        SEND_MESSAGE_TOOL
    }

    fn description(&self) -> &str {
        "Post a message to the current conversation. Each call creates one visible message; keep replies focused."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "Markdown text of the message to post"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let content = params
            .get("content")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if content.is_empty() {
            return Ok(ToolOutput::Error(
                "Message content must not be empty".to_string(),
            ));
        }

        if let Err(reason) = check_outgoing_message(content) {
            return Ok(ToolOutput::Error(format!("Message not sent: {}", reason)));
        }

        let message_id = ctx
            .sender
            .send(&ctx.stream_id, &ctx.persona_id, content, &ctx.sources)
            .await
            .with_context(|| format!("Failed to deliver message to stream {}", ctx.stream_id))?;

        tracing::info!(
            session_id = %ctx.session_id,
            stream_id = %ctx.stream_id,
            message_id = %message_id,
            sources = ctx.sources.len(),
            "Persona message delivered"
        );

        Ok(ToolOutput::Sent { message_id })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Messaging
    }
}
