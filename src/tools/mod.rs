//! Tool system for capabilities the persona can invoke while composing a reply.
//!
//! Each tool declares a JSON Schema for its parameters, enabling LLM
//! function-calling. Tools are registered in a thread-safe [`ToolRegistry`]
//! that generates OpenAI-format function definitions and executes calls.
//!
//! Execution never fails across the call boundary: unknown tools, invalid
//! arguments, errors returned by a tool and panics inside a tool all come back
//! as [`ToolOutput::Error`] so the model can react to them.

pub mod http;
pub mod safety;
pub mod schema;
pub mod search;
pub mod send_message;
pub mod sources;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::chat::MessageSender;
use sources::Source;

/// Category of tool, used for logging and policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolCategory {
    /// Delivers content into the stream
    Messaging,
    /// Search providers whose results carry citations
    Search,
    /// HTTP/network requests
    Network,
    /// General purpose / uncategorized
    General,
}

/// The result of executing a tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ToolOutput {
    /// Successful text output
    Text(String),
    /// Successful structured output
    Json(serde_json::Value),
    /// A message was delivered to the stream
    Sent { message_id: String },
    /// Tool execution failed
    Error(String),
}

impl ToolOutput {
    /// Convert to a string representation suitable for feeding back to the LLM
    pub fn to_llm_string(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Json(v) => {
                serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
            }
            ToolOutput::Sent { message_id } => format!("Message sent (id: {})", message_id),
            ToolOutput::Error(e) => format!("[ERROR] {}", e),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ToolOutput::Error(_))
    }
}

/// Context passed to tools during execution
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub stream_id: String,
    pub persona_id: String,
    /// Delivery channel for `send_message`
    pub sender: Arc<dyn MessageSender>,
    /// Sources collected so far in this run, attached to delivered messages
    pub sources: Vec<Source>,
    /// If set, only these tool names are callable in this context (case-insensitive)
    pub allowed_tools: Option<Vec<String>>,
    /// Tool names that are not callable in this context (case-insensitive)
    pub disallowed_tools: Vec<String>,
}

impl ToolContext {
    pub fn new(
        session_id: impl Into<String>,
        stream_id: impl Into<String>,
        persona_id: impl Into<String>,
        sender: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            stream_id: stream_id.into(),
            persona_id: persona_id.into(),
            sender,
            sources: Vec::new(),
            allowed_tools: None,
            disallowed_tools: Vec::new(),
        }
    }

    pub fn allows_tool(&self, tool_name: &str) -> bool {
        if self
            .disallowed_tools
            .iter()
            .any(|name| name.eq_ignore_ascii_case(tool_name))
        {
            return false;
        }

        match &self.allowed_tools {
            Some(allowed) => allowed
                .iter()
                .any(|name| name.eq_ignore_ascii_case(tool_name)),
            None => true,
        }
    }
}

/// A capability the persona can invoke on demand during its response loop.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used in function-calling (e.g., "send_message", "web_search")
    fn name(&self) -> &str;

    /// Human-readable description shown to the LLM
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    ///
    /// Used directly in OpenAI-format function definitions and validated
    /// against the call arguments before [`Tool::execute`] runs.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;

    /// Whether results of this tool are citation-worthy and should be
    /// attached as sources to the delivered response.
    fn requires_citations(&self) -> bool {
        false
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::General
    }
}

/// OpenAI-format function definition for LLM function-calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// OpenAI-format tool definition (wraps FunctionDef)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

impl ToolDef {
    fn from_tool(tool: &dyn Tool) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDef {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            },
        }
    }
}

/// A tool call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Result of a tool call, ready to feed back to the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub name: String,
    pub output: ToolOutput,
}

impl ToolCallResult {
    fn error(call: &ToolCall, message: String) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output: ToolOutput::Error(message),
        }
    }
}

/// Thread-safe registry of tools available to the persona.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool. Overwrites any existing tool with the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::info!(
            "Registered tool: {} (category: {:?})",
            name,
            tool.category()
        );
        self.tools.write().await.insert(name, tool);
    }

    /// Remove a tool by name.
    pub async fn deregister(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether the named tool produces citation-worthy results.
    pub async fn requires_citations(&self, name: &str) -> bool {
        self.get(name)
            .await
            .map(|tool| tool.requires_citations())
            .unwrap_or(false)
    }

    /// OpenAI-format definitions for every registered tool, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<ToolDef> {
        let tools = self.tools.read().await;
        let mut defs: Vec<ToolDef> = tools
            .values()
            .map(|tool| ToolDef::from_tool(tool.as_ref()))
            .collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Tool definitions filtered by execution context policy.
    pub async fn tool_definitions_for_context(&self, ctx: &ToolContext) -> Vec<ToolDef> {
        self.tool_definitions()
            .await
            .into_iter()
            .filter(|def| ctx.allows_tool(&def.function.name))
            .collect()
    }

    /// Execute a single tool call. Never returns an error: every failure mode
    /// is captured as [`ToolOutput::Error`] for this call alone.
    pub async fn execute_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        if !ctx.allows_tool(&call.name) {
            return ToolCallResult::error(
                call,
                format!("Tool '{}' is disabled for this context", call.name),
            );
        }

        let Some(tool) = self.get(&call.name).await else {
            return ToolCallResult::error(call, format!("Unknown tool: {}", call.name));
        };

        if let Err(reason) = safety::check_arguments(&call.arguments) {
            return ToolCallResult::error(call, format!("Input validation failed: {}", reason));
        }

        if let Err(reason) = schema::validate_arguments(&tool.parameters_schema(), &call.arguments)
        {
            return ToolCallResult::error(
                call,
                format!("Invalid arguments for '{}': {}", call.name, reason),
            );
        }

        let started = std::time::Instant::now();
        let outcome = AssertUnwindSafe(tool.execute(call.arguments.clone(), ctx))
            .catch_unwind()
            .await;
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => ToolOutput::Error(format!("Tool execution failed: {:#}", e)),
            Err(_) => ToolOutput::Error(format!("Tool '{}' panicked during execution", call.name)),
        };

        tracing::debug!(
            tool = %call.name,
            success = output.is_success(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tool call finished"
        );

        ToolCallResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output,
        }
    }

    /// Execute multiple tool calls sequentially; each outcome is independent.
    pub async fn execute_calls(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
    ) -> Vec<ToolCallResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute_call(call, ctx).await);
        }
        results
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
