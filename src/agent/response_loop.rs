//! The agentic response loop.
//!
//! A small state machine around the model:
//!
//! ```text
//! Agent -> CheckNewMessages   -> Agent | Tools -> Agent
//!       -> CheckFinalMessages -> Agent | Synthesize -> EnsureResponse -> End
//!                                      | EnsureResponse -> End
//! ```
//!
//! Between a model turn and acting on it the loop probes the stream for
//! messages that arrived in the meantime. When there are any, they are added
//! to the transcript and the model re-plans before anything else happens.

use anyhow::{Context, Result};
use async_trait::async_trait;
use flume::Sender;
use serde_json::json;
use std::sync::Arc;

use crate::chat::StreamMessage;
use crate::config::AgentConfig;
use crate::llm_client::{Message, ModelClient};
use crate::tools::safety;
use crate::tools::send_message::SEND_MESSAGE_TOOL;
use crate::tools::sources::{extract_sources, Source, SourceCollector};
use crate::tools::{ToolCall, ToolCallResult, ToolContext, ToolOutput, ToolRegistry};

use super::{emit_event, AgentEvent};

const NOT_EXECUTED_RESULT: &str =
    "[NOT EXECUTED] New messages arrived before this call ran. Re-plan with them in mind.";

/// Hooks the loop uses to observe the stream and persist progress.
#[async_trait]
pub trait SessionCallbacks: Send + Sync {
    /// Messages after `sequence` not authored by the persona, oldest first.
    async fn new_messages_since(&self, sequence: i64) -> Result<Vec<StreamMessage>>;

    /// Durably record the watermark.
    async fn persist_watermark(&self, sequence: i64) -> Result<()>;

    /// Durably record a delivered message as soon as it is sent.
    async fn record_sent_message(&self, message_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    /// Model calls per run.
    pub max_iterations: usize,
    /// Successful sends per session, counting earlier attempts.
    pub max_messages: usize,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_messages: 5,
        }
    }
}

impl LoopLimits {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_iterations: config.max_iterations.max(1),
            max_messages: config.max_messages,
        }
    }
}

/// Starting point for one run.
#[derive(Debug, Clone)]
pub struct LoopInput {
    pub system_prompt: String,
    /// Prior conversation, ending with the trigger message.
    pub history: Vec<Message>,
    /// Watermark the run starts from.
    pub last_seen_sequence: i64,
    /// Messages earlier attempts at this session already delivered.
    pub previously_sent: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopOutcome {
    /// Delivered by this run.
    pub messages_sent: usize,
    pub sent_message_ids: Vec<String>,
    pub last_processed_sequence: i64,
    pub iterations: usize,
    pub hit_iteration_limit: bool,
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Agent,
    CheckNewMessages,
    CheckFinalMessages,
    Tools,
    Synthesize,
    EnsureResponse,
    End,
}

struct LoopState {
    messages: Vec<Message>,
    iteration: usize,
    previously_sent: usize,
    messages_sent: usize,
    sent_message_ids: Vec<String>,
    last_processed_sequence: i64,
    pending_final_response: Option<String>,
    pending_tool_calls: Vec<ToolCall>,
    collected_sources: SourceCollector,
    used_citation_tool: bool,
    hit_iteration_limit: bool,
}

impl LoopState {
    fn record_sent(&mut self, message_id: &str) {
        self.messages_sent += 1;
        self.sent_message_ids.push(message_id.to_string());
    }

    fn session_sends(&self) -> usize {
        self.previously_sent + self.messages_sent
    }
}

pub struct ResponseLoop {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    limits: LoopLimits,
    events: Option<Sender<AgentEvent>>,
}

impl ResponseLoop {
    pub fn new(model: Arc<dyn ModelClient>, tools: Arc<ToolRegistry>, limits: LoopLimits) -> Self {
        Self {
            model,
            tools,
            limits,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<Sender<AgentEvent>>) -> Self {
        self.events = events;
        self
    }

    pub fn limits(&self) -> LoopLimits {
        self.limits
    }

    /// Drive the loop to completion.
    ///
    /// Tool failures are fed back to the model. Model-call and probe failures
    /// end the run with an error, as do a forced delivery that could not be
    /// made and a session write rejected because the session changed hands.
    pub async fn run(
        &self,
        input: LoopInput,
        mut ctx: ToolContext,
        callbacks: &dyn SessionCallbacks,
    ) -> Result<LoopOutcome> {
        let mut state = LoopState {
            messages: input.history,
            iteration: 0,
            previously_sent: input.previously_sent,
            messages_sent: 0,
            sent_message_ids: Vec::new(),
            last_processed_sequence: input.last_seen_sequence,
            pending_final_response: None,
            pending_tool_calls: Vec::new(),
            collected_sources: SourceCollector::new(),
            used_citation_tool: false,
            hit_iteration_limit: false,
        };

        let mut step = Step::Agent;
        while step != Step::End {
            tracing::trace!(session_id = %ctx.session_id, ?step, "Response loop step");
            step = match step {
                Step::Agent => {
                    self.agent_step(&input.system_prompt, &mut state, &ctx)
                        .await?
                }
                Step::CheckNewMessages => {
                    if self.probe_new_messages(&mut state, &ctx, callbacks).await? {
                        Step::Agent
                    } else {
                        Step::Tools
                    }
                }
                Step::CheckFinalMessages => {
                    if self.probe_new_messages(&mut state, &ctx, callbacks).await? {
                        Step::Agent
                    } else {
                        finalize_step(&state)
                    }
                }
                Step::Tools => {
                    self.tools_step(&mut state, &mut ctx, callbacks).await?;
                    Step::Agent
                }
                Step::Synthesize => {
                    // Sources ride along as metadata on the delivered message.
                    if !state.collected_sources.is_empty() {
                        ctx.sources = state.collected_sources.as_slice().to_vec();
                        tracing::debug!(
                            session_id = %ctx.session_id,
                            sources = state.collected_sources.len(),
                            "Synthesized citation sources"
                        );
                    }
                    Step::EnsureResponse
                }
                Step::EnsureResponse => {
                    self.ensure_response(&mut state, &ctx, callbacks).await?;
                    Step::End
                }
                Step::End => Step::End,
            };
        }

        tracing::debug!(
            session_id = %ctx.session_id,
            iterations = state.iteration,
            messages_sent = state.messages_sent,
            hit_limit = state.hit_iteration_limit,
            "Response loop finished"
        );

        Ok(LoopOutcome {
            messages_sent: state.messages_sent,
            sent_message_ids: state.sent_message_ids,
            last_processed_sequence: state.last_processed_sequence,
            iterations: state.iteration,
            hit_iteration_limit: state.hit_iteration_limit,
            sources: state.collected_sources.as_slice().to_vec(),
        })
    }

    async fn agent_step(
        &self,
        system_prompt: &str,
        state: &mut LoopState,
        ctx: &ToolContext,
    ) -> Result<Step> {
        if state.iteration >= self.limits.max_iterations {
            tracing::warn!(
                session_id = %ctx.session_id,
                "Response loop hit iteration limit ({})",
                self.limits.max_iterations
            );
            state.hit_iteration_limit = true;
            state.pending_tool_calls.clear();
            return Ok(finalize_step(state));
        }

        state.iteration += 1;
        tracing::debug!(
            session_id = %ctx.session_id,
            iteration = state.iteration,
            "Response loop iteration, calling model"
        );

        let tool_defs = self.tools.tool_definitions_for_context(ctx).await;
        let turn = self
            .model
            .complete_turn(system_prompt, &state.messages, &tool_defs)
            .await
            .context("Model call failed in response loop")?;

        state.messages.push(turn.to_message());
        if let Some(text) = turn.text.as_deref().map(str::trim) {
            if !text.is_empty() {
                state.pending_final_response = Some(text.to_string());
            }
        }

        if turn.tool_calls.is_empty() {
            Ok(Step::CheckFinalMessages)
        } else {
            tracing::debug!(
                session_id = %ctx.session_id,
                "Model requested {} tool call(s)",
                turn.tool_calls.len()
            );
            state.pending_tool_calls = turn.tool_calls;
            Ok(Step::CheckNewMessages)
        }
    }

    /// Returns true when new messages were found and injected.
    async fn probe_new_messages(
        &self,
        state: &mut LoopState,
        ctx: &ToolContext,
        callbacks: &dyn SessionCallbacks,
    ) -> Result<bool> {
        let mut new_messages: Vec<StreamMessage> = callbacks
            .new_messages_since(state.last_processed_sequence)
            .await
            .context("Failed to check stream for new messages")?
            .into_iter()
            .filter(|msg| msg.sequence > state.last_processed_sequence)
            .collect();
        if new_messages.is_empty() {
            return Ok(false);
        }
        new_messages.sort_by_key(|msg| msg.sequence);

        let watermark = new_messages
            .iter()
            .map(|msg| msg.sequence)
            .max()
            .unwrap_or(state.last_processed_sequence);

        // The watermark is persisted before the model has seen these messages.
        // A crash before the next model call leaves them marked as seen for
        // this session; the alternative is reprocessing them on resume.
        state.last_processed_sequence = watermark;
        callbacks
            .persist_watermark(watermark)
            .await
            .context("Failed to persist watermark")?;

        // Requested calls are answered so every tool_call_id has a result.
        for call in state.pending_tool_calls.drain(..) {
            state
                .messages
                .push(Message::tool_result(call.id, NOT_EXECUTED_RESULT));
        }
        state
            .messages
            .extend(new_messages.iter().map(StreamMessage::to_transcript_message));

        tracing::info!(
            session_id = %ctx.session_id,
            count = new_messages.len(),
            watermark,
            "Injected new stream messages into transcript"
        );
        emit_event(
            &self.events,
            AgentEvent::NewMessagesInjected {
                session_id: ctx.session_id.clone(),
                count: new_messages.len(),
                watermark,
            },
        );
        Ok(true)
    }

    /// Only a failure to record a delivered message escapes; tool failures
    /// become tool results.
    async fn tools_step(
        &self,
        state: &mut LoopState,
        ctx: &mut ToolContext,
        callbacks: &dyn SessionCallbacks,
    ) -> Result<()> {
        let calls = std::mem::take(&mut state.pending_tool_calls);
        for call in calls {
            let result = if call.name == SEND_MESSAGE_TOOL
                && state.session_sends() >= self.limits.max_messages
            {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    "send_message refused: limit of {} messages reached",
                    self.limits.max_messages
                );
                ToolCallResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    output: ToolOutput::Error(format!(
                        "Message limit reached: at most {} messages can be sent per session",
                        self.limits.max_messages
                    )),
                }
            } else {
                self.tools.execute_call(&call, ctx).await
            };

            if let ToolOutput::Sent { message_id } = &result.output {
                self.delivered(state, ctx, callbacks, message_id).await?;
            }

            if self.tools.requires_citations(&call.name).await {
                state.used_citation_tool = true;
                if let ToolOutput::Json(value) = &result.output {
                    let added = state.collected_sources.extend(extract_sources(value));
                    if added > 0 {
                        // Later sends in this run carry what has been found so far.
                        ctx.sources = state.collected_sources.as_slice().to_vec();
                    }
                }
            }

            let content = match &result.output {
                ToolOutput::Text(_) | ToolOutput::Json(_) => {
                    safety::prepare_tool_output(&call.name, &result.output.to_llm_string())
                }
                other => other.to_llm_string(),
            };

            emit_event(
                &self.events,
                AgentEvent::ToolCallProgress {
                    session_id: ctx.session_id.clone(),
                    tool_name: call.name.clone(),
                    success: result.output.is_success(),
                    output_preview: preview(&content),
                },
            );
            state.messages.push(Message::tool_result(call.id, content));
        }
        Ok(())
    }

    async fn delivered(
        &self,
        state: &mut LoopState,
        ctx: &ToolContext,
        callbacks: &dyn SessionCallbacks,
        message_id: &str,
    ) -> Result<()> {
        state.record_sent(message_id);
        emit_event(
            &self.events,
            AgentEvent::MessageSent {
                session_id: ctx.session_id.clone(),
                message_id: message_id.to_string(),
            },
        );
        callbacks
            .record_sent_message(message_id)
            .await
            .context("Failed to record sent message")
    }

    async fn ensure_response(
        &self,
        state: &mut LoopState,
        ctx: &ToolContext,
        callbacks: &dyn SessionCallbacks,
    ) -> Result<()> {
        if state.messages_sent > 0 {
            return Ok(());
        }
        let Some(text) = state.pending_final_response.take() else {
            tracing::debug!(session_id = %ctx.session_id, "Nothing to deliver");
            return Ok(());
        };
        if state.session_sends() >= self.limits.max_messages {
            tracing::warn!(
                session_id = %ctx.session_id,
                "Pending response dropped: session already sent {} messages",
                state.session_sends()
            );
            return Ok(());
        }

        let call = ToolCall {
            id: "ensure_response".to_string(),
            name: SEND_MESSAGE_TOOL.to_string(),
            arguments: json!({ "content": text }),
        };
        let result = self.tools.execute_call(&call, ctx).await;
        match result.output {
            ToolOutput::Sent { message_id } => {
                tracing::debug!(
                    session_id = %ctx.session_id,
                    message_id = %message_id,
                    "Delivered pending response"
                );
                self.delivered(state, ctx, callbacks, &message_id).await
            }
            other => anyhow::bail!(
                "Failed to deliver pending response: {}",
                other.to_llm_string()
            ),
        }
    }
}

fn finalize_step(state: &LoopState) -> Step {
    if state.used_citation_tool {
        Step::Synthesize
    } else {
        Step::EnsureResponse
    }
}

fn preview(content: &str) -> String {
    const MAX_PREVIEW_CHARS: usize = 200;
    if content.chars().count() <= MAX_PREVIEW_CHARS {
        return content.to_string();
    }
    let mut out: String = content.chars().take(MAX_PREVIEW_CHARS).collect();
    out.push_str("...");
    out
}
