//! Persona invocation entry point and the events it reports.

pub mod response_loop;

use anyhow::{Context, Result};
use flume::Sender;
use std::sync::Arc;

use crate::chat::{ChatServices, PersonaDirectory};
use crate::session::lifecycle::{RunRequest, SessionLifecycleManager};
use crate::session::SessionStatus;

pub use crate::session::lifecycle::{RunOutcome, SkipReason};

#[derive(Debug, Clone)]
pub enum AgentEvent {
    SessionStarted {
        session_id: String,
        stream_id: String,
        persona_id: String,
        resumed: bool,
    },
    Skipped {
        stream_id: String,
        trigger_message_id: String,
        reason: SkipReason,
    },
    ToolCallProgress {
        session_id: String,
        tool_name: String,
        success: bool,
        output_preview: String,
    },
    NewMessagesInjected {
        session_id: String,
        count: usize,
        watermark: i64,
    },
    MessageSent {
        session_id: String,
        message_id: String,
    },
    SessionFinished {
        session_id: String,
        status: SessionStatus,
        messages_sent: usize,
    },
}

/// Best-effort delivery to an optional observer. Never blocks.
pub(crate) fn emit_event(events: &Option<Sender<AgentEvent>>, event: AgentEvent) {
    if let Some(tx) = events {
        let _ = tx.try_send(event);
    }
}

/// Entry point for the chat-event pipeline: one call per trigger message.
pub struct PersonaAgent {
    directory: Arc<dyn PersonaDirectory>,
    lifecycle: SessionLifecycleManager,
    events: Option<Sender<AgentEvent>>,
}

impl PersonaAgent {
    pub fn new(chat: &ChatServices, lifecycle: SessionLifecycleManager) -> Self {
        Self {
            directory: chat.directory.clone(),
            lifecycle,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Sender<AgentEvent>) -> Self {
        self.lifecycle = self.lifecycle.with_events(Some(events.clone()));
        self.events = Some(events);
        self
    }

    pub fn lifecycle(&self) -> &SessionLifecycleManager {
        &self.lifecycle
    }

    /// Respond to `trigger_message_id` in `stream_id` as `persona_id`.
    ///
    /// Skips are normal outcomes. A run that fails after its session was
    /// created is reported as [`RunOutcome::Failed`]; `Err` is reserved for
    /// lookups and session writes that could not be made at all.
    pub async fn run(
        &self,
        stream_id: &str,
        trigger_message_id: &str,
        persona_id: &str,
    ) -> Result<RunOutcome> {
        let outcome = self
            .run_inner(stream_id, trigger_message_id, persona_id)
            .await?;

        if let RunOutcome::Skipped { reason, .. } = &outcome {
            tracing::info!(
                stream_id,
                trigger_message_id,
                persona_id,
                reason = reason.as_str(),
                "Persona invocation skipped"
            );
            emit_event(
                &self.events,
                AgentEvent::Skipped {
                    stream_id: stream_id.to_string(),
                    trigger_message_id: trigger_message_id.to_string(),
                    reason: *reason,
                },
            );
        }
        Ok(outcome)
    }

    async fn run_inner(
        &self,
        stream_id: &str,
        trigger_message_id: &str,
        persona_id: &str,
    ) -> Result<RunOutcome> {
        let persona = match self
            .directory
            .persona(persona_id)
            .await
            .context("Failed to load persona")?
        {
            Some(persona) if persona.active => persona,
            _ => return Ok(RunOutcome::skipped(SkipReason::PersonaInactive)),
        };

        let Some(stream) = self
            .directory
            .stream(stream_id)
            .await
            .context("Failed to load stream")?
        else {
            return Ok(RunOutcome::skipped(SkipReason::StreamNotFound));
        };

        let trigger = self
            .directory
            .message(trigger_message_id)
            .await
            .context("Failed to load trigger message")?
            .with_context(|| format!("Trigger message {} not found", trigger_message_id))?;
        if trigger.stream_id != stream.id {
            anyhow::bail!(
                "Trigger message {} belongs to stream {}, not {}",
                trigger_message_id,
                trigger.stream_id,
                stream.id
            );
        }

        self.lifecycle
            .run(&RunRequest {
                persona,
                stream,
                trigger,
            })
            .await
    }
}
