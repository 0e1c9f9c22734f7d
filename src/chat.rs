//! Chat-side collaborators the agent depends on.
//!
//! Message, stream and persona persistence live outside this crate. The agent
//! only sees them through these traits, which the host implements against its
//! own storage and transport.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::llm_client::Message;
use crate::tools::sources::Source;

/// A message in a stream's event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamMessage {
    pub id: String,
    pub stream_id: String,
    /// Position in the stream's event log. Strictly increasing per stream.
    pub sequence: i64,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
}

impl StreamMessage {
    /// Render the message as a user turn for the model transcript.
    pub fn to_transcript_message(&self) -> Message {
        Message::user(format!("[{}]: {}", self.author_name, self.content))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    pub name: String,
}

/// System prompt and prior conversation the response loop starts from.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub system_prompt: String,
    pub history: Vec<Message>,
}

/// Probe for messages that arrived after a given sequence.
#[async_trait]
pub trait StreamEvents: Send + Sync {
    /// Messages in `stream_id` with sequence greater than `sequence`, oldest
    /// first, excluding those authored by `exclude_author_id`.
    async fn list_since(
        &self,
        stream_id: &str,
        sequence: i64,
        exclude_author_id: &str,
    ) -> Result<Vec<StreamMessage>>;
}

/// Delivers a persona message into a stream.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Returns the id of the created message.
    async fn send(
        &self,
        stream_id: &str,
        persona_id: &str,
        content: &str,
        sources: &[Source],
    ) -> Result<String>;
}

/// Lookups used for precondition checks before a session is created.
#[async_trait]
pub trait PersonaDirectory: Send + Sync {
    async fn persona(&self, persona_id: &str) -> Result<Option<Persona>>;
    async fn stream(&self, stream_id: &str) -> Result<Option<StreamInfo>>;
    async fn message(&self, message_id: &str) -> Result<Option<StreamMessage>>;
}

/// Builds the system prompt and conversation history for one invocation.
#[async_trait]
pub trait ConversationContext: Send + Sync {
    async fn build(
        &self,
        persona: &Persona,
        stream: &StreamInfo,
        trigger: &StreamMessage,
    ) -> Result<TurnContext>;
}

/// The host's chat-side implementations, bundled for wiring.
#[derive(Clone)]
pub struct ChatServices {
    pub directory: Arc<dyn PersonaDirectory>,
    pub context: Arc<dyn ConversationContext>,
    pub stream_events: Arc<dyn StreamEvents>,
    pub sender: Arc<dyn MessageSender>,
}
