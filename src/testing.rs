//! In-memory collaborators for tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

use crate::chat::{
    ChatServices, ConversationContext, MessageSender, Persona, PersonaDirectory, StreamEvents,
    StreamInfo, StreamMessage, TurnContext,
};
use crate::llm_client::{AssistantTurn, Message, ModelClient};
use crate::tools::search::{SearchProvider, SearchResult};
use crate::tools::sources::Source;
use crate::tools::{ToolCall, ToolDef};

static NEXT_CALL_ID: AtomicUsize = AtomicUsize::new(1);

pub fn tool_call(name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: format!("call_{}", NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed)),
        name: name.to_string(),
        arguments,
    }
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: String,
    pub stream_id: String,
    pub persona_id: String,
    pub content: String,
    pub sources: Vec<Source>,
}

#[derive(Default)]
struct ChatState {
    personas: HashMap<String, Persona>,
    streams: HashMap<String, StreamInfo>,
    log: Vec<StreamMessage>,
    sent: Vec<SentMessage>,
    next_sequence: i64,
    fail_sends: bool,
}

/// A single-process chat: personas, streams and an append-only message log.
/// Persona `p1` and stream `s1` exist from the start.
pub struct InMemoryChat {
    state: Mutex<ChatState>,
}

impl InMemoryChat {
    pub fn new() -> Self {
        let chat = Self {
            state: Mutex::new(ChatState::default()),
        };
        chat.add_persona("p1", "Pip", true);
        chat.add_stream("s1", "general");
        chat
    }

    /// A chat whose stream already holds `message_id` from user `kim`.
    pub fn with_trigger(stream_id: &str, message_id: &str, content: &str) -> Self {
        let chat = Self::new();
        chat.add_stream(stream_id, stream_id);
        chat.push_message_with_id(stream_id, message_id, "u1", "kim", content);
        chat
    }

    pub fn services(self: &Arc<Self>) -> ChatServices {
        ChatServices {
            directory: self.clone(),
            context: self.clone(),
            stream_events: self.clone(),
            sender: self.clone(),
        }
    }

    pub fn add_persona(&self, id: &str, name: &str, active: bool) {
        self.state.lock().unwrap().personas.insert(
            id.to_string(),
            Persona {
                id: id.to_string(),
                name: name.to_string(),
                active,
            },
        );
    }

    pub fn add_stream(&self, id: &str, name: &str) {
        self.state.lock().unwrap().streams.insert(
            id.to_string(),
            StreamInfo {
                id: id.to_string(),
                name: name.to_string(),
            },
        );
    }

    pub fn push_message(
        &self,
        stream_id: &str,
        author_id: &str,
        author_name: &str,
        content: &str,
    ) -> StreamMessage {
        let id = format!("msg-{}", uuid::Uuid::new_v4());
        self.push_message_with_id(stream_id, &id, author_id, author_name, content)
    }

    pub fn push_message_with_id(
        &self,
        stream_id: &str,
        message_id: &str,
        author_id: &str,
        author_name: &str,
        content: &str,
    ) -> StreamMessage {
        let mut state = self.state.lock().unwrap();
        state.next_sequence += 1;
        let message = StreamMessage {
            id: message_id.to_string(),
            stream_id: stream_id.to_string(),
            sequence: state.next_sequence,
            author_id: author_id.to_string(),
            author_name: author_name.to_string(),
            content: content.to_string(),
        };
        state.log.push(message.clone());
        message
    }

    pub fn latest_sequence(&self, stream_id: &str) -> i64 {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|msg| msg.stream_id == stream_id)
            .map(|msg| msg.sequence)
            .max()
            .unwrap_or(0)
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }
}

impl Default for InMemoryChat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamEvents for InMemoryChat {
    async fn list_since(
        &self,
        stream_id: &str,
        sequence: i64,
        exclude_author_id: &str,
    ) -> Result<Vec<StreamMessage>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|msg| {
                msg.stream_id == stream_id
                    && msg.sequence > sequence
                    && msg.author_id != exclude_author_id
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MessageSender for InMemoryChat {
    async fn send(
        &self,
        stream_id: &str,
        persona_id: &str,
        content: &str,
        sources: &[Source],
    ) -> Result<String> {
        if self.state.lock().unwrap().fail_sends {
            return Err(anyhow!("chat backend unavailable"));
        }
        let persona_name = self
            .state
            .lock()
            .unwrap()
            .personas
            .get(persona_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| persona_id.to_string());
        let message = self.push_message(stream_id, persona_id, &persona_name, content);
        self.state.lock().unwrap().sent.push(SentMessage {
            id: message.id.clone(),
            stream_id: stream_id.to_string(),
            persona_id: persona_id.to_string(),
            content: content.to_string(),
            sources: sources.to_vec(),
        });
        Ok(message.id)
    }
}

#[async_trait]
impl PersonaDirectory for InMemoryChat {
    async fn persona(&self, persona_id: &str) -> Result<Option<Persona>> {
        Ok(self.state.lock().unwrap().personas.get(persona_id).cloned())
    }

    async fn stream(&self, stream_id: &str) -> Result<Option<StreamInfo>> {
        Ok(self.state.lock().unwrap().streams.get(stream_id).cloned())
    }

    async fn message(&self, message_id: &str) -> Result<Option<StreamMessage>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .log
            .iter()
            .find(|msg| msg.id == message_id)
            .cloned())
    }
}

#[async_trait]
impl ConversationContext for InMemoryChat {
    async fn build(
        &self,
        persona: &Persona,
        stream: &StreamInfo,
        trigger: &StreamMessage,
    ) -> Result<TurnContext> {
        let history = self
            .state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|msg| msg.stream_id == stream.id && msg.sequence <= trigger.sequence)
            .map(|msg| {
                if msg.author_id == persona.id {
                    Message::assistant(msg.content.clone())
                } else {
                    msg.to_transcript_message()
                }
            })
            .collect();
        Ok(TurnContext {
            system_prompt: format!("You are {}, chatting in #{}.", persona.name, stream.name),
            history,
        })
    }
}

type CallHook = Box<dyn FnOnce() + Send>;

/// Model stub that plays back a script of turns and records what it saw.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<AssistantTurn, String>>>,
    repeat: Option<AssistantTurn>,
    transcripts: Mutex<Vec<Vec<Message>>>,
    hooks: Mutex<HashMap<usize, CallHook>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn with_script(script: Vec<Result<AssistantTurn, String>>, repeat: Option<AssistantTurn>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat,
            transcripts: Mutex::new(Vec::new()),
            hooks: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn new(turns: Vec<AssistantTurn>) -> Self {
        Self::with_script(turns.into_iter().map(Ok).collect(), None)
    }

    /// Returns the same turn forever.
    pub fn repeating(turn: AssistantTurn) -> Self {
        Self::with_script(Vec::new(), Some(turn))
    }

    /// Every call fails with `error`.
    pub fn failing(error: &str) -> Self {
        Self::with_script(vec![Err(error.to_string())], None)
    }

    /// Run `hook` while call number `call` (1-based) is in flight.
    pub fn on_call(&self, call: usize, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().unwrap().insert(call, Box::new(hook));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn transcripts(&self) -> Vec<Vec<Message>> {
        self.transcripts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete_turn(
        &self,
        _system_prompt: &str,
        transcript: &[Message],
        _tools: &[ToolDef],
    ) -> Result<AssistantTurn> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.transcripts.lock().unwrap().push(transcript.to_vec());

        let hook = self.hooks.lock().unwrap().remove(&call);
        if let Some(hook) = hook {
            hook();
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(turn)) => Ok(turn),
            Some(Err(error)) => {
                // A failing script keeps failing.
                self.script.lock().unwrap().push_front(Err(error.clone()));
                Err(anyhow!(error))
            }
            None => self
                .repeat
                .clone()
                .ok_or_else(|| anyhow!("scripted model exhausted after {} calls", call - 1)),
        }
    }
}

/// Model that blocks each call until released, for holding a session open.
pub struct GatedModel {
    turn: AssistantTurn,
    started: Notify,
    gate: Semaphore,
}

impl GatedModel {
    pub fn new(turn: AssistantTurn) -> Self {
        Self {
            turn,
            started: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    pub async fn wait_until_called(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl ModelClient for GatedModel {
    async fn complete_turn(
        &self,
        _system_prompt: &str,
        _transcript: &[Message],
        _tools: &[ToolDef],
    ) -> Result<AssistantTurn> {
        self.started.notify_one();
        let _permit = self.gate.acquire().await?;
        Ok(self.turn.clone())
    }
}

/// Search provider with a fixed result list.
pub struct StaticSearch {
    results: Vec<SearchResult>,
}

impl StaticSearch {
    pub fn new(entries: Vec<(&str, &str)>) -> Self {
        Self {
            results: entries
                .into_iter()
                .map(|(title, url)| SearchResult {
                    title: title.to_string(),
                    url: url.to_string(),
                    snippet: String::new(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl SearchProvider for StaticSearch {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        Ok(self.results.iter().take(limit).cloned().collect())
    }
}
