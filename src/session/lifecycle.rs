//! Three-phase session protocol around one response loop run.
//!
//! 1. Setup: find or create the session. Short-lived store access only.
//! 2. Run: heartbeat ticker plus the response loop. No store connection is
//!    held while the model works; the loop touches the store only through its
//!    callbacks, one short operation at a time.
//! 3. Finalize: one write to `Completed`, or a transition to `Failed`.
//!
//! A crash between 1 and 3 leaves a `Running` row whose heartbeat goes stale;
//! the recovery sweep reclaims it. Every write after setup goes through the
//! attempt's lease, so a run that was reclaimed meanwhile finds out at its next
//! write and leaves the row to its new owner.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use flume::Sender;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::response_loop::{LoopInput, LoopOutcome, ResponseLoop, SessionCallbacks};
use crate::agent::{emit_event, AgentEvent};
use crate::chat::{
    ChatServices, ConversationContext, MessageSender, Persona, StreamEvents, StreamInfo,
    StreamMessage,
};
use crate::config::AgentConfig;
use crate::tools::ToolContext;

use super::heartbeat::HeartbeatHandle;
use super::{
    is_lease_lost, AgentSession, NewSession, SessionCompletion, SessionLease, SessionStatus,
    SessionStore,
};

/// Why an invocation did nothing. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    AlreadyRunning,
    AlreadyCompleted,
    PersonaInactive,
    StreamNotFound,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::AlreadyRunning => "already running for stream",
            SkipReason::AlreadyCompleted => "already completed",
            SkipReason::PersonaInactive => "persona inactive",
            SkipReason::StreamNotFound => "stream not found",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Skipped {
        reason: SkipReason,
        /// The session that caused the skip, when one is known.
        session_id: Option<String>,
    },
    Completed {
        session_id: String,
        messages_sent: usize,
        sent_message_ids: Vec<String>,
        last_seen_sequence: i64,
    },
    /// The run itself failed. Messages sent before the failure stay sent.
    Failed { session_id: String, error: String },
}

impl RunOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        RunOutcome::Skipped {
            reason,
            session_id: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            RunOutcome::Skipped { session_id, .. } => session_id.as_deref(),
            RunOutcome::Completed { session_id, .. } | RunOutcome::Failed { session_id, .. } => {
                Some(session_id)
            }
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            RunOutcome::Skipped { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// What to respond to.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub persona: Persona,
    pub stream: StreamInfo,
    pub trigger: StreamMessage,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub server_id: String,
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a `Running` session counts as orphaned.
    pub stale_after: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            server_id: config.server_id.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            stale_after: config.stale_after(),
        }
    }
}

enum Setup {
    Ready { session: AgentSession, resumed: bool },
    Skip(RunOutcome),
}

/// Loop callbacks bound to one attempt at a session.
struct LifecycleCallbacks {
    store: Arc<dyn SessionStore>,
    stream_events: Arc<dyn StreamEvents>,
    lease: SessionLease,
    stream_id: String,
    persona_id: String,
    /// Delivered by this attempt, including any whose record write failed.
    delivered: Mutex<Vec<String>>,
}

impl LifecycleCallbacks {
    fn delivered_count(&self) -> usize {
        self.delivered.lock().map(|ids| ids.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SessionCallbacks for LifecycleCallbacks {
    async fn new_messages_since(&self, sequence: i64) -> Result<Vec<StreamMessage>> {
        self.stream_events
            .list_since(&self.stream_id, sequence, &self.persona_id)
            .await
    }

    async fn persist_watermark(&self, sequence: i64) -> Result<()> {
        self.store
            .update_last_seen_sequence(&self.lease, sequence)
            .await
    }

    async fn record_sent_message(&self, message_id: &str) -> Result<()> {
        if let Ok(mut ids) = self.delivered.lock() {
            ids.push(message_id.to_string());
        }
        self.store.record_sent_message(&self.lease, message_id).await
    }
}

pub struct SessionLifecycleManager {
    store: Arc<dyn SessionStore>,
    response_loop: ResponseLoop,
    context: Arc<dyn ConversationContext>,
    stream_events: Arc<dyn StreamEvents>,
    sender: Arc<dyn MessageSender>,
    settings: LifecycleSettings,
    events: Option<Sender<AgentEvent>>,
}

impl SessionLifecycleManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        response_loop: ResponseLoop,
        chat: &ChatServices,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            response_loop,
            context: chat.context.clone(),
            stream_events: chat.stream_events.clone(),
            sender: chat.sender.clone(),
            settings,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<Sender<AgentEvent>>) -> Self {
        self.response_loop = self.response_loop.with_events(events.clone());
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Run all three phases. Errors only escape when the store fails during
    /// setup or finalization, or when the session was taken over by another
    /// attempt mid-run; run failures come back as [`RunOutcome::Failed`].
    pub async fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        let (session, resumed) = match self.setup(request).await? {
            Setup::Ready { session, resumed } => (session, resumed),
            Setup::Skip(outcome) => return Ok(outcome),
        };

        tracing::info!(
            session_id = %session.id,
            stream_id = %session.stream_id,
            trigger_message_id = %session.trigger_message_id,
            resumed,
            "Agent session started"
        );
        emit_event(
            &self.events,
            AgentEvent::SessionStarted {
                session_id: session.id.clone(),
                stream_id: session.stream_id.clone(),
                persona_id: session.persona_id.clone(),
                resumed,
            },
        );

        let callbacks = LifecycleCallbacks {
            store: self.store.clone(),
            stream_events: self.stream_events.clone(),
            lease: session.lease(),
            stream_id: session.stream_id.clone(),
            persona_id: session.persona_id.clone(),
            delivered: Mutex::new(Vec::new()),
        };
        let heartbeat = HeartbeatHandle::start(
            self.store.clone(),
            session.lease(),
            self.settings.heartbeat_interval,
        );
        let result = self.execute(&session, request, &callbacks).await;
        heartbeat.stop().await;

        match result {
            Ok(outcome) => self.complete(&session, outcome).await,
            Err(e) => self.fail(&session, e, callbacks.delivered_count()).await,
        }
    }

    async fn setup(&self, request: &RunRequest) -> Result<Setup> {
        let trigger = &request.trigger;

        if let Some(existing) = self
            .store
            .find_by_trigger_message(&trigger.id)
            .await
            .context("Failed to look up session for trigger")?
        {
            let skip = |reason| {
                Setup::Skip(RunOutcome::Skipped {
                    reason,
                    session_id: Some(existing.id.clone()),
                })
            };

            match existing.status {
                SessionStatus::Completed => return Ok(skip(SkipReason::AlreadyCompleted)),
                SessionStatus::Running
                    if !existing.is_orphaned(Utc::now(), self.settings.stale_after) =>
                {
                    return Ok(skip(SkipReason::AlreadyRunning));
                }
                _ => {}
            }

            tracing::info!(
                session_id = %existing.id,
                previous_status = existing.status.as_db_str(),
                "Resuming agent session"
            );
            return match self
                .store
                .resume(&existing.id, &self.settings.server_id)
                .await
                .context("Failed to resume agent session")?
            {
                Some(session) => Ok(Setup::Ready {
                    session,
                    resumed: true,
                }),
                None => Ok(skip(SkipReason::AlreadyRunning)),
            };
        }

        let created = self
            .store
            .insert_running_or_skip(NewSession {
                trigger_message_id: trigger.id.clone(),
                stream_id: request.stream.id.clone(),
                persona_id: request.persona.id.clone(),
                server_id: self.settings.server_id.clone(),
                last_seen_sequence: trigger.sequence,
            })
            .await
            .context("Failed to create agent session")?;

        match created {
            Some(session) => Ok(Setup::Ready {
                session,
                resumed: false,
            }),
            None => {
                tracing::debug!(
                    stream_id = %request.stream.id,
                    trigger_message_id = %trigger.id,
                    "Another session is running for this stream"
                );
                Ok(Setup::Skip(RunOutcome::skipped(SkipReason::AlreadyRunning)))
            }
        }
    }

    async fn execute(
        &self,
        session: &AgentSession,
        request: &RunRequest,
        callbacks: &LifecycleCallbacks,
    ) -> Result<LoopOutcome> {
        let turn = self
            .context
            .build(&request.persona, &request.stream, &request.trigger)
            .await
            .context("Failed to build conversation context")?;

        let ctx = ToolContext::new(
            session.id.clone(),
            session.stream_id.clone(),
            session.persona_id.clone(),
            self.sender.clone(),
        );
        let input = LoopInput {
            system_prompt: turn.system_prompt,
            history: turn.history,
            last_seen_sequence: session.last_seen_sequence,
            previously_sent: session.sent_message_ids.len(),
        };

        self.response_loop.run(input, ctx, callbacks).await
    }

    async fn complete(&self, session: &AgentSession, outcome: LoopOutcome) -> Result<RunOutcome> {
        // A resumed session keeps what it delivered before.
        let mut sent_message_ids = session.sent_message_ids.clone();
        sent_message_ids.extend(outcome.sent_message_ids.iter().cloned());
        let last_seen_sequence = outcome
            .last_processed_sequence
            .max(session.last_seen_sequence);
        let completion = SessionCompletion {
            last_seen_sequence,
            response_message_id: session
                .response_message_id
                .clone()
                .or_else(|| sent_message_ids.first().cloned()),
            sent_message_ids: sent_message_ids.clone(),
        };

        if let Err(e) = self
            .store
            .complete_session(&session.lease(), &completion)
            .await
        {
            log_finalize_error(session, "completed", &e);
            return Err(e.context(format!("Failed to complete session {}", session.id)));
        }

        tracing::info!(
            session_id = %session.id,
            messages_sent = outcome.messages_sent,
            last_seen_sequence,
            iterations = outcome.iterations,
            "Agent session completed"
        );
        emit_event(
            &self.events,
            AgentEvent::SessionFinished {
                session_id: session.id.clone(),
                status: SessionStatus::Completed,
                messages_sent: outcome.messages_sent,
            },
        );

        Ok(RunOutcome::Completed {
            session_id: session.id.clone(),
            messages_sent: outcome.messages_sent,
            sent_message_ids,
            last_seen_sequence,
        })
    }

    async fn fail(
        &self,
        session: &AgentSession,
        error: anyhow::Error,
        messages_sent: usize,
    ) -> Result<RunOutcome> {
        if is_lease_lost(&error) {
            log_finalize_error(session, "failed", &error);
            return Err(error.context(format!("Session {} was taken over", session.id)));
        }

        let error = format!("{:#}", error);
        tracing::error!(
            session_id = %session.id,
            messages_sent,
            "Agent session failed: {}",
            error
        );

        if let Err(e) = self
            .store
            .update_status(&session.lease(), SessionStatus::Failed, Some(&error))
            .await
        {
            log_finalize_error(session, "failed", &e);
            return Err(e.context(format!("Failed to mark session {} failed", session.id)));
        }

        emit_event(
            &self.events,
            AgentEvent::SessionFinished {
                session_id: session.id.clone(),
                status: SessionStatus::Failed,
                messages_sent,
            },
        );

        Ok(RunOutcome::Failed {
            session_id: session.id.clone(),
            error,
        })
    }
}

fn log_finalize_error(session: &AgentSession, status: &str, error: &anyhow::Error) {
    if is_lease_lost(error) {
        tracing::warn!(
            session_id = %session.id,
            "Session was taken over by another attempt, not marking it {}: {:#}",
            status,
            error
        );
    } else {
        tracing::error!(
            session_id = %session.id,
            "Failed to mark session {}, leaving it for orphan recovery: {:#}",
            status,
            error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::response_loop::LoopLimits;
    use crate::agent::PersonaAgent;
    use crate::llm_client::{AssistantTurn, ModelClient};
    use crate::session::SqliteSessionStore;
    use crate::testing::{tool_call, GatedModel, InMemoryChat, ScriptedModel};
    use crate::tools::send_message::{SendMessageTool, SEND_MESSAGE_TOOL};
    use crate::tools::ToolRegistry;
    use chrono::DateTime;
    use serde_json::json;
    use tempfile::TempDir;

    /// Delegates to SQLite but every commit write fails.
    struct CommitFailsStore {
        inner: Arc<SqliteSessionStore>,
    }

    #[async_trait]
    impl SessionStore for CommitFailsStore {
        async fn find_by_trigger_message(&self, id: &str) -> Result<Option<AgentSession>> {
            self.inner.find_by_trigger_message(id).await
        }

        async fn get(&self, session_id: &str) -> Result<Option<AgentSession>> {
            self.inner.get(session_id).await
        }

        async fn insert_running_or_skip(
            &self,
            new_session: NewSession,
        ) -> Result<Option<AgentSession>> {
            self.inner.insert_running_or_skip(new_session).await
        }

        async fn resume(&self, session_id: &str, server_id: &str) -> Result<Option<AgentSession>> {
            self.inner.resume(session_id, server_id).await
        }

        async fn update_status(
            &self,
            lease: &SessionLease,
            status: SessionStatus,
            error: Option<&str>,
        ) -> Result<()> {
            self.inner.update_status(lease, status, error).await
        }

        async fn update_heartbeat(&self, lease: &SessionLease) -> Result<()> {
            self.inner.update_heartbeat(lease).await
        }

        async fn update_last_seen_sequence(
            &self,
            lease: &SessionLease,
            sequence: i64,
        ) -> Result<()> {
            self.inner.update_last_seen_sequence(lease, sequence).await
        }

        async fn record_sent_message(&self, lease: &SessionLease, message_id: &str) -> Result<()> {
            self.inner.record_sent_message(lease, message_id).await
        }

        async fn complete_session(
            &self,
            _lease: &SessionLease,
            _completion: &SessionCompletion,
        ) -> Result<()> {
            Err(anyhow::anyhow!("disk I/O error"))
        }

        async fn fail_orphaned_sessions(&self, stale_before: DateTime<Utc>) -> Result<Vec<String>> {
            self.inner.fail_orphaned_sessions(stale_before).await
        }

        async fn list_for_stream(&self, stream_id: &str, limit: usize) -> Result<Vec<AgentSession>> {
            self.inner.list_for_stream(stream_id, limit).await
        }
    }

    fn burst_of_sends(label: &str) -> AssistantTurn {
        AssistantTurn::with_tool_calls(
            None,
            (0..5)
                .map(|i| tool_call(SEND_MESSAGE_TOOL, json!({"content": format!("{} {}", label, i)})))
                .collect(),
        )
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<SqliteSessionStore>,
        chat: Arc<InMemoryChat>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().expect("temp dir");
            let store = Arc::new(
                SqliteSessionStore::open(dir.path().join("sessions.db"), 2).expect("db init"),
            );
            Self {
                _dir: dir,
                store,
                chat: Arc::new(InMemoryChat::with_trigger("s1", "m1", "hi there")),
            }
        }

        async fn manager(&self, model: Arc<dyn ModelClient>) -> SessionLifecycleManager {
            self.manager_on(self.store.clone(), model, Duration::from_secs(15))
                .await
        }

        async fn manager_on(
            &self,
            store: Arc<dyn SessionStore>,
            model: Arc<dyn ModelClient>,
            heartbeat_interval: Duration,
        ) -> SessionLifecycleManager {
            let registry = Arc::new(ToolRegistry::new());
            registry.register(Arc::new(SendMessageTool::new())).await;
            SessionLifecycleManager::new(
                store,
                ResponseLoop::new(model, registry, LoopLimits::default()),
                &self.chat.services(),
                LifecycleSettings {
                    server_id: "worker-a".to_string(),
                    heartbeat_interval,
                    stale_after: Duration::from_secs(60),
                },
            )
        }

        async fn request(&self, trigger_id: &str) -> RunRequest {
            use crate::chat::PersonaDirectory;
            RunRequest {
                persona: self.chat.persona("p1").await.unwrap().unwrap(),
                stream: self.chat.stream("s1").await.unwrap().unwrap(),
                trigger: self.chat.message(trigger_id).await.unwrap().unwrap(),
            }
        }
    }

    #[tokio::test]
    async fn completes_and_records_watermark_and_messages() {
        let harness = Harness::new();
        let manager = harness
            .manager(Arc::new(ScriptedModel::new(vec![AssistantTurn::text("Hello")])))
            .await;
        let request = harness.request("m1").await;

        let outcome = manager.run(&request).await.unwrap();

        let RunOutcome::Completed {
            session_id,
            messages_sent,
            sent_message_ids,
            last_seen_sequence,
        } = outcome.clone()
        else {
            panic!("expected completed outcome, got {:?}", outcome);
        };
        assert_eq!(messages_sent, 1);
        assert_eq!(sent_message_ids.len(), 1);
        assert_eq!(last_seen_sequence, request.trigger.sequence);

        let stored = harness.store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.sent_message_ids, sent_message_ids);
        assert_eq!(stored.response_message_id, sent_message_ids.first().cloned());
        assert_eq!(stored.server_id, "worker-a");
    }

    #[tokio::test]
    async fn completed_trigger_is_skipped_without_new_rows() {
        let harness = Harness::new();
        let manager = harness
            .manager(Arc::new(ScriptedModel::repeating(AssistantTurn::text("Hi"))))
            .await;
        let request = harness.request("m1").await;

        let first = manager.run(&request).await.unwrap();
        assert!(matches!(first, RunOutcome::Completed { .. }));

        for _ in 0..2 {
            let again = manager.run(&request).await.unwrap();
            assert_eq!(again.skip_reason(), Some(SkipReason::AlreadyCompleted));
            assert_eq!(again.session_id(), first.session_id());
        }
        assert_eq!(harness.store.list_for_stream("s1", 10).await.unwrap().len(), 1);
        assert_eq!(harness.chat.sent_messages().len(), 1);
    }

    #[tokio::test]
    async fn model_failure_marks_session_failed() {
        let harness = Harness::new();
        let manager = harness
            .manager(Arc::new(ScriptedModel::failing("model endpoint returned 503")))
            .await;
        let request = harness.request("m1").await;

        let outcome = manager.run(&request).await.unwrap();

        let RunOutcome::Failed { session_id, error } = outcome else {
            panic!("expected failed outcome");
        };
        assert!(error.contains("503"));
        let stored = harness.store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert!(stored.error.unwrap().contains("503"));
        assert!(stored.completed_at.is_some());

        // The stream is free again.
        let next = harness.chat.push_message("s1", "u1", "kim", "hello?");
        let retry = harness
            .manager(Arc::new(ScriptedModel::new(vec![AssistantTurn::text("Back")])))
            .await;
        let outcome = retry.run(&harness.request(&next.id).await).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn failed_session_is_resumed_on_redelivery() {
        let harness = Harness::new();
        let request = harness.request("m1").await;
        let failing = harness
            .manager(Arc::new(ScriptedModel::failing("timeout")))
            .await;
        let failed = manager_run_id(&failing, &request).await;

        let manager = harness
            .manager(Arc::new(ScriptedModel::new(vec![AssistantTurn::text("Recovered")])))
            .await;
        let outcome = manager.run(&request).await.unwrap();

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(outcome.session_id(), Some(failed.as_str()));
        let stored = harness.store.get(&failed).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert!(stored.error.is_none());
    }

    async fn manager_run_id(manager: &SessionLifecycleManager, request: &RunRequest) -> String {
        manager
            .run(request)
            .await
            .unwrap()
            .session_id()
            .map(str::to_string)
            .unwrap()
    }

    #[tokio::test]
    async fn live_running_session_for_trigger_is_skipped() {
        let harness = Harness::new();
        let request = harness.request("m1").await;
        harness
            .store
            .insert_running_or_skip(NewSession {
                trigger_message_id: "m1".to_string(),
                stream_id: "s1".to_string(),
                persona_id: "p1".to_string(),
                server_id: "worker-b".to_string(),
                last_seen_sequence: request.trigger.sequence,
            })
            .await
            .unwrap()
            .unwrap();

        let model = Arc::new(ScriptedModel::new(vec![AssistantTurn::text("dup")]));
        let manager = harness.manager(model.clone()).await;
        let outcome = manager.run(&request).await.unwrap();

        assert_eq!(outcome.skip_reason(), Some(SkipReason::AlreadyRunning));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn stale_running_session_is_taken_over() {
        let harness = Harness::new();
        let request = harness.request("m1").await;
        let orphan = harness
            .store
            .insert_running_or_skip(NewSession {
                trigger_message_id: "m1".to_string(),
                stream_id: "s1".to_string(),
                persona_id: "p1".to_string(),
                server_id: "crashed".to_string(),
                last_seen_sequence: request.trigger.sequence,
            })
            .await
            .unwrap()
            .unwrap();

        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(SendMessageTool::new())).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let manager = SessionLifecycleManager::new(
            harness.store.clone(),
            ResponseLoop::new(
                Arc::new(ScriptedModel::new(vec![AssistantTurn::text("Picked up")])),
                registry,
                LoopLimits::default(),
            ),
            &harness.chat.services(),
            LifecycleSettings {
                server_id: "worker-a".to_string(),
                heartbeat_interval: Duration::from_millis(5),
                stale_after: Duration::from_millis(10),
            },
        );

        let outcome = manager.run(&request).await.unwrap();
        assert_eq!(outcome.session_id(), Some(orphan.id.as_str()));
        let stored = harness.store.get(&orphan.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.server_id, "worker-a");
    }

    #[tokio::test]
    async fn watermark_covers_messages_injected_mid_run() {
        let harness = Harness::new();
        let model = Arc::new(ScriptedModel::new(vec![
            AssistantTurn::text("first thoughts"),
            AssistantTurn::text("with your follow-up in mind"),
        ]));
        model.on_call(1, {
            let chat = harness.chat.clone();
            move || {
                chat.push_message("s1", "u1", "kim", "also, one more thing");
            }
        });
        let manager = harness.manager(model.clone()).await;
        let request = harness.request("m1").await;
        let start = request.trigger.sequence;

        let outcome = manager.run(&request).await.unwrap();

        let RunOutcome::Completed {
            session_id,
            last_seen_sequence,
            ..
        } = outcome
        else {
            panic!("expected completed outcome");
        };
        assert_eq!(last_seen_sequence, start + 1);
        assert!(last_seen_sequence >= start);
        let stored = harness.store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.last_seen_sequence, start + 1);
        assert_eq!(model.call_count(), 2);
        assert_eq!(
            harness.chat.sent_messages()[0].content,
            "with your follow-up in mind"
        );
    }

    #[tokio::test]
    async fn reclaimed_run_leaves_the_new_owner_untouched() {
        let harness = Harness::new();
        let request = harness.request("m1").await;
        let model = Arc::new(GatedModel::new(AssistantTurn::text("late reply")));
        let manager = Arc::new(harness.manager(model.clone()).await);

        let stalled = tokio::spawn({
            let manager = manager.clone();
            let request = request.clone();
            async move { manager.run(&request).await }
        });
        model.wait_until_called().await;

        // Swept as dead while the model call hangs, then resumed elsewhere.
        let session = harness
            .store
            .find_by_trigger_message("m1")
            .await
            .unwrap()
            .unwrap();
        harness
            .store
            .fail_orphaned_sessions(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        let resumed = harness
            .store
            .resume(&session.id, "worker-b")
            .await
            .unwrap()
            .unwrap();

        model.release();
        let err = stalled.await.unwrap().unwrap_err();
        assert!(is_lease_lost(&err));

        let stored = harness.store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Running);
        assert_eq!(stored.server_id, "worker-b");
        assert_eq!(stored.run_token, resumed.run_token);
        assert!(stored.error.is_none());
        assert!(stored.sent_message_ids.is_empty());

        let next = harness.chat.push_message("s1", "u1", "kim", "anyone there?");
        let blocked = harness
            .manager(Arc::new(ScriptedModel::new(vec![])))
            .await
            .run(&harness.request(&next.id).await)
            .await
            .unwrap();
        assert_eq!(blocked.skip_reason(), Some(SkipReason::AlreadyRunning));
    }

    #[tokio::test]
    async fn failed_attempt_keeps_its_deliveries_and_the_cap_spans_resumes() {
        let harness = Harness::new();
        let request = harness.request("m1").await;
        let (tx, rx) = flume::unbounded();
        // Five sends, then the model goes away.
        let first = harness
            .manager(Arc::new(ScriptedModel::new(vec![burst_of_sends("first")])))
            .await
            .with_events(Some(tx));

        let outcome = first.run(&request).await.unwrap();

        let RunOutcome::Failed { session_id, .. } = outcome.clone() else {
            panic!("expected failed outcome, got {:?}", outcome);
        };
        let stored = harness.store.get(&session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert_eq!(stored.sent_message_ids.len(), 5);
        assert_eq!(
            stored.response_message_id,
            stored.sent_message_ids.first().cloned()
        );
        assert!(rx.drain().any(|event| matches!(
            event,
            AgentEvent::SessionFinished {
                status: SessionStatus::Failed,
                messages_sent: 5,
                ..
            }
        )));

        let retry = harness
            .manager(Arc::new(ScriptedModel::new(vec![
                burst_of_sends("again"),
                AssistantTurn::text("done"),
            ])))
            .await;
        let outcome = retry.run(&request).await.unwrap();

        let RunOutcome::Completed {
            session_id: resumed_id,
            messages_sent,
            sent_message_ids,
            ..
        } = outcome.clone()
        else {
            panic!("expected completed outcome, got {:?}", outcome);
        };
        assert_eq!(resumed_id, session_id);
        assert_eq!(messages_sent, 0);
        assert_eq!(sent_message_ids, stored.sent_message_ids);
        assert_eq!(harness.chat.sent_messages().len(), 5);
    }

    #[tokio::test]
    async fn commit_failure_leaves_the_session_running_for_recovery() {
        let harness = Harness::new();
        let store: Arc<dyn SessionStore> = Arc::new(CommitFailsStore {
            inner: harness.store.clone(),
        });
        let manager = harness
            .manager_on(
                store,
                Arc::new(ScriptedModel::new(vec![AssistantTurn::text("Hello")])),
                Duration::from_millis(10),
            )
            .await;
        let agent = PersonaAgent::new(&harness.chat.services(), manager);

        let err = agent.run("s1", "m1", "p1").await.unwrap_err();

        assert!(format!("{:#}", err).contains("disk I/O error"));
        assert!(!is_lease_lost(&err));
        let stored = harness
            .store
            .find_by_trigger_message("m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SessionStatus::Running);
        assert_eq!(stored.sent_message_ids.len(), 1);

        // Heartbeat stopped, so the row goes stale and the sweep reclaims it.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let later = harness.store.get(&stored.id).await.unwrap().unwrap();
        assert_eq!(later.heartbeat_at, stored.heartbeat_at);
        let swept = harness
            .store
            .fail_orphaned_sessions(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(swept, vec![stored.id.clone()]);
    }
}
