//! Durable agent sessions: one record per trigger message.
//!
//! A session is the unit of mutual exclusion for a stream. At most one session
//! per stream may be `Running` at a time; the store enforces this with a
//! uniqueness constraint rather than application locking, so the insert itself
//! decides races between workers.
//!
//! Each insert or resume issues a fresh run token. Every later write is made
//! through a [`SessionLease`] carrying that token, so a worker whose session was
//! swept and taken over elsewhere cannot overwrite the new owner's row.

pub mod database;
pub mod heartbeat;
pub mod lifecycle;
pub mod recovery;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use database::SqliteSessionStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Some(SessionStatus::Running),
            "completed" => Some(SessionStatus::Completed),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSession {
    pub id: String,
    /// Unique: a trigger message maps to at most one session, ever.
    pub trigger_message_id: String,
    pub stream_id: String,
    pub persona_id: String,
    /// Worker process that owns (or last owned) the run.
    pub server_id: String,
    /// Issued per attempt by insert and resume.
    pub run_token: String,
    pub status: SessionStatus,
    /// Highest stream sequence already accounted for. Only moves forward.
    pub last_seen_sequence: i64,
    pub sent_message_ids: Vec<String>,
    pub response_message_id: Option<String>,
    pub heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl AgentSession {
    /// A `Running` session whose heartbeat is older than `threshold`.
    pub fn is_orphaned(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.status != SessionStatus::Running {
            return false;
        }
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => now - self.heartbeat_at > threshold,
            Err(_) => false,
        }
    }

    pub fn lease(&self) -> SessionLease {
        SessionLease {
            session_id: self.id.clone(),
            run_token: self.run_token.clone(),
        }
    }
}

/// Write access to one attempt at a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub session_id: String,
    pub run_token: String,
}

/// A leased write matched no row: the session was swept, taken over by
/// another attempt, or already finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseLost {
    pub session_id: String,
}

impl fmt::Display for LeaseLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} is no longer owned by this run", self.session_id)
    }
}

impl std::error::Error for LeaseLost {}

/// True when `err` (or anything it wraps) is a [`LeaseLost`].
pub fn is_lease_lost(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<LeaseLost>())
}

/// Fields for a session about to be created in the `Running` state.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub trigger_message_id: String,
    pub stream_id: String,
    pub persona_id: String,
    pub server_id: String,
    pub last_seen_sequence: i64,
}

/// Everything written by the terminal `Completed` transition, in one write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionCompletion {
    pub last_seen_sequence: i64,
    pub response_message_id: Option<String>,
    pub sent_message_ids: Vec<String>,
}

/// Durable session records.
///
/// Every operation acquires a connection only for its own duration; callers
/// never hold one across a model call.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn find_by_trigger_message(&self, trigger_message_id: &str)
        -> Result<Option<AgentSession>>;

    async fn get(&self, session_id: &str) -> Result<Option<AgentSession>>;

    /// Create a `Running` session, or return `None` when another session is
    /// already running on the stream. Single atomic, constraint-backed insert.
    async fn insert_running_or_skip(&self, new_session: NewSession)
        -> Result<Option<AgentSession>>;

    /// Move an existing non-completed session back to `Running` under
    /// `server_id` with a new run token. `None` when that would put a second
    /// running session on the stream, or when the session is completed or
    /// missing.
    async fn resume(&self, session_id: &str, server_id: &str) -> Result<Option<AgentSession>>;

    // The writes below only apply while the lease's attempt still owns a
    // `Running` row. Otherwise they fail with `LeaseLost`.

    /// Set a status; terminal statuses also stamp `completed_at`. `error` is
    /// stored only for `Failed`.
    async fn update_status(
        &self,
        lease: &SessionLease,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn update_heartbeat(&self, lease: &SessionLease) -> Result<()>;

    /// Advance the watermark. Lower values are ignored.
    async fn update_last_seen_sequence(&self, lease: &SessionLease, sequence: i64) -> Result<()>;

    /// Append a delivered message id. The first one recorded for the session
    /// also becomes its `response_message_id`.
    async fn record_sent_message(&self, lease: &SessionLease, message_id: &str) -> Result<()>;

    /// Atomically mark `Completed` together with the watermark and message ids.
    async fn complete_session(&self, lease: &SessionLease, completion: &SessionCompletion)
        -> Result<()>;

    /// Fail every `Running` session whose heartbeat is older than
    /// `stale_before`. Returns the ids that were transitioned.
    async fn fail_orphaned_sessions(&self, stale_before: DateTime<Utc>) -> Result<Vec<String>>;

    /// Most recent sessions for a stream, newest first.
    async fn list_for_stream(&self, stream_id: &str, limit: usize) -> Result<Vec<AgentSession>>;
}
