use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{
    AgentSession, LeaseLost, NewSession, SessionCompletion, SessionLease, SessionStatus,
    SessionStore,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
pub const ORPHANED_SESSION_ERROR: &str = "orphaned: heartbeat stale";

const SESSION_COLUMNS: &str = "id, trigger_message_id, stream_id, persona_id, server_id, status,
     last_seen_sequence, sent_message_ids_json, response_message_id, heartbeat_at,
     created_at, completed_at, error, run_token";

/// Matches the lease's row only while that attempt still owns it.
const LEASE_GUARD: &str = "id = ?1 AND run_token = ?2 AND status = 'running'";

/// SQLite-backed [`SessionStore`].
///
/// Connections are not pooled in the usual sense: each operation waits for one
/// of `max_connections` permits, opens its own connection, and drops both when
/// it returns.
pub struct SqliteSessionStore {
    path: PathBuf,
    permits: Arc<Semaphore>,
}

/// A connection that gives its permit back when dropped.
struct PooledConnection {
    conn: Connection,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now_timestamp() -> String {
    timestamp(Utc::now())
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn parse_timestamp(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| conversion_error(idx, e))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<AgentSession> {
    let status_raw: String = row.get(5)?;
    let status = SessionStatus::from_db(&status_raw)
        .ok_or_else(|| conversion_error(5, format!("unknown session status '{}'", status_raw)))?;
    let sent_json: String = row.get(7)?;
    let sent_message_ids: Vec<String> =
        serde_json::from_str(&sent_json).map_err(|e| conversion_error(7, e))?;

    Ok(AgentSession {
        id: row.get(0)?,
        trigger_message_id: row.get(1)?,
        stream_id: row.get(2)?,
        persona_id: row.get(3)?,
        server_id: row.get(4)?,
        status,
        last_seen_sequence: row.get(6)?,
        sent_message_ids,
        response_message_id: row.get(8)?,
        heartbeat_at: parse_timestamp(9, row.get(9)?)?,
        created_at: parse_timestamp(10, row.get(10)?)?,
        completed_at: row
            .get::<_, Option<String>>(11)?
            .map(|raw| parse_timestamp(11, raw))
            .transpose()?,
        error: row.get(12)?,
        run_token: row.get(13)?,
    })
}

fn new_run_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn require_lease(updated: usize, lease: &SessionLease) -> Result<()> {
    if updated == 0 {
        return Err(LeaseLost {
            session_id: lease.session_id.clone(),
        }
        .into());
    }
    Ok(())
}

fn select_by(conn: &Connection, column: &str, value: &str) -> Result<Option<AgentSession>> {
    let sql = format!(
        "SELECT {} FROM agent_sessions WHERE {} = ?1",
        SESSION_COLUMNS, column
    );
    let session = conn
        .query_row(&sql, [value], session_from_row)
        .optional()?;
    Ok(session)
}

impl SqliteSessionStore {
    /// Create or open the session database.
    pub fn open<P: AsRef<Path>>(path: P, max_connections: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let store = Self {
            path,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        };
        let conn = store.open_connection()?;
        Self::ensure_schema(&conn)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connection permits not currently in use.
    pub fn available_connections(&self) -> usize {
        self.permits.available_permits()
    }

    fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("Failed to open session database {:?}", self.path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    async fn connect(&self) -> Result<PooledConnection> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("Session store connection permits closed")?;
        let conn = self.open_connection()?;
        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    /// Create the database schema
    fn ensure_schema(conn: &Connection) -> Result<()> {
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::debug!("Session database journal mode: {}", mode);

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_sessions (
                id TEXT PRIMARY KEY,
                trigger_message_id TEXT NOT NULL UNIQUE,
                stream_id TEXT NOT NULL,
                persona_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                run_token TEXT NOT NULL,
                status TEXT NOT NULL,
                last_seen_sequence INTEGER NOT NULL DEFAULT 0,
                sent_message_ids_json TEXT NOT NULL DEFAULT '[]',
                response_message_id TEXT,
                heartbeat_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                error TEXT
            )"#,
            [],
        )?;

        // At most one running session per stream.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_agent_sessions_running_stream
             ON agent_sessions(stream_id) WHERE status = 'running'",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_sessions_status_heartbeat
             ON agent_sessions(status, heartbeat_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_agent_sessions_stream_created
             ON agent_sessions(stream_id, created_at DESC)",
            [],
        )?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn find_by_trigger_message(
        &self,
        trigger_message_id: &str,
    ) -> Result<Option<AgentSession>> {
        let conn = self.connect().await?;
        select_by(&conn, "trigger_message_id", trigger_message_id)
    }

    async fn get(&self, session_id: &str) -> Result<Option<AgentSession>> {
        let conn = self.connect().await?;
        select_by(&conn, "id", session_id)
    }

    async fn insert_running_or_skip(
        &self,
        new_session: NewSession,
    ) -> Result<Option<AgentSession>> {
        let conn = self.connect().await?;
        let id = uuid::Uuid::new_v4().to_string();

        // The partial index (and the trigger uniqueness) decide the race.
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO agent_sessions
                 (id, trigger_message_id, stream_id, persona_id, server_id, run_token, status,
                  last_seen_sequence, sent_message_ids_json, heartbeat_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '[]', ?9, ?9)",
                params![
                    id,
                    new_session.trigger_message_id,
                    new_session.stream_id,
                    new_session.persona_id,
                    new_session.server_id,
                    new_run_token(),
                    SessionStatus::Running.as_db_str(),
                    new_session.last_seen_sequence,
                    now_timestamp(),
                ],
            )
            .context("Failed to insert agent session")?;

        if inserted == 0 {
            return Ok(None);
        }
        select_by(&conn, "id", &id)
    }

    async fn resume(&self, session_id: &str, server_id: &str) -> Result<Option<AgentSession>> {
        let conn = self.connect().await?;
        let updated = conn
            .execute(
                "UPDATE OR IGNORE agent_sessions
                 SET status = 'running', server_id = ?2, run_token = ?3, heartbeat_at = ?4,
                     completed_at = NULL, error = NULL
                 WHERE id = ?1 AND status != 'completed'",
                params![session_id, server_id, new_run_token(), now_timestamp()],
            )
            .context("Failed to resume agent session")?;

        if updated == 0 {
            return Ok(None);
        }
        select_by(&conn, "id", session_id)
    }

    async fn update_status(
        &self,
        lease: &SessionLease,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect().await?;
        let completed_at = status.is_terminal().then(now_timestamp);
        let error = match status {
            SessionStatus::Failed => error,
            _ => None,
        };
        let sql = format!(
            "UPDATE agent_sessions SET status = ?3, completed_at = ?4, error = ?5 WHERE {}",
            LEASE_GUARD
        );
        let updated = conn
            .execute(
                &sql,
                params![
                    lease.session_id,
                    lease.run_token,
                    status.as_db_str(),
                    completed_at,
                    error
                ],
            )
            .with_context(|| {
                format!(
                    "Failed to set session {} to {}",
                    lease.session_id,
                    status.as_db_str()
                )
            })?;
        require_lease(updated, lease)
    }

    async fn update_heartbeat(&self, lease: &SessionLease) -> Result<()> {
        let conn = self.connect().await?;
        let sql = format!(
            "UPDATE agent_sessions SET heartbeat_at = ?3 WHERE {}",
            LEASE_GUARD
        );
        let updated = conn
            .execute(&sql, params![lease.session_id, lease.run_token, now_timestamp()])
            .context("Failed to update session heartbeat")?;
        require_lease(updated, lease)
    }

    async fn update_last_seen_sequence(&self, lease: &SessionLease, sequence: i64) -> Result<()> {
        let conn = self.connect().await?;
        // MAX keeps the row matched when the value is lower, so zero rows
        // always means the lease is gone.
        let sql = format!(
            "UPDATE agent_sessions SET last_seen_sequence = MAX(last_seen_sequence, ?3)
             WHERE {}",
            LEASE_GUARD
        );
        let updated = conn
            .execute(&sql, params![lease.session_id, lease.run_token, sequence])
            .context("Failed to update session watermark")?;
        require_lease(updated, lease)
    }

    async fn record_sent_message(&self, lease: &SessionLease, message_id: &str) -> Result<()> {
        let conn = self.connect().await?;
        let sql = format!(
            "UPDATE agent_sessions
             SET sent_message_ids_json = json_insert(sent_message_ids_json, '$[#]', ?3),
                 response_message_id = COALESCE(response_message_id, ?3)
             WHERE {}",
            LEASE_GUARD
        );
        let updated = conn
            .execute(&sql, params![lease.session_id, lease.run_token, message_id])
            .context("Failed to record sent message")?;
        require_lease(updated, lease)
    }

    async fn complete_session(
        &self,
        lease: &SessionLease,
        completion: &SessionCompletion,
    ) -> Result<()> {
        let conn = self.connect().await?;
        let sent_json = serde_json::to_string(&completion.sent_message_ids)?;
        let sql = format!(
            "UPDATE agent_sessions
             SET status = 'completed',
                 last_seen_sequence = MAX(last_seen_sequence, ?3),
                 response_message_id = ?4,
                 sent_message_ids_json = ?5,
                 heartbeat_at = ?6,
                 completed_at = ?6,
                 error = NULL
             WHERE {}",
            LEASE_GUARD
        );
        let updated = conn
            .execute(
                &sql,
                params![
                    lease.session_id,
                    lease.run_token,
                    completion.last_seen_sequence,
                    completion.response_message_id,
                    sent_json,
                    now_timestamp(),
                ],
            )
            .context("Failed to complete agent session")?;
        require_lease(updated, lease)
    }

    async fn fail_orphaned_sessions(&self, stale_before: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.connect().await?;
        let now = now_timestamp();
        let mut stmt = conn.prepare(
            "UPDATE agent_sessions
             SET status = 'failed', completed_at = ?2, error = ?3
             WHERE status = 'running' AND heartbeat_at < ?1
             RETURNING id",
        )?;
        let ids = stmt
            .query_map(
                params![timestamp(stale_before), now, ORPHANED_SESSION_ERROR],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to sweep orphaned sessions")?;
        Ok(ids)
    }

    async fn list_for_stream(&self, stream_id: &str, limit: usize) -> Result<Vec<AgentSession>> {
        let conn = self.connect().await?;
        let sql = format!(
            "SELECT {} FROM agent_sessions WHERE stream_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
            SESSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params![stream_id, limit as i64], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sessions)
    }
}
