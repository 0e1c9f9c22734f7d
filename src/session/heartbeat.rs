//! Liveness ticker for a running session.
//!
//! The handle is owned by the task running the session. Stopping it (or
//! dropping it, e.g. on an early return or panic) ends the ticker. The ticker
//! also ends by itself once the lease is lost.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{is_lease_lost, SessionLease, SessionStore};

pub struct HeartbeatHandle {
    session_id: String,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Start refreshing `heartbeat_at` for the leased session every `interval`.
    pub fn start(store: Arc<dyn SessionStore>, lease: SessionLease, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let session_id = lease.session_id.clone();
        let task_session_id = session_id.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the row was just written.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        match store.update_heartbeat(&lease).await {
                            Ok(()) => {}
                            Err(e) if is_lease_lost(&e) => {
                                tracing::warn!(
                                    session_id = %task_session_id,
                                    "Session no longer owned by this run, stopping heartbeat"
                                );
                                break;
                            }
                            Err(e) => tracing::warn!(
                                session_id = %task_session_id,
                                "Heartbeat update failed: {:#}",
                                e
                            ),
                        }
                    }
                }
            }
            tracing::trace!(session_id = %task_session_id, "Heartbeat stopped");
        });

        Self {
            session_id,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stop the ticker and wait for an in-flight update to finish.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(session_id = %self.session_id, "Heartbeat task ended abnormally: {}", e);
                }
            }
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{NewSession, SqliteSessionStore};
    use tempfile::TempDir;

    async fn running_session(store: &SqliteSessionStore) -> crate::session::AgentSession {
        store
            .insert_running_or_skip(NewSession {
                trigger_message_id: "m1".to_string(),
                stream_id: "s1".to_string(),
                persona_id: "p1".to_string(),
                server_id: "worker-a".to_string(),
                last_seen_sequence: 0,
            })
            .await
            .expect("insert")
            .expect("created")
    }

    #[tokio::test]
    async fn ticks_until_stopped() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(
            SqliteSessionStore::open(dir.path().join("sessions.db"), 2).expect("db init"),
        );
        let session = running_session(&store).await;

        let handle = HeartbeatHandle::start(
            store.clone(),
            session.lease(),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(90)).await;
        handle.stop().await;

        let after_stop = store.get(&session.id).await.expect("get").expect("row");
        assert!(after_stop.heartbeat_at > session.heartbeat_at);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let later = store.get(&session.id).await.expect("get").expect("row");
        assert_eq!(later.heartbeat_at, after_stop.heartbeat_at);
    }

    #[tokio::test]
    async fn dropping_the_handle_ends_the_ticker() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(
            SqliteSessionStore::open(dir.path().join("sessions.db"), 2).expect("db init"),
        );
        let session = running_session(&store).await;

        let handle = HeartbeatHandle::start(
            store.clone(),
            session.lease(),
            Duration::from_millis(10),
        );
        drop(handle);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stored = store.get(&session.id).await.expect("get").expect("row");
        assert_eq!(stored.heartbeat_at, session.heartbeat_at);
    }

    #[tokio::test]
    async fn ticker_ends_when_the_session_is_taken_over() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(
            SqliteSessionStore::open(dir.path().join("sessions.db"), 2).expect("db init"),
        );
        let session = running_session(&store).await;
        store
            .fail_orphaned_sessions(chrono::Utc::now() + chrono::Duration::seconds(1))
            .await
            .expect("sweep");
        let resumed = store
            .resume(&session.id, "worker-b")
            .await
            .expect("resume")
            .expect("resumed");

        let handle = HeartbeatHandle::start(
            store.clone(),
            session.lease(),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stored = store.get(&session.id).await.expect("get").expect("row");
        assert_eq!(stored.heartbeat_at, resumed.heartbeat_at);
        assert!(handle.task.as_ref().is_some_and(|task| task.is_finished()));
        handle.stop().await;
    }
}
