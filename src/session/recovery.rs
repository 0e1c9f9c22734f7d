//! Orphan recovery: sessions left `Running` by a crashed worker would block
//! their stream forever. A periodic sweep fails any whose heartbeat is stale.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::SessionStore;

/// Fail every running session whose heartbeat is older than `stale_after`.
pub async fn sweep_orphaned_sessions(
    store: &dyn SessionStore,
    stale_after: Duration,
) -> Result<Vec<String>> {
    let stale_after = chrono::Duration::from_std(stale_after)?;
    let swept = store.fail_orphaned_sessions(Utc::now() - stale_after).await?;
    for session_id in &swept {
        tracing::warn!(session_id = %session_id, "Failed orphaned session (heartbeat stale)");
    }
    Ok(swept)
}

pub struct SweepHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Run [`sweep_orphaned_sessions`] every `interval` until the handle is
/// stopped or dropped.
pub fn spawn_recovery_sweep(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    stale_after: Duration,
) -> SweepHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            interval_secs = interval.as_secs(),
            stale_after_secs = stale_after.as_secs(),
            "Orphan recovery sweep started"
        );

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweep_orphaned_sessions(store.as_ref(), stale_after).await {
                        tracing::error!("Orphan recovery sweep failed: {:#}", e);
                    }
                }
            }
        }
        tracing::info!("Orphan recovery sweep stopped");
    });

    SweepHandle {
        stop_tx: Some(stop_tx),
        task: Some(task),
    }
}

impl SweepHandle {
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
