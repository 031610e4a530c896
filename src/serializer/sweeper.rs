use super::InteractionSerializer;
use crate::core::{Result, StateError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Background task that periodically drops idle entity slots.
pub struct LockSweeper {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl LockSweeper {
    /// Signals the sweeper to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| StateError::LockError(format!("lock sweeper join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for LockSweeper {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the sweeper on the current tokio runtime.
pub fn spawn_lock_sweeper(
    serializer: Arc<InteractionSerializer>,
    interval: Duration,
    idle_horizon: chrono::Duration,
) -> LockSweeper {
    let interval = interval.max(Duration::from_millis(10));
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    serializer.sweep(idle_horizon);
                }
            }
        }
    });

    LockSweeper {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}
