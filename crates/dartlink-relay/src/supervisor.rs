//! Fixed-interval reconnection supervisor for [`RpcClient`] connections.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::RpcClient;

/// Handle to a running supervisor task.
///
/// Dropping the handle does not stop the task; only [`cancel`] does, which is
/// what a deliberate `disconnect()` calls.
///
/// [`cancel`]: SupervisorHandle::cancel
pub struct SupervisorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Stop supervising. The governed connection stays in whatever state it
    /// is in; no further reconnect attempts are made.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Start supervising `client`: every `interval`, re-dial the last endpoint
/// if the connection is not open. Retries are unbounded; a failed attempt
/// just waits for the next tick.
pub(crate) fn arm(client: RpcClient, interval: Duration) -> SupervisorHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if client.is_connected() {
                continue;
            }
            match client.connect_last().await {
                Ok(()) => info!("supervisor re-established connection"),
                Err(err) => debug!("reconnect attempt failed: {}", err),
            }
        }
        debug!("supervisor stopped");
    });
    SupervisorHandle { shutdown, task }
}
