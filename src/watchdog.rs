//! Background link supervision.
//!
//! The watchdog polls link liveness on a fixed interval and drives
//! reconnection when the link drops, so the experiment engine never has to
//! care about connection state mid-run. Mutual exclusion with the foreground
//! task comes from the link's CAS state guard: whichever task wins the
//! `Disconnected → Connecting` transition owns the reconnect, and the probe
//! declines to interrupt a transport the foreground currently holds.

use crate::link::{DeviceLink, LinkState};
use log::{info, warn};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Handle to the spawned supervision task.
pub struct ConnectionWatchdog {
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ConnectionWatchdog {
    /// Spawn the watchdog polling `link` every `poll_interval`.
    pub fn spawn(link: DeviceLink, poll_interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("link watchdog started ({poll_interval:?} poll)");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        if link.is_connected() || link.state() == LinkState::Connecting {
                            continue;
                        }
                        warn!("link lost, reconnecting");
                        tokio::select! {
                            _ = &mut shutdown_rx => break,
                            result = link.connect() => {
                                if let Err(e) = result {
                                    warn!("reconnect failed: {e}");
                                }
                            }
                        }
                    }
                }
            }

            info!("link watchdog stopped");
        });

        Self {
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ConnectionWatchdog {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
