/// Long-running node tasks: the health monitor cycle and the inbox pump
/// that feeds transport frames into `handle_incoming`.
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::node::MeshNode;
use crate::transport::memory::Frame;

/// Run a health check every `health_check_interval` until shutdown.
pub(super) async fn monitor_loop(node: Arc<MeshNode>, mut shutdown: watch::Receiver<bool>) {
    let mut health_check = tokio::time::interval(node.config().health_check_interval);
    health_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the immediate first tick
    health_check.tick().await;

    loop {
        tokio::select! {
            _ = health_check.tick() => {
                let report = node.run_health_check().await;
                tracing::trace!(node = %node.local_id(), decision = ?report.decision, "health check done");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(node = %node.local_id(), "monitor stopped");
}

impl MeshNode {
    /// Pump frames from an in-memory inbox into the node until the inbox
    /// closes or the node shuts down.
    pub fn spawn_inbox(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Frame>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_signal();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = inbox.recv() => {
                        let Some((from, bytes)) = frame else { break };
                        if let Err(e) = node.handle_incoming(&from, &bytes) {
                            tracing::debug!(node = %node.local_id(), %from, "frame not processed: {e}");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.track_task(task);
    }
}
