//! Background tasks that keep this node's view of the cluster current.

use crate::sync::SessionManager;
use scrivener_core::ScrivenerError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Heartbeat, expire silent peers and pull membership commits made by
/// other processes, every `interval`.
pub fn spawn_heartbeat(
    manager: Arc<SessionManager>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let coordinator = manager.stores().coordinator.clone();
        let timeout = match chrono::Duration::from_std(timeout) {
            Ok(t) => t,
            Err(e) => {
                error!("Invalid heartbeat timeout: {}", e);
                return;
            }
        };
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now();

            match coordinator.heartbeat(manager.node_id(), now) {
                Ok(()) => {}
                // Expired by a peer while we were paused
                Err(ScrivenerError::UnknownNode(_)) => {
                    warn!("Node {} was expired, re-registering", manager.node_id());
                    if let Err(e) = coordinator.register_node(manager.node().clone()) {
                        error!("Failed to re-register: {}", e);
                    }
                }
                Err(e) => warn!("Heartbeat failed: {}", e),
            }

            match coordinator.expire_stale(now, timeout) {
                Ok(expired) if !expired.is_empty() => {
                    info!("Expired silent nodes: {:?}", expired);
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to expire stale nodes: {}", e),
            }

            if let Err(e) = coordinator.refresh() {
                warn!("Failed to refresh membership: {}", e);
            }
        }
    })
}

/// Hand sessions off whenever a membership change is published.
pub fn spawn_membership_watcher(manager: Arc<SessionManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = manager.stores().coordinator.watch_membership();
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            debug!(
                "Membership v{}: {} node(s)",
                snapshot.version,
                snapshot.nodes.len()
            );
            manager.on_membership_change(&snapshot).await;
        }
    })
}

/// Delete retired versions once their grace period has passed.
pub fn spawn_retired_sweeper(manager: Arc<SessionManager>, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = grace.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match manager.sweep_retired(grace) {
                Ok(0) => {}
                Ok(n) => info!("Swept {} retired version(s)", n),
                Err(e) => warn!("Retired version sweep failed: {}", e),
            }
        }
    })
}
