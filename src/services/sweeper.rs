//! Periodic expiry sweep.

use crate::services::session_manager::SessionManager;
use std::time::Duration;
use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

/// Run [`SessionManager::sweep_expired`] every `interval` until the runtime
/// shuts down. A slow sweep delays the next one instead of stacking up.
pub fn spawn_sweeper(manager: SessionManager, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs(), "expiry sweeper started");
        loop {
            ticker.tick().await;
            manager.sweep_expired().await;
        }
    })
}
