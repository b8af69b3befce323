// src/scheduler.rs
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::aggregator::Aggregator;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval_secs: u64,
}

/// Spawn a loop that runs a full update every `interval_secs`. The first
/// cycle starts immediately. A zero interval disables the loop.
pub fn spawn_update_scheduler(cfg: SchedulerCfg, aggregator: Arc<Mutex<Aggregator>>) -> Option<JoinHandle<()>> {
    if cfg.interval_secs == 0 {
        tracing::info!(target: "been", "periodic updates disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs));
        // A slow cycle delays the next one instead of queueing a burst.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = aggregator.lock().await.update(None).await;
            tracing::info!(
                target: "been",
                total = report.total(),
                failed = report.failed.len(),
                changes = %report.summary(),
                "scheduled update"
            );
        }
    }))
}
