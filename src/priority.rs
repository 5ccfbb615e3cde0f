//! Priority policy — base priorities per source and anti-starvation aging.

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::queue::{now_ts, JobSource};
use crate::store::{ExecutionStore, InferenceStore};

/// Interactive chat requests outrank everything.
pub const PRIORITY_CHAT: i64 = 90;
/// A user explicitly pressing "run".
pub const PRIORITY_MANUAL_RUN: i64 = 70;
/// Agent-to-agent spawns inherit the middle tier.
pub const PRIORITY_INTERNAL_NODE: i64 = 50;
/// Scheduled triggers and webhooks queue at the bottom.
pub const PRIORITY_TRIGGER: i64 = 30;

/// Period of the aging loop.
pub const AGING_INTERVAL_SEC: u64 = 60;
/// PENDING jobs older than this get boosted on each tick.
pub const AGING_THRESHOLD_SEC: u64 = 300;
/// Boost added per tick. Coarse: the FIFO tie-break handles fine ordering.
pub const AGING_BOOST: i64 = 10;
/// Aging lifts a waiting job above INTERNAL_NODE but never above MANUAL_RUN.
pub const AGING_CAP: i64 = 65;

/// Base priority for a job source.
pub fn base_priority(source: JobSource) -> i64 {
    match source {
        JobSource::Chat => PRIORITY_CHAT,
        JobSource::ManualRun => PRIORITY_MANUAL_RUN,
        JobSource::InternalNode => PRIORITY_INTERNAL_NODE,
        JobSource::Trigger => PRIORITY_TRIGGER,
    }
}

/// Effective priority for a new job: a child is never scheduled below its
/// parent, and an explicit user source anchors its own floor.
pub fn assign_priority(source: JobSource, parent_priority: Option<i64>) -> i64 {
    let base = base_priority(source);
    match parent_priority {
        Some(parent) => base.max(parent),
        None => base,
    }
}

/// Spawn the background aging loop.
///
/// Each tick issues one UPDATE per queue, boosting PENDING rows older than
/// the threshold. RUNNING rows are immune, and the lease statement filters on
/// PENDING, so the loop needs no coordination with workers.
pub fn spawn_aging_loop(
    executions: ExecutionStore,
    inference: InferenceStore,
    config: &EngineConfig,
) -> JoinHandle<()> {
    let interval = config.aging_interval;
    let threshold = config.aging_threshold;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would boost nothing; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let threshold_ts = now_ts() - threshold.as_secs() as i64;

            let boosted_executions =
                match executions.age_pending(threshold_ts, AGING_BOOST, AGING_CAP) {
                    Ok(count) => count,
                    Err(e) => {
                        error!(error = %e, "Aging tick failed for executions");
                        continue;
                    }
                };
            let boosted_tasks = match inference.age_pending(threshold_ts, AGING_BOOST, AGING_CAP) {
                Ok(count) => count,
                Err(e) => {
                    error!(error = %e, "Aging tick failed for inference queue");
                    continue;
                }
            };

            if boosted_executions > 0 || boosted_tasks > 0 {
                info!(
                    executions = boosted_executions,
                    inference = boosted_tasks,
                    "Aging boost applied"
                );
            }
        }
    })
}
