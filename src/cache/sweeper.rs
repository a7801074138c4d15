//! Background removal of long-expired records.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::clock::Clock;
use super::stats::CacheStats;
use super::store::VariantStore;

/// Runs one sweep pass: retries failed invalidations, drops records expired
/// for longer than `retention`, then forgets idle per-resource state.
pub(crate) async fn sweep_once(
    store: &VariantStore,
    clock: &dyn Clock,
    retention: Duration,
    stats: &CacheStats,
) -> Result<usize, super::error::BackendError> {
    let cleared = store.retry_tainted().await;
    if cleared > 0 {
        debug!(cleared, "cleared previously failed invalidations");
    }
    let removed = store.remove_expired(clock.now(), retention).await?;
    stats.record_swept(removed);
    let pruned = store.prune_idle();
    if pruned > 0 {
        debug!(pruned, "dropped idle resource state");
    }
    Ok(removed)
}

/// Spawns the periodic sweeper. The first pass runs one `interval` after
/// start.
pub(crate) fn spawn_sweeper(
    store: Arc<VariantStore>,
    clock: Arc<dyn Clock>,
    stats: Arc<CacheStats>,
    interval: Duration,
    retention: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match sweep_once(&store, clock.as_ref(), retention, &stats).await {
                Ok(removed) if removed > 0 => debug!(removed, "cache sweep removed expired variants"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "cache sweep failed"),
            }
        }
    })
}
