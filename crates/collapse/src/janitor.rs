//! Periodic sweeper that evicts expired result-cache entries.

use std::hash::Hash;
use std::sync::Arc;

use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::engine::Shared;

/// Sweep loop. Runs until the engine's shutdown token fires.
///
/// The first sweep happens one full period after start, and each tick holds
/// the cache's exclusive guard only long enough to retain unexpired
/// entries. The inflight registry is never touched here; leaders remove
/// their own records.
pub(crate) async fn run<K>(shared: Arc<Shared<K>>)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    let period = shared.config.cleanup_interval;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = shared.cache.write().evict_expired(Instant::now());
                if evicted > 0 {
                    shared.metrics.cached_results_sub(evicted);
                    debug!(evicted, "evicted expired cache entries");
                }
            }
            () = shared.shutdown.cancelled() => {
                trace!("janitor stopping");
                break;
            }
        }
    }
}
