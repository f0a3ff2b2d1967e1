//! Engine counters and gauges, each tied to exactly one state transition.

use measured::metric::histogram::Thresholds;
use measured::{Counter, Gauge, Histogram, MetricGroup};

/// Signals for one engine instance.
///
/// Counters are monotonic and fire exactly once per transition; gauges track
/// live set sizes; the histogram observes one detached producer run per
/// leader. The shell renders the group over HTTP; the engine itself only
/// ever mutates.
#[derive(MetricGroup)]
#[metric(new())]
pub struct CollapseMetrics {
    /// Requests entering the coordinator, before any cancellation check.
    pub requests_total: Counter,

    /// Requests satisfied by an unexpired cached outcome.
    pub cache_hits_total: Counter,

    /// Requests that joined an existing inflight call, late joiners of an
    /// already-finished one included.
    pub collapsed_requests_total: Counter,

    /// Leader elections, i.e. producer invocations.
    pub backend_calls_total: Counter,

    /// Live inflight records.
    pub inflight_requests: Gauge,

    /// Live result-cache entries.
    pub cached_results: Gauge,

    /// Wall-clock duration of each detached producer run, timeout and
    /// panic paths included.
    #[metric(metadata = Thresholds::<12>::exponential_buckets(0.005, 2.0))]
    pub backend_latency_seconds: Histogram<12>,
}

impl Default for CollapseMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CollapseMetrics {
    /// Decrement the live-cache gauge by `count` evicted entries.
    pub(crate) fn cached_results_sub(&self, count: usize) {
        for _ in 0..count {
            self.cached_results.dec();
        }
    }
}
