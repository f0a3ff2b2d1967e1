//! The execution coordinator: cache probe, follower join, leader election,
//! detached production, publication, fan-out, and engine lifecycle.

use std::any::Any;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt as _;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::cache::ResultCache;
use crate::config::{Config, ConfigError};
use crate::error::{BoxError, CollapseError, Outcome};
use crate::inflight::{InflightCall, InflightRegistry, Joined};
use crate::janitor;
use crate::metrics::CollapseMetrics;

/// Errors from [`Collapser::start`] and [`Collapser::stop`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("engine already started")]
    AlreadyStarted,
    #[error("engine already stopped")]
    AlreadyStopped,
}

enum Lifecycle {
    Idle,
    Running { janitor: JoinHandle<()> },
    Stopped,
}

/// State shared between the coordinator, detached producer tasks, and the
/// janitor.
///
/// Lock discipline: `inflight` before `cache` when both are held (leader
/// publication, shutdown drain); a record's own mutex only ever nests inside
/// the `inflight` guard, never the reverse; and no guard is held across an
/// `.await`.
pub(crate) struct Shared<K> {
    pub config: Config,
    pub cache: RwLock<ResultCache<K>>,
    pub inflight: RwLock<InflightRegistry<K>>,
    pub metrics: Arc<CollapseMetrics>,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
}

/// Request-collapsing engine: keyed single-flight plus a short-TTL result
/// cache.
///
/// Concurrent [`execute`](Self::execute) calls with equal fingerprints
/// resolve to a single *leader*, which runs the producer once under a
/// detached deadline; every other caller becomes a *follower* and receives
/// the same outcome over its own single-shot channel. The outcome, error
/// or not, is then cached for [`Config::result_cache_duration`], and a
/// janitor task sweeps expired entries every
/// [`Config::cleanup_interval`].
///
/// Cancelling a caller releases only that caller: the producer keeps
/// running on behalf of everyone else, bounded solely by
/// [`Config::backend_timeout`].
pub struct Collapser<K> {
    shared: Arc<Shared<K>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<K> Collapser<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Build an engine from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any configured duration is zero.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                cache: RwLock::new(ResultCache::new()),
                inflight: RwLock::new(InflightRegistry::new()),
                metrics: Arc::new(CollapseMetrics::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    /// Shared handle to the engine's metric group, for the shell to render.
    #[must_use]
    pub fn metrics(&self) -> Arc<CollapseMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    /// Whether [`start`](Self::start) has run and [`stop`](Self::stop) has
    /// not.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// Launch the janitor.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] if the engine was already started or
    /// already stopped.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Idle => {
                let handle = self.shared.tasks.spawn(janitor::run(Arc::clone(&self.shared)));
                *lifecycle = Lifecycle::Running { janitor: handle };
                Ok(())
            }
            Lifecycle::Running { .. } => Err(LifecycleError::AlreadyStarted),
            Lifecycle::Stopped => Err(LifecycleError::AlreadyStopped),
        }
    }

    /// Drain the engine: stop the janitor, fail every outstanding waiter
    /// with [`CollapseError::ShuttingDown`], clear the cache, and wait for
    /// every engine-owned task (detached producers included) to terminate.
    ///
    /// Idempotent: calls after the first return immediately.
    pub async fn stop(&self) {
        let janitor = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running { janitor } => Some(janitor),
                Lifecycle::Idle => None,
                Lifecycle::Stopped => return,
            }
        };

        self.shared.shutdown.cancel();
        if let Some(handle) = janitor {
            if let Err(e) = handle.await {
                warn!(error = %e, "janitor terminated abnormally");
            }
        }

        // Drain inflight and clear the cache under the usual lock order;
        // delivery happens after both guards are released.
        let drained = {
            let mut inflight = self.shared.inflight.write();
            let records = inflight.drain();
            let cleared = self.shared.cache.write().clear();
            self.shared.metrics.cached_results_sub(cleared);
            records
        };

        let mut released = 0usize;
        for record in &drained {
            self.shared.metrics.inflight_requests.dec();
            for tx in record.take_waiters() {
                if tx.send(Err(CollapseError::ShuttingDown)).is_ok() {
                    released += 1;
                }
            }
        }
        if !drained.is_empty() {
            debug!(
                records = drained.len(),
                released, "drained inflight calls at shutdown"
            );
        }

        self.shared.tasks.close();
        self.shared.tasks.wait().await;
    }

    /// Execute `producer` for `fingerprint`, collapsing into any concurrent
    /// call with an equal fingerprint.
    ///
    /// `ctx` is the caller's own cancellation handle. It releases this
    /// caller and nothing else: the producer runs detached, so neither the
    /// upstream call nor any other waiter notices.
    ///
    /// # Errors
    ///
    /// [`CollapseError::Cancelled`] if `ctx` fires first,
    /// [`CollapseError::ShuttingDown`] if the engine drains first, or the
    /// (possibly cached) terminal error of the winning producer run.
    pub async fn execute<F, Fut>(&self, ctx: CancellationToken, fingerprint: K, producer: F) -> Outcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, BoxError>> + Send + 'static,
    {
        let shared = &self.shared;
        let metrics = &shared.metrics;
        metrics.requests_total.inc();

        // Fast-fail before touching either registry.
        if ctx.is_cancelled() {
            return Err(CollapseError::Cancelled);
        }
        if shared.shutdown.is_cancelled() {
            return Err(CollapseError::ShuttingDown);
        }

        // Cache probe under the shared guard, expiry judged against a single
        // fresh timestamp. An expired-but-unswept entry is a miss; the next
        // publication overwrites it.
        let now = Instant::now();
        {
            let cache = shared.cache.read();
            if let Some(entry) = cache.lookup(&fingerprint)
                && now < entry.expires_at
            {
                metrics.cache_hits_total.inc();
                return entry.outcome.clone();
            }
        }

        // Join an existing leader or become one. `get_or_install` under the
        // exclusive guard is what makes the election atomic: of N racing
        // callers exactly one observes `installed`.
        let rx = {
            let mut inflight = shared.inflight.write();
            let (record, installed) = inflight.get_or_install(&fingerprint);
            if installed {
                metrics.backend_calls_total.inc();
                metrics.inflight_requests.inc();
                let rx = match record.join() {
                    Joined::Waiting(rx) => rx,
                    Joined::Finished(_) => unreachable!("freshly installed record cannot be done"),
                };
                self.spawn_producer(fingerprint.clone(), record, producer);
                rx
            } else {
                metrics.collapsed_requests_total.inc();
                match record.join() {
                    // The leader finished but has not yet published to the
                    // cache; its in-memory result is the answer.
                    Joined::Finished(outcome) => return outcome,
                    Joined::Waiting(rx) => rx,
                }
            }
        };

        // The caller's only suspension point: its private channel against
        // its own cancellation. `biased` so that a result that is already
        // there beats a simultaneous cancel.
        tokio::select! {
            biased;
            delivered = rx => match delivered {
                Ok(outcome) => outcome,
                // Sender dropped without a send: the engine tore down around us.
                Err(_) => Err(CollapseError::ShuttingDown),
            },
            () = ctx.cancelled() => Err(CollapseError::Cancelled),
        }
    }

    /// Run the producer on the engine's task tracker, detached from every
    /// caller, then publish and fan out (phase E). The producer future is
    /// bounded by the configured backend timeout and wrapped in a fault
    /// boundary so that publication runs even if it panics.
    fn spawn_producer<F, Fut>(&self, fingerprint: K, record: Arc<InflightCall>, producer: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, BoxError>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.shared.tasks.spawn(async move {
            let deadline = shared.config.backend_timeout;
            let started = Instant::now();
            let outcome = match timeout(deadline, AssertUnwindSafe(producer()).catch_unwind()).await
            {
                Ok(Ok(Ok(payload))) => Ok(payload),
                Ok(Ok(Err(error))) => Err(CollapseError::Backend(error.to_string())),
                Ok(Err(panic)) => {
                    let reason = panic_message(panic.as_ref());
                    warn!(reason, "producer panicked");
                    Err(CollapseError::ProducerPanic(reason.to_owned()))
                }
                Err(_elapsed) => Err(CollapseError::BackendTimeout(deadline)),
            };
            shared
                .metrics
                .backend_latency_seconds
                .observe(started.elapsed().as_secs_f64());

            // Record mutex only: store the result, flip to done, harvest the
            // waiter list. From here on, late joiners copy the result out.
            let waiters = record.finish(outcome.clone());

            // Move the fingerprint from inflight to the cache in one
            // exclusive section. Nothing is published once the engine is
            // draining; the drain already owns those entries.
            {
                let mut inflight = shared.inflight.write();
                if inflight.remove(&fingerprint).is_some() {
                    shared.metrics.inflight_requests.dec();
                }
                if !shared.shutdown.is_cancelled() {
                    let expires_at = Instant::now() + shared.config.result_cache_duration;
                    let mut cache = shared.cache.write();
                    if cache.publish(fingerprint, outcome.clone(), expires_at) {
                        shared.metrics.cached_results.inc();
                    }
                }
            }

            // Fan out with all locks released. A send to a waiter that
            // already gave up (cancelled, channel dropped) is swallowed.
            for tx in waiters {
                let _ = tx.send(outcome.clone());
            }
        });
    }
}

/// Best-effort rendering of a panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "opaque panic payload"
    }
}
