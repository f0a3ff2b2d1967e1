//! Keyed single-flight request collapsing with a short-TTL result cache.
//!
//! The problem this crate solves: a burst of concurrent, semantically
//! identical requests ("same fingerprint") must cost the upstream backend
//! exactly one call. The first caller for a fingerprint is elected *leader*
//! and runs the producer once, detached from every caller's own deadline;
//! everyone else waits on a private single-shot channel and receives the
//! leader's outcome, success or failure alike. The outcome is then cached
//! for a short TTL so stragglers don't even wake the leader machinery, and
//! a janitor task sweeps expired entries.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use collapse::{Collapser, Config};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine: Collapser<String> = Collapser::new(Config {
//!     result_cache_duration: Duration::from_millis(100),
//!     backend_timeout: Duration::from_secs(10),
//!     cleanup_interval: Duration::from_secs(1),
//! })?;
//! engine.start()?;
//!
//! let payload = engine
//!     .execute(CancellationToken::new(), "lookup:abc".to_owned(), || async {
//!         Ok(Bytes::from_static(b"fetched once, shared by everyone"))
//!     })
//!     .await?;
//! # drop(payload);
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod engine;
mod error;
mod inflight;
mod janitor;
mod metrics;

pub use config::{Config, ConfigError};
pub use engine::{Collapser, LifecycleError};
pub use error::{BoxError, CollapseError, Outcome};
pub use metrics::CollapseMetrics;
