//! Engine tuning knobs.

use std::time::Duration;

use thiserror::Error;

/// Configuration for a [`Collapser`](crate::Collapser).
///
/// All three durations must be strictly positive; [`Collapser::new`]
/// rejects anything else up front rather than misbehaving later (a zero TTL
/// would turn every request into a leader, a zero cleanup interval into a
/// busy loop).
///
/// [`Collapser::new`]: crate::Collapser::new
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// How long a published outcome (success or terminal error) keeps
    /// satisfying `execute` calls without a new producer invocation.
    pub result_cache_duration: Duration,

    /// Deadline for one detached producer run. This is the *only* thing
    /// that bounds an upstream call; caller deadlines never reach it.
    pub backend_timeout: Duration,

    /// Period of the janitor sweep that evicts expired cache entries.
    pub cleanup_interval: Duration,
}

/// Rejection reasons from [`Config::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be a positive duration")]
    NonPositiveDuration { field: &'static str },
}

impl Config {
    /// Check that every duration is strictly positive.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NonPositiveDuration`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("result_cache_duration", self.result_cache_duration),
            ("backend_timeout", self.backend_timeout),
            ("cleanup_interval", self.cleanup_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::NonPositiveDuration { field });
            }
        }
        Ok(())
    }
}
