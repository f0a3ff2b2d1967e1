//! Tracing initialization for the sidecar.
//!
//! Built once at startup from the configured level and format. JSON is the
//! default because the expected consumer is a log shipper next to the
//! sidecar, not a human terminal.

use tracing_subscriber::EnvFilter;

use crate::app_config::LogFormat;

/// Install the global subscriber.
///
/// An unparsable `level` falls back to `info` rather than refusing to start:
/// a proxy with slightly-wrong logging beats no proxy.
pub fn init(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| {
        eprintln!("Unparsable LOG_LEVEL '{level}', falling back to 'info'.");
        EnvFilter::new("info")
    });

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
