//! Process configuration.
//!
//! Every option is readable from the environment, which is the deployment
//! surface for a sidecar, and overridable from the command line for local
//! runs. Durations accept suffixed values like `100ms`, `10s` or `1m30s`.

use std::time::Duration;

use clap::Parser;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    Json,
    /// Human-readable plain text.
    Text,
}

/// Runtime configuration for the sidecar.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "collapsar",
    version,
    about = "Request-collapsing RPC proxy sidecar."
)]
pub struct AppConfig {
    /// Port the RPC listener binds on.
    #[arg(long, env = "RPC_PORT", default_value_t = 50052)]
    pub rpc_port: u16,

    /// Port the /metrics and /health HTTP server binds on.
    #[arg(long, env = "METRICS_PORT", default_value_t = 2112)]
    pub metrics_port: u16,

    /// Upstream backend address, host:port.
    #[arg(long, env = "BACKEND_ADDRESS")]
    pub backend_address: String,

    /// Deadline for one upstream call. Detached from client deadlines.
    #[arg(long, env = "BACKEND_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub backend_timeout: Duration,

    /// How long a completed result keeps satisfying identical requests.
    #[arg(long, env = "COLLAPSER_CACHE_DURATION", default_value = "100ms", value_parser = parse_duration)]
    pub cache_duration: Duration,

    /// Period of the expired-result sweeper.
    #[arg(long, env = "COLLAPSER_CLEANUP_INTERVAL", default_value = "1s", value_parser = parse_duration)]
    pub cleanup_interval: Duration,

    /// Tracing filter directive, e.g. `info` or `collapse=debug`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Validate the correctness of the configuration.
    ///
    /// Returns every violation at once rather than failing on the first, so
    /// a broken deployment manifest can be fixed in one pass.
    ///
    /// # Errors
    ///
    /// A list of human-readable validation error messages.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.rpc_port == 0 {
            errors.push("RPC_PORT must not be 0".to_owned());
        }
        if self.metrics_port == 0 {
            errors.push("METRICS_PORT must not be 0".to_owned());
        }
        if self.rpc_port == self.metrics_port {
            errors.push("RPC_PORT and METRICS_PORT must differ".to_owned());
        }

        if self.backend_address.trim().is_empty() {
            errors.push("BACKEND_ADDRESS must not be empty".to_owned());
        } else if !self.backend_address.contains(':') {
            errors.push(format!(
                "BACKEND_ADDRESS '{}' is missing a port",
                self.backend_address
            ));
        }

        for (name, value) in [
            ("BACKEND_TIMEOUT", self.backend_timeout),
            ("COLLAPSER_CACHE_DURATION", self.cache_duration),
            ("COLLAPSER_CLEANUP_INTERVAL", self.cleanup_interval),
        ] {
            if value.is_zero() {
                errors.push(format!("{name} must be a positive duration"));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// The engine's slice of this configuration.
    #[must_use]
    pub fn collapse_config(&self) -> collapse::Config {
        collapse::Config {
            result_cache_duration: self.cache_duration,
            backend_timeout: self.backend_timeout,
            cleanup_interval: self.cleanup_interval,
        }
    }
}

/// Parse a suffixed duration: one or more `<number><unit>` segments where
/// the unit is `ns`, `us`, `ms`, `s`, `m` or `h`. Segments add up, so
/// `1m30s` works.
fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_owned());
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("duration '{trimmed}' is missing a unit"))?;
        if number_len == 0 {
            return Err(format!("invalid duration '{trimmed}'"));
        }
        let (number, after) = rest.split_at(number_len);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number '{number}' in duration '{trimmed}'"))?;

        let unit_len = after
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(after.len());
        let (unit, next) = after.split_at(unit_len);
        let unit_seconds = match unit {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("unknown unit '{unit}' in duration '{trimmed}'")),
        };
        total += Duration::from_secs_f64(value * unit_seconds);
        rest = next;
    }
    Ok(total)
}
