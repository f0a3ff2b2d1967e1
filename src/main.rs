//! Entry point: parse configuration, start the engine, serve until a
//! shutdown signal arrives, then drain.

use std::net::Ipv4Addr;
use std::sync::Arc;

use clap::Parser as _;
use collapsar::api::{self, ApiState, MetricsEncoder};
use collapsar::app_config::AppConfig;
use collapsar::proxy::forward::Forwarder;
use collapsar::proxy::server::{self, ProxyState};
use collapsar::trc;
use collapse::Collapser;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
enum RunError {
    #[error("invalid engine configuration: {0}")]
    Config(#[from] collapse::ConfigError),

    #[error("engine lifecycle: {0}")]
    Lifecycle(#[from] collapse::LifecycleError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    // Config errors go to stderr directly: tracing isn't initialized yet.
    let config = AppConfig::parse();
    if let Err(messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for message in &messages {
            eprintln!(" - {message}");
        }
        std::process::exit(1);
    }
    trc::init(&config.log_level, config.log_format);

    if let Err(e) = run(config).await {
        error!(error = %e, "proxy failed");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<(), RunError> {
    let engine = Arc::new(Collapser::new(config.collapse_config())?);
    engine.start()?;

    let api_state = ApiState {
        metrics: Arc::new(MetricsEncoder::new(engine.metrics())),
        engine: Arc::clone(&engine),
    };
    let api_listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.metrics_port)).await?;
    info!(port = config.metrics_port, "observability server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(api_listener, api::router(api_state)).await {
            error!(error = %e, "observability server error");
        }
    });

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.rpc_port)).await?;
    info!(
        port = config.rpc_port,
        backend = %config.backend_address,
        cache_duration = ?config.cache_duration,
        "proxy listening"
    );

    let shutdown = CancellationToken::new();
    let state = ProxyState {
        engine: Arc::clone(&engine),
        forwarder: Forwarder::new(config.backend_address.clone()),
    };
    let server = tokio::spawn(server::serve(listener, state, shutdown.clone()));

    // A sidecar is told to leave by its operator (SIGINT) or its
    // orchestrator (SIGTERM). There is no reloadable state, so no SIGHUP
    // handler.
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let cause = tokio::select! {
        _ = signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    info!(signal = cause, "shutdown requested, draining");

    // First stop taking new connections, then drain the engine. Calls
    // still blocked on the backend get `ShuttingDown` from the drain, and
    // their handlers deliver that response before the process exits.
    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "proxy listener ended with an error"),
        Err(e) => warn!(error = %e, "proxy listener task died"),
    }

    engine.stop().await;
    info!("shutdown complete");
    Ok(())
}
