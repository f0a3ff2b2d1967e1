//! Request-collapsing RPC proxy sidecar.
//!
//! The binary wires four pieces around the [`collapse`] engine: env-driven
//! configuration, a framed TCP RPC listener that fingerprints each call, a
//! dial-per-call backend forwarder that acts as the engine's producer, and
//! HTTP observability endpoints.

pub mod api;
pub mod app_config;
pub mod proxy;
pub mod trc;
