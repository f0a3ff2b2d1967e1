//! Per-call forwarding client for the upstream backend.

use std::io;

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::trace;

use crate::proxy::wire::{ClientCodec, ErrorKind, RpcRequest, RpcResponse};

/// Ways a single forwarded call can fail before yielding a payload.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to connect to backend: {0}")]
    Connect(#[source] io::Error),

    #[error("failed to send request frame: {0}")]
    Send(#[source] io::Error),

    #[error("failed to read response frame: {0}")]
    Receive(#[source] io::Error),

    #[error("backend closed the connection before responding")]
    ClosedEarly,

    #[error("backend error ({kind:?}): {message}")]
    Upstream { kind: ErrorKind, message: String },
}

/// Dial-per-call client for the backend address.
///
/// Deliberately connectionless between calls: the engine collapses
/// concurrent traffic before it gets here, so the backend sees at most one
/// dial per distinct fingerprint per TTL window and pooling would buy
/// nothing.
#[derive(Debug, Clone)]
pub struct Forwarder {
    address: String,
}

impl Forwarder {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Send one request frame and await the single matching response frame.
    ///
    /// # Errors
    ///
    /// Any connect, frame or protocol failure, or the backend's own error
    /// response. All of them surface to the engine as the producer's error.
    pub async fn forward(&self, method: &str, body: Bytes) -> Result<Bytes, ForwardError> {
        trace!(method, backend = %self.address, "forwarding call");
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(ForwardError::Connect)?;
        let mut framed = Framed::new(stream, ClientCodec::new());

        framed
            .send(RpcRequest {
                method: method.to_owned(),
                body,
            })
            .await
            .map_err(ForwardError::Send)?;

        match framed.next().await {
            Some(Ok(RpcResponse::Payload(payload))) => Ok(payload),
            Some(Ok(RpcResponse::Error { kind, message })) => {
                Err(ForwardError::Upstream { kind, message })
            }
            Some(Err(e)) => Err(ForwardError::Receive(e)),
            None => Err(ForwardError::ClosedEarly),
        }
    }
}
