//! Length-delimited postcard frames for the proxy's RPC surface.
//!
//! One request frame carries the fully-qualified method name and an opaque
//! body; the matching response frame carries the payload or a terminal
//! error. Both sides of every hop (client → proxy, proxy → backend) speak
//! this framing, which is what lets the proxy pass payloads through without
//! understanding them.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use collapse::CollapseError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on one frame. The body is opaque, so this is the only
/// payload sanity check the proxy performs.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One RPC call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Fully-qualified method name, e.g. `/inventory.v1.Inventory/Lookup`.
    pub method: String,
    /// Opaque request body. Never inspected, only fingerprinted.
    pub body: Bytes,
}

/// Terminal disposition of one RPC call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    /// The upstream payload, verbatim.
    Payload(Bytes),
    /// A terminal error, mirrored from the engine's taxonomy.
    Error { kind: ErrorKind, message: String },
}

/// Wire-level mirror of [`CollapseError`], minus the per-variant details
/// that don't serialize meaningfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Cancelled,
    Backend,
    BackendTimeout,
    ProducerPanic,
    ShuttingDown,
}

impl From<&CollapseError> for ErrorKind {
    fn from(error: &CollapseError) -> Self {
        match error {
            CollapseError::Cancelled => Self::Cancelled,
            CollapseError::Backend(_) => Self::Backend,
            CollapseError::BackendTimeout(_) => Self::BackendTimeout,
            CollapseError::ProducerPanic(_) => Self::ProducerPanic,
            CollapseError::ShuttingDown => Self::ShuttingDown,
        }
    }
}

impl RpcResponse {
    /// Collapse an engine outcome into its wire form.
    #[must_use]
    pub fn from_outcome(outcome: collapse::Outcome) -> Self {
        match outcome {
            Ok(payload) => Self::Payload(payload),
            Err(error) => Self::Error {
                kind: (&error).into(),
                message: error.to_string(),
            },
        }
    }
}

fn length_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Postcard-over-length-delimited codec, typed separately per direction:
/// `Rx` is what this side decodes, `Tx` what it encodes.
#[derive(Debug)]
pub struct FrameCodec<Rx, Tx> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<(Rx, Tx)>,
}

/// The proxy's side of a client connection.
pub type ServerCodec = FrameCodec<RpcRequest, RpcResponse>;

/// The dialing side, used towards the backend and by test clients.
pub type ClientCodec = FrameCodec<RpcResponse, RpcRequest>;

impl<Rx, Tx> FrameCodec<Rx, Tx> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: length_codec(),
            _marker: PhantomData,
        }
    }
}

impl<Rx, Tx> Default for FrameCodec<Rx, Tx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Rx: DeserializeOwned, Tx> Decoder for FrameCodec<Rx, Tx> {
    type Item = Rx;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => {
                let item = postcard::from_bytes(&frame)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<Rx, Tx: Serialize> Encoder<Tx> for FrameCodec<Rx, Tx> {
    type Error = io::Error;

    fn encode(&mut self, item: Tx, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = postcard::to_allocvec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(encoded), dst)
    }
}
