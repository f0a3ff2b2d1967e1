//! Accept loop and per-connection RPC handling.

use std::io;
use std::pin::pin;
use std::sync::Arc;

use collapse::Collapser;
use futures::{SinkExt as _, StreamExt as _};
use sha2::{Digest as _, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proxy::forward::Forwarder;
use crate::proxy::wire::{RpcRequest, RpcResponse, ServerCodec};

/// Everything a connection handler needs.
#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<Collapser<String>>,
    pub forwarder: Forwarder,
}

/// Accept connections until `shutdown` fires, one task per connection.
///
/// `shutdown` only stops the *accept loop*. It is deliberately not wired
/// into the calls themselves: a call's cancellation token means "this
/// client gave up", and process shutdown is not that. Callers still
/// blocked when the engine drains get `ShuttingDown` from the drain, as a
/// response frame on their still-open connections.
///
/// Individual connection failures are logged and absorbed; only a broken
/// listener ends the loop with an error.
///
/// # Errors
///
/// Returns the listener's I/O error if accepting becomes impossible.
pub async fn serve(
    listener: TcpListener,
    state: ProxyState,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let state = state.clone();
                tokio::spawn(async move {
                    debug!(%peer, "connection opened");
                    match handle_connection(stream, state).await {
                        Ok(calls) => debug!(%peer, calls, "connection closed"),
                        Err(e) => warn!(%peer, error = %e, "connection failed"),
                    }
                });
            }
            () = shutdown.cancelled() => {
                info!("proxy listener stopping");
                return Ok(());
            }
        }
    }
}

/// Serve sequential calls on one connection until the client hangs up.
/// Returns the number of calls handled.
///
/// Each call carries its own freshly minted cancellation token, cancelled
/// only when this client disconnects while its call is in flight. That is
/// the one cancellation the engine must attribute to the caller; it
/// releases this caller alone and never touches the upstream call.
async fn handle_connection(stream: TcpStream, state: ProxyState) -> io::Result<usize> {
    let mut framed = Framed::new(stream, ServerCodec::new());
    let mut calls = 0usize;
    while let Some(frame) = framed.next().await {
        let request = frame?;
        let ctx = CancellationToken::new();
        let mut dispatched = pin!(dispatch(&state, request, ctx.clone()));

        // The protocol is strictly one call at a time per connection, so
        // the only read activity expected while a call is in flight is the
        // client going away.
        let response = tokio::select! {
            response = &mut dispatched => response,
            readable = framed.next() => {
                ctx.cancel();
                let _ = dispatched.await;
                match readable {
                    None => debug!("client disconnected mid-call"),
                    Some(Err(e)) => warn!(error = %e, "client connection broke mid-call"),
                    Some(Ok(_)) => warn!("protocol violation: second frame while a call was in flight"),
                }
                return Ok(calls);
            }
        };
        framed.send(response).await?;
        calls += 1;
    }
    Ok(calls)
}

/// Run one call through the collapsing engine.
///
/// The producer handed to the engine owns its own clones of the method and
/// body: the engine may run it detached, after this caller is long gone.
async fn dispatch(state: &ProxyState, request: RpcRequest, ctx: CancellationToken) -> RpcResponse {
    let fingerprint = fingerprint(&request.method, &request.body);
    let forwarder = state.forwarder.clone();
    let RpcRequest { method, body } = request;

    let outcome = state
        .engine
        .execute(ctx, fingerprint, move || async move {
            Ok(forwarder.forward(&method, body).await?)
        })
        .await;
    RpcResponse::from_outcome(outcome)
}

/// The identity under which two calls are defined to be the same call: the
/// method name plus a digest of the opaque body.
fn fingerprint(method: &str, body: &[u8]) -> String {
    format!("{method}:{}", hex::encode(Sha256::digest(body)))
}
