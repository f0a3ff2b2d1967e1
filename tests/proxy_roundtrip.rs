#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use collapsar::proxy::forward::Forwarder;
use collapsar::proxy::server::{self, ProxyState};
use collapsar::proxy::wire::{ClientCodec, ErrorKind, RpcRequest, RpcResponse, ServerCodec};
use collapse::{Collapser, Config};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Fake backend speaking the proxy's framing. Echoes `echo:<body>` after
/// `latency`, errors on the `/test.Service/Fail` method, and counts every
/// request it actually serves.
async fn spawn_backend(latency: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, ServerCodec::new());
                while let Some(Ok(request)) = framed.next().await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    sleep(latency).await;
                    let response = if request.method == "/test.Service/Fail" {
                        RpcResponse::Error {
                            kind: ErrorKind::Backend,
                            message: "backend says no".to_owned(),
                        }
                    } else {
                        let mut payload = b"echo:".to_vec();
                        payload.extend_from_slice(&request.body);
                        RpcResponse::Payload(Bytes::from(payload))
                    };
                    if framed.send(response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, hits)
}

/// Proxy wired to `backend`, listening on an ephemeral port.
async fn spawn_proxy(
    backend: SocketAddr,
    ttl: Duration,
) -> (SocketAddr, Arc<Collapser<String>>, CancellationToken) {
    let engine = Arc::new(
        Collapser::new(Config {
            result_cache_duration: ttl,
            backend_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_millis(50),
        })
        .unwrap(),
    );
    engine.start().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let state = ProxyState {
        engine: Arc::clone(&engine),
        forwarder: Forwarder::new(backend.to_string()),
    };
    tokio::spawn(server::serve(listener, state, shutdown.clone()));

    (addr, engine, shutdown)
}

async fn call(proxy: SocketAddr, method: &str, body: &[u8]) -> RpcResponse {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut framed = Framed::new(stream, ClientCodec::new());
    framed
        .send(RpcRequest {
            method: method.to_owned(),
            body: Bytes::copy_from_slice(body),
        })
        .await
        .unwrap();
    framed
        .next()
        .await
        .expect("proxy must respond before closing")
        .expect("response frame must decode")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_identical_calls_reach_the_backend_once() {
    let (backend, hits) = spawn_backend(Duration::from_millis(40)).await;
    let (proxy, engine, shutdown) = spawn_proxy(backend, Duration::from_millis(200)).await;

    let mut set = JoinSet::new();
    for _ in 0..20 {
        set.spawn(async move { call(proxy, "/test.Service/Get", b"ping").await });
    }
    while let Some(joined) = set.join_next().await {
        assert_eq!(
            joined.unwrap(),
            RpcResponse::Payload(Bytes::from_static(b"echo:ping"))
        );
    }

    assert_eq!(
        hits.load(Ordering::SeqCst),
        1,
        "20 identical in-flight calls must cost one backend request"
    );

    shutdown.cancel();
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_bodies_are_different_calls() {
    let (backend, hits) = spawn_backend(Duration::from_millis(5)).await;
    let (proxy, engine, shutdown) = spawn_proxy(backend, Duration::from_millis(200)).await;

    let first = call(proxy, "/test.Service/Get", b"alpha").await;
    let second = call(proxy, "/test.Service/Get", b"beta").await;

    assert_eq!(first, RpcResponse::Payload(Bytes::from_static(b"echo:alpha")));
    assert_eq!(second, RpcResponse::Payload(Bytes::from_static(b"echo:beta")));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeat_call_within_ttl_is_served_from_cache() {
    let (backend, hits) = spawn_backend(Duration::from_millis(5)).await;
    let (proxy, engine, shutdown) = spawn_proxy(backend, Duration::from_millis(300)).await;

    let first = call(proxy, "/test.Service/Get", b"ping").await;
    let second = call(proxy, "/test.Service/Get", b"ping").await;

    assert_eq!(first, second);
    assert_eq!(
        hits.load(Ordering::SeqCst),
        1,
        "the second call must be a cache hit"
    );

    shutdown.cancel();
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backend_errors_propagate_and_are_negatively_cached() {
    let (backend, hits) = spawn_backend(Duration::from_millis(5)).await;
    let (proxy, engine, shutdown) = spawn_proxy(backend, Duration::from_millis(300)).await;

    for _ in 0..2 {
        match call(proxy, "/test.Service/Fail", b"ping").await {
            RpcResponse::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::Backend);
                assert!(
                    message.contains("backend says no"),
                    "backend reason must survive the round trip, got: {message}"
                );
            }
            RpcResponse::Payload(_) => panic!("the Fail method must not yield a payload"),
        }
    }
    assert_eq!(
        hits.load(Ordering::SeqCst),
        1,
        "the failure must be served from the cache the second time"
    );

    shutdown.cancel();
    engine.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn draining_fails_a_blocked_call_with_shutting_down() {
    // The backend is slow enough that the drain happens while the call is
    // genuinely blocked upstream.
    let (backend, hits) = spawn_backend(Duration::from_millis(500)).await;
    let (proxy, engine, shutdown) = spawn_proxy(backend, Duration::from_millis(200)).await;

    let begun = Instant::now();
    let client = tokio::spawn(async move {
        let response = call(proxy, "/test.Service/Get", b"ping").await;
        (response, Instant::now())
    });

    // Let the call reach the backend, then shut down exactly the way the
    // binary does: stop the accept loop, then drain the engine.
    sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    engine.stop().await;

    let (response, answered_at) = client.await.unwrap();
    match response {
        RpcResponse::Error { kind, message } => {
            assert_eq!(
                kind,
                ErrorKind::ShuttingDown,
                "a drained call must surface the shutdown error, not {kind:?}: {message}"
            );
        }
        RpcResponse::Payload(_) => panic!("the backend cannot have answered a drained call"),
    }
    assert!(
        answered_at.duration_since(begun) < Duration::from_millis(300),
        "the drain must release the caller well before the backend's 500ms reply"
    );
    assert_eq!(
        hits.load(Ordering::SeqCst),
        1,
        "the call must have been in flight upstream when the drain hit"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_connection_carries_sequential_calls() {
    let (backend, hits) = spawn_backend(Duration::from_millis(5)).await;
    let (proxy, engine, shutdown) = spawn_proxy(backend, Duration::from_millis(300)).await;

    let stream = TcpStream::connect(proxy).await.unwrap();
    let mut framed = Framed::new(stream, ClientCodec::new());
    for body in [&b"one"[..], b"two", b"one"] {
        framed
            .send(RpcRequest {
                method: "/test.Service/Get".to_owned(),
                body: Bytes::copy_from_slice(body),
            })
            .await
            .unwrap();
        let response = framed.next().await.unwrap().unwrap();
        let mut expected = b"echo:".to_vec();
        expected.extend_from_slice(body);
        assert_eq!(response, RpcResponse::Payload(Bytes::from(expected)));
    }

    // "one" repeated within the TTL: two distinct bodies reach the backend.
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    engine.stop().await;
}
