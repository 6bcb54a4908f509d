//! End-to-end tests for the RPC transport: a real server on an ephemeral
//! port, a pooling client, and the failure modes callers are expected to
//! tell apart.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lattice_rpc::frame;
use lattice_rpc::{
    Endpoint, RpcClient, RpcClientConfig, RpcError, RpcServer, StaticResolver,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Binds a server on an ephemeral port and runs its accept loop in the
/// background.
async fn start_server(server: Arc<RpcServer>) -> (String, JoinHandle<Result<(), RpcError>>) {
    let addr = server.bind("127.0.0.1:0").await.expect("bind failed");
    let serving = server.clone();
    let handle = tokio::spawn(async move { serving.serve().await });
    (addr.to_string(), handle)
}

fn direct_client(config: RpcClientConfig) -> RpcClient {
    RpcClient::new(None, config)
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_round_trip() {
    let server = Arc::new(RpcServer::new());
    server
        .register_handler("Ping", |_ctx, payload| async move {
            let mut reply = b"Pong: ".to_vec();
            reply.extend_from_slice(&payload);
            Ok(reply)
        })
        .await;

    let (addr, serve_task) = start_server(server.clone()).await;
    assert_eq!(
        server.local_addr().await.map(|a| a.to_string()),
        Some(addr.clone())
    );
    let client = direct_client(RpcClientConfig::default());

    let reply = client
        .call(&addr, "Ping", b"Hello RPC")
        .await
        .expect("first call failed");
    assert_eq!(reply, b"Pong: Hello RPC");

    // A second call over the pooled connection still works.
    let reply = client
        .call(&addr, "Ping", b"Hello RPC Again")
        .await
        .expect("second call failed");
    assert_eq!(reply, b"Pong: Hello RPC Again");

    client.close_all_connections().await;
    server.close();
    assert!(serve_task.await.unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn close_resolves_listen_cleanly() {
    let server = Arc::new(RpcServer::new());
    let (_addr, serve_task) = start_server(server.clone()).await;

    server.close();
    let result = tokio::time::timeout(Duration::from_secs(2), serve_task)
        .await
        .expect("serve did not stop after close")
        .unwrap();
    assert!(result.is_ok(), "close must resolve serve to Ok, got {result:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn method_not_found_is_reported_in_band() {
    let server = Arc::new(RpcServer::new());
    let (addr, _serve_task) = start_server(server.clone()).await;
    let client = direct_client(RpcClientConfig::default());

    let err = client
        .call(&addr, "PingError", b"Test Method Not Found")
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("no coordinator found for method: PingError"),
        "unexpected error: {err}"
    );
    assert!(matches!(err, RpcError::Application { .. }));

    // The connection survived the failed dispatch.
    server
        .register_handler("Ping", |_ctx, payload| async move { Ok(payload) })
        .await;
    let reply = client.call(&addr, "Ping", b"still alive").await.unwrap();
    assert_eq!(reply, b"still alive");

    server.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_errors_reach_the_caller_with_context() {
    let server = Arc::new(RpcServer::new());
    server
        .register_handler("Broken", |_ctx, _payload| async move {
            Err("coordinator error: something went wrong".into())
        })
        .await;

    let (addr, _serve_task) = start_server(server.clone()).await;
    let client = direct_client(RpcClientConfig::default());

    let err = client.call(&addr, "Broken", b"Trigger Error").await.unwrap_err();
    match &err {
        RpcError::Application {
            service,
            method,
            endpoint,
            message,
        } => {
            assert_eq!(service, &addr);
            assert_eq!(method, "Broken");
            assert_eq!(endpoint, &addr);
            assert_eq!(message, "coordinator error: something went wrong");
        }
        other => panic!("expected an application error, got {other:?}"),
    }

    server.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn last_registration_wins() {
    let server = Arc::new(RpcServer::new());
    server
        .register_handler("Version", |_ctx, _payload| async move { Ok(b"v1".to_vec()) })
        .await;
    server
        .register_handler("Version", |_ctx, _payload| async move { Ok(b"v2".to_vec()) })
        .await;

    let (addr, _serve_task) = start_server(server.clone()).await;
    let client = direct_client(RpcClientConfig::default());

    let reply = client.call(&addr, "Version", b"").await.unwrap();
    assert_eq!(reply, b"v2");

    server.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_response_payload_round_trips() {
    let server = Arc::new(RpcServer::new());
    server
        .register_handler("Ack", |_ctx, _payload| async move { Ok(Vec::new()) })
        .await;

    let (addr, _serve_task) = start_server(server.clone()).await;
    let client = direct_client(RpcClientConfig::default());

    let reply = client.call(&addr, "Ack", b"anything").await.unwrap();
    assert!(reply.is_empty());

    server.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_endpoint_fails_within_the_dial_timeout() {
    let client = direct_client(RpcClientConfig {
        dial_timeout: Duration::from_millis(200),
        ..Default::default()
    });

    // Port 1 is essentially never bound; either a refused dial or the
    // timeout is acceptable, hanging is not.
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        client.call("127.0.0.1:1", "Ping", b"Test No Server"),
    )
    .await
    .expect("call to unreachable endpoint must not hang");

    let err = result.unwrap_err();
    assert!(
        matches!(err, RpcError::Dial { .. } | RpcError::DialTimeout { .. }),
        "unexpected error: {err:?}"
    );
}

/// A hand-rolled server speaking the same frames, counting accepted
/// connections so pooling behavior is observable.
async fn start_counting_echo_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while let Ok(Some(request)) =
                    frame::read_request(&mut stream, frame::DEFAULT_MAX_FRAME_LEN).await
                {
                    let encoded = frame::encode_response("", &request.payload).unwrap();
                    if frame::write_frame(&mut stream, &encoded).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    (addr, accepted)
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_calls_share_one_connection() {
    let (addr, accepted) = start_counting_echo_server().await;
    let client = direct_client(RpcClientConfig::default());

    for i in 0..3u8 {
        let reply = client.call(&addr, "Echo", &[i]).await.unwrap();
        assert_eq!(reply, vec![i]);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1, "pool should reuse the dialed connection");
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_age_eviction_forces_a_fresh_dial() {
    let (addr, accepted) = start_counting_echo_server().await;
    let client = direct_client(RpcClientConfig {
        max_idle_age: Some(Duration::from_millis(30)),
        ..Default::default()
    });

    client.call(&addr, "Echo", b"one").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.call(&addr, "Echo", b"two").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2, "stale connection must not be reused");
}

#[tokio::test(flavor = "multi_thread")]
async fn a_server_that_never_replies_trips_the_call_timeout() {
    // Accepts and reads, but never writes a response.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink).await;
            });
        }
    });

    let client = direct_client(RpcClientConfig {
        call_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    });

    let result = tokio::time::timeout(
        Duration::from_secs(3),
        client.call(&addr, "Ping", b"anyone home"),
    )
    .await
    .expect("call must observe its timeout");

    let err = result.unwrap_err();
    assert!(matches!(err, RpcError::CallTimeout { .. }), "unexpected error: {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn resolver_round_robins_across_instances() {
    // Two live servers answering with different banners.
    let make_server = |banner: &'static [u8]| async move {
        let server = Arc::new(RpcServer::new());
        server
            .register_handler("WhoAmI", move |_ctx, _payload| async move {
                Ok(banner.to_vec())
            })
            .await;
        let (addr, _task) = start_server(server.clone()).await;
        (server, addr)
    };
    let (server_a, addr_a) = make_server(b"alpha").await;
    let (server_b, addr_b) = make_server(b"beta").await;

    let parse = |addr: &str| {
        let (host, port) = addr.rsplit_once(':').unwrap();
        Endpoint::new(host, port.parse().unwrap())
    };
    let resolver = StaticResolver::new()
        .with_service("game", vec![parse(&addr_a), parse(&addr_b)]);
    let client = RpcClient::new(Some(Arc::new(resolver)), RpcClientConfig::default());

    let mut banners = Vec::new();
    for _ in 0..4 {
        banners.push(client.call("game", "WhoAmI", b"").await.unwrap());
    }
    assert_eq!(banners, vec![
        b"alpha".to_vec(),
        b"beta".to_vec(),
        b"alpha".to_vec(),
        b"beta".to_vec(),
    ]);

    let err = client.call("payserver", "WhoAmI", b"").await.unwrap_err();
    assert!(matches!(err, RpcError::NoInstances { .. }));

    server_a.close();
    server_b.close();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_calls_do_not_interleave_responses() {
    let server = Arc::new(RpcServer::new());
    server
        .register_handler("Echo", |_ctx, payload| async move {
            // Stagger processing so calls overlap on the server side.
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(payload)
        })
        .await;

    let (addr, _serve_task) = start_server(server.clone()).await;
    let client = Arc::new(direct_client(RpcClientConfig::default()));

    let mut tasks = Vec::new();
    for i in 0..16u8 {
        let client = client.clone();
        let addr = addr.clone();
        tasks.push(tokio::spawn(async move {
            client.call(&addr, "Echo", &[i; 8]).await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply, vec![i as u8; 8]);
    }

    server.close();
}
