
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use harness::{accepted_pair, refused_addr, ForwardHandle, TcpEchoBackend, UdpEchoBackend};
use hopline_chain::{
    FailFilter, Health, HttpNodeSettings, Node, NodeFilter, NodeHop, UdpSession, WithDestination,
};
use hopline_forward::{
    ForwardHandler, Forwarder, Handler, HandlerError, HandlerOptions, KeyedRateLimiter, Metadata,
    RateLimit,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn rewrite_settings() -> HttpNodeSettings {
    HttpNodeSettings {
        host: Some("new".to_string()),
        headers: BTreeMap::from([("X-Forwarded".to_string(), "1".to_string())]),
    }
}

fn sniffing_handler(hop: Arc<NodeHop>) -> ForwardHandler {
    let mut handler = ForwardHandler::new(HandlerOptions::default());
    handler
        .init(&Metadata::new().with("sniffing", true))
        .unwrap();
    handler.forward(hop);
    handler
}

async fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

#[tokio::test]
async fn direct_mode_relays_to_connection_destination() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let handler = ForwardHandler::new(HandlerOptions::default());

    let (mut client, accepted) = accepted_pair().await.unwrap();
    let conn = WithDestination::new(accepted, backend.addr.to_string());
    let session = tokio::spawn(async move {
        handler
            .handle(&CancellationToken::new(), Box::new(conn))
            .await
    });

    let payload: Vec<u8> = (0..=255u8).cycle().take(20_000).collect();
    client.write_all(&payload).await.unwrap();
    assert_eq!(read_n(&mut client, payload.len()).await, payload);

    drop(client);
    timeout(IO_TIMEOUT, session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(backend.received(), payload);
}

#[tokio::test]
async fn http_request_is_rewritten_for_node() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let hop = Arc::new(NodeHop::new(
        "web",
        vec![Node::new("web", backend.addr.to_string()).with_http(rewrite_settings())],
    ));
    let forward = ForwardHandle::spawn(sniffing_handler(hop)).await.unwrap();

    let mut client = TcpStream::connect(forward.listen_addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: old\r\n\r\n")
        .await
        .unwrap();

    let expected = b"GET / HTTP/1.1\r\nHost: new\r\nX-Forwarded: 1\r\n\r\n";
    assert_eq!(read_n(&mut client, expected.len()).await, expected);
    assert_eq!(backend.received(), expected);
}

#[tokio::test]
async fn websocket_upgrade_switches_to_raw_copy() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let hop = Arc::new(NodeHop::new(
        "ws",
        vec![Node::new("ws", backend.addr.to_string()).with_http(rewrite_settings())],
    ));
    let forward = ForwardHandle::spawn(sniffing_handler(hop)).await.unwrap();

    let mut client = TcpStream::connect(forward.listen_addr).await.unwrap();
    client
        .write_all(b"GET /chat HTTP/1.1\r\nHost: old\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .await
        .unwrap();
    let upgraded =
        b"GET /chat HTTP/1.1\r\nHost: new\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nX-Forwarded: 1\r\n\r\n";
    assert_eq!(read_n(&mut client, upgraded.len()).await, upgraded);

    // After the upgrade nothing is parsed, even bytes that look like HTTP.
    let frames = b"\x81\x02hiGET / HTTP/1.1\r\nHost: old\r\n\r\n";
    client.write_all(frames).await.unwrap();
    assert_eq!(read_n(&mut client, frames.len()).await, frames);
}

#[tokio::test]
async fn non_http_traffic_is_not_rewritten() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let hop = Arc::new(NodeHop::new(
        "raw",
        vec![Node::new("raw", backend.addr.to_string()).with_http(rewrite_settings())],
    ));
    let forward = ForwardHandle::spawn(sniffing_handler(hop)).await.unwrap();

    let mut client = TcpStream::connect(forward.listen_addr).await.unwrap();
    let payload = b"\x16\x03\x01\x00\x04Host: old\r\n\r\n";
    client.write_all(payload).await.unwrap();
    assert_eq!(read_n(&mut client, payload.len()).await, payload);
}

#[tokio::test]
async fn rate_limited_connection_never_dials() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let limiter = Arc::new(KeyedRateLimiter::new(RateLimit::new(0.01, 1)));
    let mut handler = ForwardHandler::new(HandlerOptions::default().with_rate_limiter(limiter));
    handler.forward(Arc::new(NodeHop::new(
        "echo",
        vec![Node::new("echo", backend.addr.to_string())],
    )));
    let forward = ForwardHandle::spawn(handler).await.unwrap();

    let mut first = TcpStream::connect(forward.listen_addr).await.unwrap();
    first.write_all(b"one").await.unwrap();
    assert_eq!(read_n(&mut first, 3).await, b"one");

    let mut second = TcpStream::connect(forward.listen_addr).await.unwrap();
    let _ = second.write_all(b"two").await;
    let mut buf = [0u8; 8];
    let n = timeout(IO_TIMEOUT, second.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    assert_eq!(backend.connection_count(), 1);
    assert_eq!(
        forward
            .stats()
            .sessions_failed
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
}

#[tokio::test]
async fn dial_failure_marks_node_and_success_resets_it() {
    let addr = refused_addr().await.unwrap();
    let hop = Arc::new(
        NodeHop::new("flaky", vec![Node::new("flaky", addr.to_string())]).with_exclusion(
            FailFilter {
                max_fails: 1,
                fail_timeout: Duration::from_millis(100),
                max_fail_timeout: Duration::from_millis(100),
            },
        ),
    );
    let mut handler = ForwardHandler::new(HandlerOptions::default());
    handler.forward(hop.clone());
    let node = Arc::clone(hop.node("flaky").unwrap());

    // Refused: the node is marked dead.
    let (_client, accepted) = accepted_pair().await.unwrap();
    let err = handler
        .handle(&CancellationToken::new(), Box::new(accepted))
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::Dial { .. }));
    assert_eq!(node.marker().health(), Health::Dead);

    // Inside the exclusion window the dead node is not selected.
    let (_client, accepted) = accepted_pair().await.unwrap();
    let err = handler
        .handle(&CancellationToken::new(), Box::new(accepted))
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::TargetUnavailable));

    // Bring the target up and wait out the window: the next dial succeeds.
    let backend = TcpEchoBackend::spawn_on(TcpListener::bind(addr).await.unwrap()).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (mut client, accepted) = accepted_pair().await.unwrap();
    let session = tokio::spawn(async move {
        handler
            .handle(&CancellationToken::new(), Box::new(accepted))
            .await
    });
    client.write_all(b"back").await.unwrap();
    assert_eq!(read_n(&mut client, 4).await, b"back");
    assert_eq!(node.marker().health(), Health::Alive);

    drop(client);
    timeout(IO_TIMEOUT, session)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn no_matching_node_is_target_unavailable() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut handler = ForwardHandler::new(HandlerOptions::default());
    handler.forward(Arc::new(NodeHop::new(
        "http-only",
        vec![Node::new("web", backend.addr.to_string()).with_filter(NodeFilter {
            host: None,
            protocol: Some("http".to_string()),
        })],
    )));

    let (_client, accepted) = accepted_pair().await.unwrap();
    let err = handler
        .handle(&CancellationToken::new(), Box::new(accepted))
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::TargetUnavailable));
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn datagram_session_skips_sniffing() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let mut handler = ForwardHandler::new(HandlerOptions::default());
    handler
        .init(&Metadata::new().with("sniffing", true))
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let session = UdpSession::connect(client.local_addr().unwrap())
        .await
        .unwrap();
    let session_port = session.get_ref().local_addr().unwrap().port();
    let conn = WithDestination::new(session, backend.addr.to_string());

    let relay = tokio::spawn(async move {
        handler
            .handle(&CancellationToken::new(), Box::new(conn))
            .await
    });

    // Would classify as HTTP on a stream; datagrams go through untouched.
    let datagram = b"GET / HTTP/1.1\r\nHost: old\r\n\r\n";
    client
        .send_to(datagram, ("127.0.0.1", session_port))
        .await
        .unwrap();
    let mut buf = [0u8; 256];
    let (n, _) = timeout(IO_TIMEOUT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], datagram);

    relay.abort();
}
