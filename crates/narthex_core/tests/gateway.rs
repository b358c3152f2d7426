//! End-to-end gateway scenarios over real sockets.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use narthex_config::{LimitsConfig, PublisherConfig, ServerOptions, SubscriberConfig};
use narthex_core::provider::{
    Provider, PublisherProvider, RedirectProvider, ServerProvider, SubscriberAcceptor,
    SubscriberProvider,
};
use narthex_core::{Dispatcher, GatewayHost, GatewayHostMap};
use narthex_net::Connector;

fn limits() -> Arc<LimitsConfig> {
    Arc::new(LimitsConfig {
        client_read_timeout_secs: 2,
        keepalive_timeout_secs: 2,
        origin_connect_timeout_secs: 2,
        origin_read_timeout_secs: 2,
        origin_write_timeout_secs: 2,
        attach_timeout_secs: 2,
        ..LimitsConfig::default()
    })
}

async fn start_dispatcher(
    map: GatewayHostMap,
    limits: Arc<LimitsConfig>,
) -> (Arc<Dispatcher>, std::net::SocketAddr) {
    let connector = Connector::parse("tcp:127.0.0.1:0").unwrap();
    let dispatcher = Dispatcher::new(connector, None, Arc::new(map), limits);
    let addr = dispatcher.start().await.unwrap();
    (dispatcher, addr)
}

/// Read one response: the head as a string plus a Content-Length framed
/// body (empty when the header is absent).
async fn read_response(stream: &mut TcpStream, buf: &mut Vec<u8>) -> (String, Vec<u8>) {
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let mut tmp = [0u8; 4096];
        let n = stream.read(&mut tmp).await.expect("response read");
        assert!(n > 0, "connection closed mid-response");
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    buf.drain(..head_end);

    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while buf.len() < content_length {
        let mut tmp = [0u8; 4096];
        let n = stream.read(&mut tmp).await.expect("body read");
        assert!(n > 0, "connection closed mid-body");
        buf.extend_from_slice(&tmp[..n]);
    }
    let body = buf.drain(..content_length).collect();

    (head, body)
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim()
            .eq_ignore_ascii_case(name)
            .then(|| v.trim().to_string())
    })
}

#[tokio::test]
async fn redirect_routing_and_keep_alive() {
    let mut host = GatewayHost::new();
    host.add_provider(
        "/old",
        Arc::new(RedirectProvider::new("/old", "https://.../new/...?...", None)),
    )
    .unwrap();

    let mut map = GatewayHostMap::new();
    map.insert("www.ex.com", Arc::new(host));
    let (_dispatcher, addr) = start_dispatcher(map, limits()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();

    // Scenario: GET /old is redirected keep-verb with inherited scheme/host.
    client
        .write_all(b"GET /old HTTP/1.1\r\nHost: www.ex.com\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut client, &mut buf).await;
    assert!(head.starts_with("HTTP/1.1 307"), "{head}");
    assert_eq!(
        header_value(&head, "location").as_deref(),
        Some("https://www.ex.com/new/old")
    );

    // Keep-alive: the same connection serves the next request. An unmatched
    // path is a 404.
    client
        .write_all(b"GET /other HTTP/1.1\r\nHost: www.ex.com\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut client, &mut buf).await;
    assert!(head.starts_with("HTTP/1.1 404"), "{head}");

    // Host ports are stripped before lookup.
    client
        .write_all(b"GET /old HTTP/1.1\r\nHost: www.ex.com:8080\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut client, &mut buf).await;
    assert!(head.starts_with("HTTP/1.1 307"), "{head}");

    // Unknown virtual host is a 400.
    client
        .write_all(b"GET /old HTTP/1.1\r\nHost: nobody.example\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut client, &mut buf).await;
    assert!(head.starts_with("HTTP/1.1 400"), "{head}");

    // Empty request path is a 400.
    client
        .write_all(b"GET ? HTTP/1.1\r\nHost: www.ex.com\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut client, &mut buf).await;
    assert!(head.starts_with("HTTP/1.1 400"), "{head}");
}

#[tokio::test]
async fn forwards_to_origin_with_rewrite_and_forwarded_header() {
    // Stub origin: asserts the rewritten request line, echoes a body.
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let mut buf = Vec::new();
        loop {
            let mut tmp = [0u8; 4096];
            let n = stream.read(&mut tmp).await.unwrap();
            buf.extend_from_slice(&tmp[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let head = String::from_utf8_lossy(&buf).to_string();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await
            .unwrap();
        head
    });

    let mut host = GatewayHost::new();
    let options = ServerOptions {
        new_uri: Some("/backend/...".to_string()),
        ..ServerOptions::default()
    };
    let target = format!("tcp:127.0.0.1:{}", origin_addr.port());
    host.add_provider(
        "/api",
        Arc::new(ServerProvider::new("/api", &target, &options, None, limits()).unwrap()),
    )
    .unwrap();

    let mut map = GatewayHostMap::new();
    map.insert("ex.com", Arc::new(host));
    let (_dispatcher, addr) = start_dispatcher(map, limits()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /api/v1/x HTTP/1.1\r\nHost: ex.com\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let (head, body) = read_response(&mut client, &mut buf).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"ok");

    let origin_head = origin_task.await.unwrap();
    assert!(
        origin_head.starts_with("GET /backend/v1/x HTTP/1.1\r\n"),
        "{origin_head}"
    );
    let forwarded = header_value(&origin_head, "forwarded").expect("Forwarded header");
    assert!(forwarded.contains("for=127.0.0.1"), "{forwarded}");
    assert!(forwarded.contains("host=ex.com"), "{forwarded}");
    assert!(forwarded.contains("proto=http"), "{forwarded}");
}

#[tokio::test]
async fn websocket_upgrade_escalates_to_relay() {
    // Stub origin: accepts the upgrade, then echoes a fixed exchange.
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();
    let origin_task = tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let mut buf = Vec::new();
        loop {
            let mut tmp = [0u8; 4096];
            let n = stream.read(&mut tmp).await.unwrap();
            buf.extend_from_slice(&tmp[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            )
            .await
            .unwrap();

        let mut ping = [0u8; 4];
        stream.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");
        stream.write_all(b"pong").await.unwrap();

        // Wait for the client side to hang up.
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    let mut host = GatewayHost::new();
    let target = format!("tcp:127.0.0.1:{}", origin_addr.port());
    host.add_provider(
        "/ws",
        Arc::new(
            ServerProvider::new("/ws", &target, &ServerOptions::default(), None, limits()).unwrap(),
        ),
    )
    .unwrap();

    let mut map = GatewayHostMap::new();
    map.insert("ws.local", Arc::new(host));
    let (_dispatcher, addr) = start_dispatcher(map, limits()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: ws.local\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    let (head, _) = read_response(&mut client, &mut buf).await;
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(buf.is_empty());

    // Past the 101 the gateway is a dumb pipe in both directions.
    client.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    client.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"pong");

    drop(client);
    origin_task.await.unwrap();
}

#[tokio::test]
async fn publisher_subscriber_reverse_attach_serves_requests() {
    let limits = limits();

    // Publisher side: a publisher at /svc plus its acceptor.
    let mut pub_host = GatewayHost::new();
    let publisher_cfg = PublisherConfig {
        uri: "/svc".into(),
        target: "/reverse-e2e".into(),
        auth: None,
        options: ServerOptions::default(),
    };
    let publisher = PublisherProvider::new(&publisher_cfg, None, limits.clone()).unwrap();
    let acceptor = SubscriberAcceptor::new(&publisher);
    let acceptor_uri = acceptor.core().uri().to_string();
    pub_host.add_provider("/svc", publisher).unwrap();
    pub_host.add_provider(&acceptor_uri, Arc::new(acceptor)).unwrap();

    let mut map = GatewayHostMap::new();
    let pub_host = Arc::new(pub_host);
    map.insert("gw.local", pub_host.clone());
    // The subscriber reaches the acceptor by the publisher's address.
    map.insert("127.0.0.1", pub_host);
    let (_dispatcher, addr) = start_dispatcher(map, limits.clone()).await;

    // Subscriber side: whatever the publisher drives over an attached
    // stream is answered by this pinned host.
    let mut sub_host = GatewayHost::new();
    sub_host
        .add_provider(
            "/",
            Arc::new(RedirectProvider::new("/", "https://origin.example/...", None)),
        )
        .unwrap();
    let sub_host = Arc::new(sub_host);

    let subscriber_cfg = SubscriberConfig {
        uri: "/unused".into(),
        target: format!("http://127.0.0.1:{}/reverse-e2e", addr.port()),
        auth: None,
    };
    let subscriber = SubscriberProvider::new(&subscriber_cfg, None, limits.clone()).unwrap();
    subscriber.activate(&sub_host, limits.clone());

    // The controller socket needs a moment to come up; retry until the
    // publisher stops answering 503.
    let mut last_head = String::new();
    for _ in 0..50 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /svc HTTP/1.1\r\nHost: gw.local\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        let (head, _) = read_response(&mut client, &mut buf).await;
        last_head = head;
        if last_head.starts_with("HTTP/1.1 307") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(last_head.starts_with("HTTP/1.1 307"), "{last_head}");
    // The subscriber-side host answered through the reverse connection.
    assert_eq!(
        header_value(&last_head, "location").as_deref(),
        Some("https://origin.example/svc")
    );

    // A second controller is refused while the first is attached.
    let mut intruder = TcpStream::connect(addr).await.unwrap();
    intruder
        .write_all(
            format!(
                "GET {acceptor_uri} HTTP/1.1\r\nHost: gw.local\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let mut buf = Vec::new();
    let (head, _) = read_response(&mut intruder, &mut buf).await;
    assert!(head.starts_with("HTTP/1.1 409"), "{head}");
}

#[tokio::test]
async fn stop_refuses_new_accepts_and_closes_contexts() {
    let mut host = GatewayHost::new();
    host.add_provider(
        "/",
        Arc::new(RedirectProvider::new("/", "https://elsewhere/...", None)),
    )
    .unwrap();
    let mut map = GatewayHostMap::new();
    map.insert("stop.local", Arc::new(host));
    let (dispatcher, addr) = start_dispatcher(map, limits()).await;

    // An idle connection is force-closed once the stop deadline passes.
    let mut idle = TcpStream::connect(addr).await.unwrap();
    dispatcher.stop(Duration::from_millis(200)).await;

    let mut tmp = [0u8; 16];
    match tokio::time::timeout(Duration::from_secs(1), idle.read(&mut tmp)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        other => panic!("expected closed connection, got {other:?}"),
    }

    // New connections are no longer served.
    match TcpStream::connect(addr).await {
        Err(_) => {}
        Ok(mut stream) => {
            let n = tokio::time::timeout(Duration::from_secs(1), stream.read(&mut tmp))
                .await
                .expect("read after stop timed out")
                .unwrap_or(0);
            assert_eq!(n, 0, "dispatcher still serving after stop");
        }
    }
}
