//! End-to-end tests: real loopback listeners, a minimal in-test SOCKS5
//! responder, and the full `Tunnel::run` lifecycle.

use sockstun_core::{DirectDialer, Tunnel, TunnelError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Reserve a loopback address nobody is listening on.
async fn free_addr() -> String {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap().to_string()
}

/// Connect, retrying while the rule worker is still binding.
async fn connect(addr: &str) -> TcpStream {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return stream,
            Err(e) if tokio::time::Instant::now() >= deadline => {
                panic!("could not connect to {addr}: {e}")
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
}

fn spawn_tunnel(tunnel: Tunnel, cancel: CancellationToken) -> JoinHandle<Result<(), TunnelError>> {
    tokio::spawn(async move { tunnel.run(cancel).await })
}

/// CONNECT target as seen by the fake proxy.
#[derive(Debug, PartialEq, Eq)]
enum Target {
    Ip(std::net::SocketAddr),
    Domain(String, u16),
}

/// Accept one SOCKS5 CONNECT (no auth), report the target, then hand the
/// client stream back as if the proxy were the remote end.
async fn socks5_accept_one(listener: &TcpListener) -> (TcpStream, Target) {
    let (mut conn, _) = listener.accept().await.unwrap();

    let mut head = [0u8; 2];
    conn.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 5, "expected SOCKS5 greeting");
    let mut methods = vec![0u8; head[1] as usize];
    conn.read_exact(&mut methods).await.unwrap();
    assert!(methods.contains(&0), "client must offer no-auth");
    conn.write_all(&[5, 0]).await.unwrap();

    let mut req = [0u8; 4];
    conn.read_exact(&mut req).await.unwrap();
    assert_eq!(req[..3], [5, 1, 0], "expected CONNECT request");
    let target = match req[3] {
        1 => {
            let mut ip = [0u8; 4];
            conn.read_exact(&mut ip).await.unwrap();
            let port = conn.read_u16().await.unwrap();
            Target::Ip((std::net::Ipv4Addr::from(ip), port).into())
        }
        3 => {
            let len = conn.read_u8().await.unwrap() as usize;
            let mut name = vec![0u8; len];
            conn.read_exact(&mut name).await.unwrap();
            let port = conn.read_u16().await.unwrap();
            Target::Domain(String::from_utf8(name).unwrap(), port)
        }
        4 => {
            let mut ip = [0u8; 16];
            conn.read_exact(&mut ip).await.unwrap();
            let port = conn.read_u16().await.unwrap();
            Target::Ip((std::net::Ipv6Addr::from(ip), port).into())
        }
        other => panic!("unexpected address type {other}"),
    };

    conn.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();
    (conn, target)
}

#[tokio::test]
async fn forwards_http_request_through_socks5() {
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    let local = free_addr().await;

    let tunnel = Tunnel::new(&format!("socks5://{proxy_addr}"), Duration::ZERO).unwrap();
    tunnel.add("web", &local, "10.0.0.5:80");
    let cancel = CancellationToken::new();
    let running = spawn_tunnel(tunnel, cancel.clone());

    let mut client = connect(&local).await;
    let (mut remote, target) = socks5_accept_one(&proxy).await;
    assert_eq!(target, Target::Ip("10.0.0.5:80".parse().unwrap()));

    let request = b"GET / HTTP/1.0\r\n\r\n";
    client.write_all(request).await.unwrap();
    let mut got = vec![0u8; request.len()];
    remote.read_exact(&mut got).await.unwrap();
    assert_eq!(got, request);

    let response = b"HTTP/1.0 200 OK\r\n\r\nhello";
    remote.write_all(response).await.unwrap();
    let mut got = vec![0u8; response.len()];
    client.read_exact(&mut got).await.unwrap();
    assert_eq!(got, response);

    cancel.cancel();
    tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn socks5h_passes_hostname_to_proxy() {
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    let local = free_addr().await;

    let tunnel = Tunnel::new(&format!("socks5h://{proxy_addr}"), Duration::ZERO).unwrap();
    tunnel.add("internal", &local, "backend.internal:8443");
    let cancel = CancellationToken::new();
    let running = spawn_tunnel(tunnel, cancel.clone());

    let _client = connect(&local).await;
    let (_remote, target) = socks5_accept_one(&proxy).await;
    assert_eq!(target, Target::Domain("backend.internal".into(), 8443));

    cancel.cancel();
    tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn duplicate_local_address_fails_the_whole_tunnel() {
    let shared = free_addr().await;
    let other = free_addr().await;

    let tunnel = Tunnel::with_dialer(Arc::new(DirectDialer), Duration::ZERO);
    tunnel.add("first", &shared, "127.0.0.1:9");
    tunnel.add("second", &shared, "127.0.0.1:9");
    tunnel.add("bystander", &other, "127.0.0.1:9");

    let result = tokio::time::timeout(WAIT, tunnel.run(CancellationToken::new()))
        .await
        .expect("tunnel did not shut down after bind failure");
    match result {
        Err(TunnelError::Bind { addr, .. }) => assert_eq!(addr, shared),
        other => panic!("expected bind failure, got {other:?}"),
    }

    // Every listener, including the healthy one, has been released.
    assert!(TcpStream::connect(&other).await.is_err());
    assert!(TcpStream::connect(&shared).await.is_err());
}

#[tokio::test]
async fn cancellation_stops_listeners_but_not_transfers() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap().to_string();
    let local = free_addr().await;

    let tunnel = Tunnel::with_dialer(Arc::new(DirectDialer), Duration::ZERO);
    tunnel.add("svc", &local, &upstream_addr);
    let cancel = CancellationToken::new();
    let running = spawn_tunnel(tunnel, cancel.clone());

    let mut client = connect(&local).await;
    let (mut server, _) = upstream.accept().await.unwrap();

    // One round trip, so the dial has completed and both pumps are running.
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).await.unwrap();
    server.write_all(b"pong").await.unwrap();
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    cancel.cancel();
    tokio::time::timeout(WAIT, running)
        .await
        .expect("tunnel did not stop")
        .unwrap()
        .unwrap();

    assert!(TcpStream::connect(&local).await.is_err());

    client.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");

    server.write_all(b"and back").await.unwrap();
    let mut buf = [0u8; 8];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"and back");
}

#[tokio::test]
async fn cancellation_aborts_dials_still_in_progress() {
    // The proxy takes the TCP connection but never answers the greeting.
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    let (accepted_tx, accepted_rx) = oneshot::channel();
    let silent = tokio::spawn(async move {
        let (conn, _) = proxy.accept().await.unwrap();
        let _ = accepted_tx.send(());
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(conn);
    });
    let local = free_addr().await;

    let tunnel = Tunnel::new(&format!("socks5h://{proxy_addr}"), Duration::ZERO).unwrap();
    tunnel.add("stuck", &local, "backend.internal:80");
    let cancel = CancellationToken::new();
    let running = spawn_tunnel(tunnel, cancel.clone());

    let mut client = connect(&local).await;
    tokio::time::timeout(WAIT, accepted_rx).await.unwrap().unwrap();

    cancel.cancel();
    tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();

    // The abandoned dial closes the local connection.
    let mut buf = [0u8; 8];
    let closed = tokio::time::timeout(WAIT, client.read(&mut buf))
        .await
        .expect("local connection stayed open after its dial was cancelled");
    assert!(matches!(closed, Ok(0) | Err(_)));
    silent.abort();
}

#[tokio::test]
async fn large_payloads_survive_chunking_in_both_directions() {
    const LEN: usize = 1024 * 1024 + 17;
    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap().to_string();
    let local = free_addr().await;

    let tunnel = Tunnel::with_dialer(Arc::new(DirectDialer), Duration::ZERO);
    tunnel.add("bulk", &local, &upstream_addr);
    let cancel = CancellationToken::new();
    let running = spawn_tunnel(tunnel, cancel.clone());

    // Upstream echoes everything back.
    let (echoed_tx, echoed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (conn, _) = upstream.accept().await.unwrap();
        let (mut rd, mut wr) = conn.into_split();
        let copied = tokio::io::copy(&mut rd, &mut wr).await.unwrap();
        let _ = echoed_tx.send(copied);
    });

    let client = connect(&local).await;
    let (mut rd, mut wr) = client.into_split();
    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        wr.write_all(&to_send).await.unwrap();
        wr
    });

    let mut received = vec![0u8; LEN];
    tokio::time::timeout(WAIT, rd.read_exact(&mut received))
        .await
        .expect("echo did not arrive")
        .unwrap();
    assert!(received == payload, "payload corrupted in transit");

    drop(writer.await.unwrap());
    let copied = tokio::time::timeout(WAIT, echoed_rx).await.unwrap().unwrap();
    assert_eq!(copied, LEN as u64);

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn closing_either_side_closes_the_other() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap().to_string();
    let local = free_addr().await;

    let tunnel = Tunnel::with_dialer(Arc::new(DirectDialer), Duration::ZERO);
    tunnel.add("svc", &local, &upstream_addr);
    let cancel = CancellationToken::new();
    let running = spawn_tunnel(tunnel, cancel.clone());

    // Local side closes first.
    let client = connect(&local).await;
    let (mut server, _) = upstream.accept().await.unwrap();
    drop(client);
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(WAIT, server.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);

    // Remote side closes first.
    let mut client = connect(&local).await;
    let (server, _) = upstream.accept().await.unwrap();
    drop(server);
    let closed = tokio::time::timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn idle_connection_is_closed_at_deadline() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap().to_string();
    let local = free_addr().await;

    let tunnel = Tunnel::with_dialer(Arc::new(DirectDialer), Duration::from_millis(200));
    tunnel.add("slow", &local, &upstream_addr);
    let cancel = CancellationToken::new();
    let running = spawn_tunnel(tunnel, cancel.clone());

    let mut client = connect(&local).await;
    let (mut server, _) = upstream.accept().await.unwrap();

    let mut buf = [0u8; 8];
    let closed = tokio::time::timeout(WAIT, client.read(&mut buf))
        .await
        .expect("connection outlived its deadline");
    assert!(matches!(closed, Ok(0) | Err(_)));
    let closed = tokio::time::timeout(WAIT, server.read(&mut buf)).await.unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn dial_failure_only_affects_that_connection() {
    let dead = free_addr().await;
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap().to_string();
    let broken_local = free_addr().await;
    let healthy_local = free_addr().await;

    let tunnel = Tunnel::with_dialer(Arc::new(DirectDialer), Duration::ZERO);
    tunnel.add("broken", &broken_local, &dead);
    tunnel.add("healthy", &healthy_local, &upstream_addr);
    let cancel = CancellationToken::new();
    let running = spawn_tunnel(tunnel, cancel.clone());

    let mut client = connect(&broken_local).await;
    let mut buf = [0u8; 8];
    let closed = tokio::time::timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));

    // Both rules are still serving.
    let _again = connect(&broken_local).await;
    let mut client = connect(&healthy_local).await;
    let (mut server, _) = upstream.accept().await.unwrap();
    client.write_all(b"ok").await.unwrap();
    let mut two = [0u8; 2];
    server.read_exact(&mut two).await.unwrap();
    assert_eq!(&two, b"ok");

    assert!(!running.is_finished());
    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[test]
fn unparsable_proxy_uri_fails_before_any_listener() {
    assert!(Tunnel::new("socks5://[::1", Duration::ZERO).is_err());
    assert!(Tunnel::new("", Duration::ZERO).is_err());
}
