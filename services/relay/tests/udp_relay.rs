
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{closed_udp_port, spawn_udp_relay, UdpEchoBackend, UDP_BACKEND_IP};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use uproxy_proxy_protocol::{parse_proxy_v2, Transport, HEADER_LEN};
use uproxy_relay::proxy::DEFAULT_IDLE_TIMEOUT;

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn marker_datagram_carries_header() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let (relay_addr, relay) = spawn_udp_relay(backend.addr, DEFAULT_IDLE_TIMEOUT)
        .await
        .unwrap();

    let client = client().await;
    let client_addr = client.local_addr().unwrap();

    client.send_to(&[0x01, b'h', b'i'], relay_addr).await.unwrap();
    let echoed = recv(&client).await;

    let received = backend.wait_for(1).await;
    let (session_addr, datagram) = &received[0];
    assert_eq!(datagram.len(), HEADER_LEN + 3);

    let (header, consumed) = parse_proxy_v2(datagram).expect("header expected");
    assert_eq!(consumed, HEADER_LEN);
    assert_eq!(header.transport, Transport::Udp);
    assert_eq!(SocketAddr::V4(header.src_addr), client_addr);
    assert_eq!(SocketAddr::V4(header.dst_addr), backend.addr);
    assert_eq!(&datagram[HEADER_LEN..], &[0x01, b'h', b'i']);

    // The backend echoed the whole datagram, header included.
    assert_eq!(&echoed, datagram);

    // Further datagrams of the session go out bare, on the same socket.
    client.send_to(&[0x02, b'x'], relay_addr).await.unwrap();
    recv(&client).await;
    let received = backend.wait_for(2).await;
    assert_eq!(received[1].0, *session_addr);
    assert_eq!(received[1].1, vec![0x02, b'x']);

    let sessions = relay.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].header_sent);
    assert_eq!(sessions[0].client_addr, client_addr);
    assert_eq!(sessions[0].local_port, session_addr.port());
}

#[tokio::test]
async fn unmarked_first_datagram_is_sent_bare() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let (relay_addr, relay) = spawn_udp_relay(backend.addr, DEFAULT_IDLE_TIMEOUT)
        .await
        .unwrap();

    let client = client().await;
    client.send_to(&[0x02, 0xaa], relay_addr).await.unwrap();
    recv(&client).await;

    let received = backend.wait_for(1).await;
    assert_eq!(received[0].1, vec![0x02, 0xaa]);

    let sessions = relay.sessions().await;
    assert!(!sessions[0].header_sent);

    // A later marker still triggers the header once.
    client.send_to(&[0x05], relay_addr).await.unwrap();
    recv(&client).await;
    let received = backend.wait_for(2).await;
    assert_eq!(received[1].1.len(), HEADER_LEN + 1);

    client.send_to(&[0x01], relay_addr).await.unwrap();
    recv(&client).await;
    let received = backend.wait_for(3).await;
    assert_eq!(received[2].1, vec![0x01]);
}

#[tokio::test]
async fn responses_go_to_their_own_client() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let (relay_addr, relay) = spawn_udp_relay(backend.addr, DEFAULT_IDLE_TIMEOUT)
        .await
        .unwrap();

    let first = client().await;
    let second = client().await;

    first.send_to(&[0x02, b'A'], relay_addr).await.unwrap();
    second.send_to(&[0x02, b'B'], relay_addr).await.unwrap();

    assert_eq!(recv(&first).await, vec![0x02, b'A']);
    assert_eq!(recv(&second).await, vec![0x02, b'B']);

    let received = backend.wait_for(2).await;
    assert_ne!(received[0].0, received[1].0, "each client gets its own socket");

    assert_eq!(relay.sessions().await.len(), 2);
    assert_eq!(relay.stats().sessions_created.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn backend_port_is_rewritten_in_responses() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let (relay_addr, _relay) = spawn_udp_relay(backend.addr, DEFAULT_IDLE_TIMEOUT)
        .await
        .unwrap();

    let client = client().await;
    let mut payload = vec![0x02];
    let advertised = format!("addr={}:{:05}", UDP_BACKEND_IP, backend.addr.port());
    payload.extend_from_slice(advertised.as_bytes());
    client.send_to(&payload, relay_addr).await.unwrap();

    let echoed = recv(&client).await;
    let expected = format!("addr={}:{:05}", UDP_BACKEND_IP, relay_addr.port());
    assert_eq!(&echoed[1..], expected.as_bytes());
}

#[tokio::test]
async fn idle_session_is_replaced() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let (relay_addr, relay) = spawn_udp_relay(backend.addr, Duration::from_millis(200))
        .await
        .unwrap();

    let client = client().await;
    client.send_to(&[0x01, b'1'], relay_addr).await.unwrap();
    recv(&client).await;

    tokio::time::sleep(Duration::from_millis(400)).await;

    client.send_to(&[0x01, b'2'], relay_addr).await.unwrap();
    recv(&client).await;

    let received = backend.wait_for(2).await;
    assert_ne!(received[0].0, received[1].0, "a new session socket is used");
    // The replacement session starts over and sends the header again.
    assert_eq!(received[1].1.len(), HEADER_LEN + 2);

    let stats = relay.stats();
    assert_eq!(stats.sessions_created.load(Ordering::Relaxed), 2);
    assert_eq!(stats.sessions_evicted.load(Ordering::Relaxed), 1);
    assert_eq!(relay.sessions().await.len(), 1);
}

#[tokio::test]
async fn backend_socket_error_evicts_session() {
    let port = closed_udp_port().await;
    let backend: SocketAddr = format!("{}:{}", UDP_BACKEND_IP, port).parse().unwrap();
    let (relay_addr, relay) = spawn_udp_relay(backend, DEFAULT_IDLE_TIMEOUT)
        .await
        .unwrap();

    let client = client().await;
    client.send_to(&[0x01], relay_addr).await.unwrap();

    for _ in 0..200 {
        if relay.stats().sessions_created.load(Ordering::Relaxed) == 1
            && relay.sessions().await.is_empty()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session towards an unreachable backend was not evicted");
}

#[tokio::test]
async fn late_backend_reply_to_idle_session_is_dropped() {
    let backend = UdpSocket::bind((UDP_BACKEND_IP, 0)).await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let (relay_addr, relay) = spawn_udp_relay(backend_addr, Duration::from_millis(200))
        .await
        .unwrap();

    let client = client().await;
    client.send_to(&[0x02, b'q'], relay_addr).await.unwrap();

    let mut buf = [0u8; 64];
    let (_, session_addr) = timeout(Duration::from_secs(2), backend.recv_from(&mut buf))
        .await
        .expect("timed out waiting for the relayed datagram")
        .unwrap();

    // Reply only after the session went idle.
    tokio::time::sleep(Duration::from_millis(400)).await;
    backend.send_to(b"late", session_addr).await.unwrap();

    let mut reply = [0u8; 64];
    let late = timeout(Duration::from_millis(500), client.recv_from(&mut reply)).await;
    assert!(late.is_err(), "an idle session must not forward backend data");

    let stats = relay.stats();
    assert!(relay.sessions().await.is_empty());
    assert_eq!(stats.sessions_evicted.load(Ordering::Relaxed), 1);
    assert_eq!(stats.packets_to_client.load(Ordering::Relaxed), 0);
    assert_eq!(stats.packets_dropped.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn backend_datagram_without_session_is_dropped() {
    let backend = UdpEchoBackend::spawn().await.unwrap();
    let (relay_addr, relay) = spawn_udp_relay(backend.addr, DEFAULT_IDLE_TIMEOUT)
        .await
        .unwrap();

    // Same IP as the backend, so the relay treats it as backend traffic.
    let stray = UdpSocket::bind((UDP_BACKEND_IP, 0)).await.unwrap();
    stray.send_to(&[0x02, b'z'], relay_addr).await.unwrap();

    let stats = relay.stats();
    for _ in 0..200 {
        if stats.packets_dropped.load(Ordering::Relaxed) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(stats.packets_dropped.load(Ordering::Relaxed), 1);
    assert_eq!(stats.sessions_created.load(Ordering::Relaxed), 0);
    assert_eq!(stats.packets_to_client.load(Ordering::Relaxed), 0);
    assert!(relay.sessions().await.is_empty());
    assert!(backend.received().await.is_empty());
}
