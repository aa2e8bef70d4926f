
use std::net::SocketAddr;
use std::time::Duration;

use harness::{free_port, ProxyV2Backend};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use uproxy_relay::{Config, RelayError, RelaySupervisor};

async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("relay never started listening on {}", addr);
}

fn write_config(dir: &tempfile::TempDir, json: &str) -> Config {
    let path = dir.path().join("config.json");
    std::fs::write(&path, json).unwrap();
    Config::load(&path).unwrap()
}

#[tokio::test]
async fn bind_failure_leaves_other_routes_running() {
    let backend = ProxyV2Backend::spawn().await.unwrap();

    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken_port = taken.local_addr().unwrap().port();
    let good_port = free_port().await;

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        &format!(
            r#"{{
                "debugMode": true,
                "proxies": [
                    {{ "listenPort": {taken}, "listenIp": "127.0.0.1", "serverHost": "127.0.0.1", "serverPort": {backend}, "protoTCP": true }},
                    {{ "listenPort": {good}, "listenIp": "127.0.0.1", "serverHost": "127.0.0.1", "serverPort": {backend}, "protoTCP": true }}
                ]
            }}"#,
            taken = taken_port,
            good = good_port,
            backend = backend.addr.port(),
        ),
    );

    let supervisor = RelaySupervisor::from_config(&config).unwrap();
    let running = tokio::spawn(supervisor.run());

    let mut client = connect_with_retry(format!("127.0.0.1:{}", good_port).parse().unwrap()).await;
    client.write_all(b"hello").await.unwrap();
    let mut ack = [0u8; 3];
    timeout(Duration::from_secs(2), client.read_exact(&mut ack))
        .await
        .expect("timed out waiting for ack")
        .unwrap();
    assert_eq!(&ack, b"ack");

    let received = backend.received().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].payload, b"hello");

    assert!(!running.is_finished(), "one live route keeps the supervisor up");
    running.abort();
}

#[tokio::test]
async fn supervisor_stops_once_every_route_failed() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        &dir,
        &format!(
            r#"{{
                "proxies": [
                    {{ "listenPort": {port}, "listenIp": "127.0.0.1", "serverHost": "127.0.0.1", "serverPort": 9, "protoTCP": true }}
                ],
                "reverseProxies": [
                    {{ "listenPort": {https}, "listenIp": "127.0.0.1", "certFile": "{dir}/missing.pem",
                       "keyFile": "{dir}/missing.key", "serverHost": "127.0.0.1:9", "serverProto": "http" }}
                ]
            }}"#,
            port = port,
            https = free_port().await,
            dir = dir.path().display(),
        ),
    );

    let result = timeout(
        Duration::from_secs(5),
        RelaySupervisor::from_config(&config).unwrap().run(),
    )
    .await
    .expect("supervisor should stop");

    assert!(matches!(result, Err(RelayError::AllRoutesStopped)));
}
