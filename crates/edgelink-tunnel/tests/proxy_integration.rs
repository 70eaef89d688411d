//! Stream proxy integration tests against a real TCP gateway.

use std::time::Duration;

use edgelink_tunnel::proxy::proxy;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

#[tokio::test]
async fn test_large_transfer_survives_both_directions() {
    let gateway = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap().to_string();

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    // Echo server: read everything, send it back.
    let gateway_task = tokio::spawn(async move {
        let (mut socket, _) = gateway.accept().await.unwrap();
        let mut received = vec![0u8; expected.len()];
        socket.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        socket.write_all(&received).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let (broker_side, agent_side) = tokio::io::duplex(16 * 1024);
    let proxy_task = tokio::spawn(async move { proxy(agent_side, &gateway_addr).await });

    let sent = payload.clone();
    let writer = tokio::spawn(async move {
        let (mut read_half, mut write_half) = tokio::io::split(broker_side);

        let write = async move {
            write_half.write_all(&sent).await.unwrap();
            write_half.shutdown().await.unwrap();
        };
        let read = async move {
            let mut echoed = Vec::new();
            read_half.read_to_end(&mut echoed).await.unwrap();
            echoed
        };

        let ((), echoed) = tokio::join!(write, read);
        echoed
    });

    let echoed = timeout(Duration::from_secs(10), writer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);

    gateway_task.await.unwrap();
    proxy_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_gateway_close_propagates_to_broker_side() {
    let gateway = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = gateway.local_addr().unwrap().to_string();

    let gateway_task = tokio::spawn(async move {
        let (mut socket, _) = gateway.accept().await.unwrap();
        socket.write_all(b"bye").await.unwrap();
        // Dropping the socket closes both directions towards the proxy.
    });

    let (mut broker_side, agent_side) = tokio::io::duplex(4096);
    let proxy_task = tokio::spawn(async move { proxy(agent_side, &gateway_addr).await });

    let mut buf = [0u8; 3];
    broker_side.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"bye");

    // The gateway is gone; the broker side must observe EOF.
    let n = timeout(Duration::from_secs(5), broker_side.read(&mut [0u8; 1]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    gateway_task.await.unwrap();
    drop(broker_side);
    let _ = proxy_task.await.unwrap();
}
