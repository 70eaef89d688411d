//! Byte shuttling between an accepted sub-stream and the local gateway.

use std::io;

use thiserror::Error;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Errors from proxying one sub-stream.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connect to gateway {address}: {source}")]
    Connect {
        address: String,
        source: io::Error,
    },

    #[error("copy: {0}")]
    Copy(#[from] io::Error),
}

/// Dials `gateway_addr` and copies bytes in both directions until either side
/// closes, propagating each EOF to the opposite write half. Returns once both
/// directions have finished, with the first copy error if any.
///
/// A dial failure is the caller's to report; it never tears the parent tunnel
/// down.
pub async fn proxy<S>(mut sub_stream: S, gateway_addr: &str) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut gateway =
        TcpStream::connect(gateway_addr)
            .await
            .map_err(|source| ProxyError::Connect {
                address: gateway_addr.to_string(),
                source,
            })?;

    let (to_gateway, to_broker) = copy_bidirectional(&mut sub_stream, &mut gateway).await?;

    debug!(
        gateway_addr,
        bytes_to_gateway = to_gateway,
        bytes_to_broker = to_broker,
        "proxy finished"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let gateway = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway_addr = gateway.local_addr().unwrap().to_string();

        let gateway_task = tokio::spawn(async move {
            let (mut socket, _) = gateway.accept().await.unwrap();
            let mut buf = [0u8; 8];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping-req");
            socket.write_all(b"pong-rsp").await.unwrap();
            // Read to EOF so the proxy can finish both directions.
            let mut rest = Vec::new();
            socket.read_to_end(&mut rest).await.unwrap();
        });

        let (mut broker_side, agent_side) = tokio::io::duplex(4096);
        let proxy_task = tokio::spawn(async move { proxy(agent_side, &gateway_addr).await });

        broker_side.write_all(b"ping-req").await.unwrap();

        let mut buf = [0u8; 8];
        broker_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong-rsp");

        // Closing the broker side propagates EOF through to the gateway.
        drop(broker_side);

        gateway_task.await.unwrap();
        proxy_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (_broker_side, agent_side) = tokio::io::duplex(4096);
        match proxy(agent_side, &addr).await {
            Err(ProxyError::Connect { address, .. }) => assert_eq!(address, addr),
            other => panic!("expected connect error, got {other:?}"),
        }
    }
}
