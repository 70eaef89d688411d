//! One task per tunnel: dial the broker, upgrade, multiplex, accept.

use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tokio_tungstenite::client_async_tls;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_yamux::config::Config as MuxConfig;
use tokio_yamux::session::Session;
use tracing::{debug, error};
use url::Url;

use crate::dial::{self, DialError};
use crate::listener::{AcceptError, TunnelListener};
use crate::manager::TunnelRecord;
use crate::proxy;
use crate::websocket::WsByteStream;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Mux parameters. The broker is configured symmetrically; changing them is
/// a protocol change.
fn mux_config() -> MuxConfig {
    MuxConfig {
        accept_backlog: 256,
        enable_keepalive: true,
        keepalive_interval: Duration::from_secs(30),
        connection_write_timeout: Duration::from_secs(10),
        max_stream_window_size: 256 * 1024,
        ..MuxConfig::default()
    }
}

/// Tunnel setup and accept-loop errors.
#[derive(Debug, Error)]
pub(crate) enum TunnelError {
    #[error("parse broker endpoint {url}: {reason}")]
    InvalidBrokerEndpoint { url: String, reason: String },

    #[error("bearer token is not a valid header value")]
    InvalidToken,

    #[error("websocket handshake timed out")]
    HandshakeTimeout,

    #[error("connect: {0}")]
    Connect(#[from] DialError),

    #[error("dial: {0}")]
    Dial(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("expected protocol switching, got: {0}")]
    UnexpectedStatus(StatusCode),

    #[error("accept: {0}")]
    Accept(tokio_yamux::error::Error),

    #[error("no usable port in cluster endpoint {0:?}")]
    InvalidClusterEndpoint(String),
}

/// Runs one tunnel from dial to accept-loop exit.
pub(crate) struct TunnelRunner {
    pub(crate) tunnel_id: String,
    pub(crate) broker_endpoint: String,
    pub(crate) cluster_endpoint: String,
    pub(crate) token: String,
    pub(crate) gateway_host: String,
}

impl TunnelRunner {
    /// Dials the broker and serves inbound sub-streams until the listener is
    /// closed from the registry side or the session dies.
    ///
    /// The listener handle is published on `record` once the mux session is
    /// up; teardown is driven from there, never from in here.
    pub(crate) async fn run(&self, record: &TunnelRecord) -> Result<(), TunnelError> {
        let url = broker_url(&self.broker_endpoint, &self.tunnel_id)?;
        let host = url
            .host_str()
            .ok_or_else(|| TunnelError::InvalidBrokerEndpoint {
                url: self.broker_endpoint.clone(),
                reason: "no host".to_string(),
            })?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| TunnelError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        // The TCP connection goes through the environment's proxy when one
        // applies; client_async_tls layers TLS on top for wss targets.
        let handshake = async {
            let stream = dial::connect_tcp(url.scheme(), &host, port).await?;
            Ok::<_, TunnelError>(client_async_tls(request, stream).await?)
        };
        let (socket, response) = timeout(HANDSHAKE_TIMEOUT, handshake)
            .await
            .map_err(|_| TunnelError::HandshakeTimeout)??;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(TunnelError::UnexpectedStatus(response.status()));
        }

        let session = Session::new_client(WsByteStream::new(socket), mux_config());
        let (mut listener, handle) = TunnelListener::new(session);
        *record.listener.lock().await = Some(handle);

        debug!(tunnel_id = %self.tunnel_id, url = %url, "tunnel established");

        loop {
            let sub_stream = match listener.accept().await {
                Ok(stream) => stream,
                Err(AcceptError::Closed) => {
                    debug!(tunnel_id = %self.tunnel_id, "listener closed");
                    return Ok(());
                }
                Err(AcceptError::Session(err)) => return Err(TunnelError::Accept(err)),
            };

            let port = cluster_port(&self.cluster_endpoint)?;
            let gateway_addr = format!("{}:{}", self.gateway_host, port);
            let tunnel_id = self.tunnel_id.clone();
            tokio::spawn(async move {
                if let Err(err) = proxy::proxy(sub_stream, &gateway_addr).await {
                    error!(tunnel_id = %tunnel_id, error = %err, "unable to proxy to gateway");
                }
            });
        }
    }
}

/// Appends the tunnel id as a path segment to the broker endpoint.
fn broker_url(broker_endpoint: &str, tunnel_id: &str) -> Result<Url, TunnelError> {
    let mut url = Url::parse(broker_endpoint).map_err(|err| TunnelError::InvalidBrokerEndpoint {
        url: broker_endpoint.to_string(),
        reason: err.to_string(),
    })?;

    url.path_segments_mut()
        .map_err(|_| TunnelError::InvalidBrokerEndpoint {
            url: broker_endpoint.to_string(),
            reason: "cannot be a base".to_string(),
        })?
        .pop_if_empty()
        .push(tunnel_id);

    Ok(url)
}

/// The port half of `host:port`; the host half is ignored on purpose, the
/// operator supplies the gateway host.
fn cluster_port(cluster_endpoint: &str) -> Result<u16, TunnelError> {
    cluster_endpoint
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| TunnelError::InvalidClusterEndpoint(cluster_endpoint.to_string()))
}
