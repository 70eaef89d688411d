//! Close-aware wrapper around the yamux session.
//!
//! Once a session goes away, yamux yields a generic error much like an OS
//! listener returning "use of closed network connection". The wrapper records
//! intentional closes in a shared flag so the accept loop can tell shutdown
//! apart from real failures and exit without log-spam.

use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio_yamux::error::Error as YamuxError;
use tokio_yamux::session::Session;
use tokio_yamux::stream::StreamHandle;
use tokio_yamux::Control;

/// Accept-side errors.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener was closed on purpose, or the session reached
    /// end-of-stream.
    #[error("listener closed")]
    Closed,

    #[error("mux session: {0}")]
    Session(YamuxError),
}

/// Errors yamux uses to say the session itself is over, the equivalent of
/// end-of-stream from an OS listener.
fn is_session_end(err: &YamuxError) -> bool {
    matches!(err, YamuxError::SessionShutdown | YamuxError::RemoteGoAway)
}

/// Accept half of the listener, owned by the tunnel runner.
pub struct TunnelListener<S> {
    session: Session<S>,
    closed: Arc<RwLock<bool>>,
}

/// Close half of the listener, published on the tunnel record and driven by
/// the registry.
#[derive(Clone)]
pub struct ListenerHandle {
    control: Control,
    closed: Arc<RwLock<bool>>,
}

impl<S> TunnelListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a mux session, returning the accept half and the close handle.
    pub fn new(session: Session<S>) -> (Self, ListenerHandle) {
        let closed = Arc::new(RwLock::new(false));
        let handle = ListenerHandle {
            control: session.control(),
            closed: closed.clone(),
        };
        (Self { session, closed }, handle)
    }

    /// Returns the next inbound sub-stream.
    ///
    /// Polling this also drives I/O for every sub-stream already accepted
    /// from the session, so the accept loop must keep calling it.
    pub async fn accept(&mut self) -> Result<StreamHandle, AcceptError> {
        match self.session.next().await {
            Some(Ok(stream)) => Ok(stream),
            Some(Err(err)) => {
                // Read lock only: accepts must not starve a concurrent close.
                // A session-level end counts as a normal close even when the
                // remote initiated it.
                if *self.closed.read().await || is_session_end(&err) {
                    return Err(AcceptError::Closed);
                }
                Err(AcceptError::Session(err))
            }
            None => Err(AcceptError::Closed),
        }
    }
}

impl ListenerHandle {
    /// Marks the listener closed, then shuts the session down.
    ///
    /// The flag is set before the session close so a concurrent `accept`
    /// never reports the resulting error as a failure. Safe to call more
    /// than once; the mux control channel ignores repeated shutdowns.
    pub async fn close(&mut self) {
        *self.closed.write().await = true;
        self.control.close().await;
    }
}
