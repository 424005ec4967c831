//! TCP transport and keep-alive listener (spec §4.3).

use podlink_core::error::CoreError;
use podlink_core::types::DEFAULT_KEEP_ALIVE;
use socket2::TcpKeepalive;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tracing::{debug, warn};

/// Client-side TCP dialer.
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    pub dial_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            dial_timeout: podlink_core::types::DEFAULT_DIAL_TIMEOUT,
        }
    }
}

impl TcpTransport {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }

    /// Dials `addr`, mapping connect failures and resolver failures to
    /// the error taxonomy's `Unreachable`/`Resolve`/`Timeout` kinds.
    pub async fn dial(&self, addr: &str) -> Result<TcpStream, CoreError> {
        let resolved = tokio::net::lookup_host(addr)
            .await
            .map_err(|e| CoreError::resolve(format!("{addr}: {e}")))?
            .next()
            .ok_or_else(|| CoreError::resolve(format!("{addr}: no addresses")))?;

        match tokio::time::timeout(self.dial_timeout, TcpStream::connect(resolved)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                Ok(stream)
            }
            Ok(Err(e)) => Err(CoreError::unreachable(format!("{resolved}: {e}"))),
            Err(_) => Err(CoreError::timeout(format!("dial {resolved}"))),
        }
    }
}

/// A TCP listener that enables keep-alive and `TCP_NODELAY` on every
/// accepted connection, mirroring Go's `tcpKeepAliveListener`.
pub struct TcpKeepAliveListener {
    inner: TokioTcpListener,
    keep_alive: Duration,
}

impl TcpKeepAliveListener {
    pub async fn bind(addr: &str) -> Result<Self, CoreError> {
        Self::bind_with_keepalive(addr, DEFAULT_KEEP_ALIVE).await
    }

    pub async fn bind_with_keepalive(addr: &str, keep_alive: Duration) -> Result<Self, CoreError> {
        let inner = TokioTcpListener::bind(addr)
            .await
            .map_err(|e| CoreError::fatal(format!("bind {addr}: {e}")))?;
        Ok(Self { inner, keep_alive })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CoreError> {
        self.inner.local_addr().map_err(CoreError::Io)
    }

    /// Accepts the next connection, configuring keep-alive and
    /// `TCP_NODELAY`. Transient accept errors are retried by the
    /// caller (the router treats them as retryable); this method
    /// itself just surfaces whatever `io::Error` the OS returned.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        let (stream, peer) = self.inner.accept().await?;
        if let Err(e) = configure_keepalive(&stream, self.keep_alive) {
            warn!(%peer, error = %e, "failed to configure keep-alive on accepted connection");
        }
        stream.set_nodelay(true).ok();
        debug!(%peer, "accepted tcp connection");
        Ok((stream, peer))
    }
}

fn configure_keepalive(stream: &TcpStream, period: Duration) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);
    let ka = TcpKeepalive::new().with_time(period).with_interval(period);
    sock_ref.set_tcp_keepalive(&ka)
}

/// Classifies a listener accept error as retryable (transient network
/// condition) or terminal (listener closed / fatal OS error), per the
/// propagation policy in the error handling design.
pub fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_refused_is_unreachable() {
        let transport = TcpTransport::default();
        // Port 0 resolves but nothing is listening on an ephemeral
        // port we haven't bound; bind one, close it, then dial it.
        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = transport.dial(&addr.to_string()).await.unwrap_err();
        assert!(matches!(err, CoreError::Unreachable(_)));
    }

    #[tokio::test]
    async fn accept_sets_keepalive_and_nodelay() {
        let listener = TcpKeepAliveListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_side, _peer) = listener.accept().await.unwrap();
        let _client_side = client.await.unwrap();
        assert!(server_side.nodelay().unwrap());
    }
}
