//! Router: the running {listener, handler, chain} triple (spec §3
//! Router, §6 Lifecycle surface).

use crate::chain::{Chain, ChainConnection};
use podlink_core::error::CoreError;
use podlink_transport::tcp::{is_transient_accept_error, TcpKeepAliveListener};
use podlink_transport::tun::{run_tun_handler, PacketForward, TunListener};
use podlink_transport::udp::{UdpDirectForwardHandler, UdpListener};
use podlink_transport::udp_over_tcp::serve_tunnel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::copy_bidirectional;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// What an accepted TCP connection should be forwarded to.
pub enum TcpHandlerKind {
    /// Dial `remote` directly; used when the route has no chain.
    DirectForward { remote: String },
    /// Dial through the chain; used when the route names chain nodes.
    Chain { chain: Arc<Chain> },
    /// Run the UDP-over-TCP server pump on the accepted connection.
    UdpTunnel,
}

async fn handle_tcp_connection(
    conn: tokio::net::TcpStream,
    kind: Arc<TcpHandlerKind>,
) -> Result<(), CoreError> {
    match kind.as_ref() {
        TcpHandlerKind::DirectForward { remote } => {
            podlink_transport::tcp_forward::direct_forward(conn, remote).await
        }
        TcpHandlerKind::Chain { chain } => {
            let upstream = chain.dial().await?;
            let mut conn = conn;
            match upstream {
                ChainConnection::Stream(mut stream) => {
                    copy_bidirectional(&mut conn, &mut stream).await.map_err(CoreError::Io)?;
                    Ok(())
                }
                ChainConnection::Tunnel(_) => Err(CoreError::config(
                    "tcp forward handler cannot terminate on a udp-over-tcp tunnel hop",
                )),
            }
        }
        TcpHandlerKind::UdpTunnel => serve_tunnel(conn).await,
    }
}

/// One running listener + handler + (borrowed) chain, per spec §3.
pub enum Router {
    Tcp {
        addr: String,
        listener: Arc<TcpKeepAliveListener>,
        handler: Arc<TcpHandlerKind>,
        closed: Arc<AtomicBool>,
    },
    Udp {
        addr: String,
        listener: Arc<UdpListener>,
        remote: std::net::SocketAddr,
        new_flows_rx: tokio::sync::Mutex<mpsc::Receiver<(std::net::SocketAddr, mpsc::Receiver<Vec<u8>>)>>,
        closed: Arc<AtomicBool>,
    },
    Tun {
        addr: String,
        tun: tokio::sync::Mutex<Option<TunListener>>,
        chain: Arc<Chain>,
        closed: Arc<AtomicBool>,
    },
}

struct ChainPacketForward {
    chain: Arc<Chain>,
}

#[async_trait::async_trait]
impl PacketForward for ChainPacketForward {
    async fn send(&self, packet: &[u8]) -> Result<(), CoreError> {
        // Each packet dials the chain independently; a production tun
        // router would cache the established connection across calls,
        // but that requires a stateful session the retrieved original
        // source does not specify in detail for non-UDP-tunnel chains.
        match self.chain.dial().await? {
            ChainConnection::Tunnel(conn) => conn.write(packet).await.map(|_| ()),
            ChainConnection::Stream(_) => Err(CoreError::config(
                "tun handler requires a udp-over-tcp tunnel chain",
            )),
        }
    }

    async fn recv(&self) -> Result<Vec<u8>, CoreError> {
        Err(CoreError::config(
            "tun reply path requires a persistent chain session",
        ))
    }
}

impl Router {
    pub fn new_tcp(addr: String, listener: TcpKeepAliveListener, handler: TcpHandlerKind) -> Self {
        Self::Tcp {
            addr,
            listener: Arc::new(listener),
            handler: Arc::new(handler),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn new_udp(
        addr: String,
        listener: UdpListener,
        remote: std::net::SocketAddr,
        new_flows_rx: mpsc::Receiver<(std::net::SocketAddr, mpsc::Receiver<Vec<u8>>)>,
    ) -> Self {
        Self::Udp {
            addr,
            listener: Arc::new(listener),
            remote,
            new_flows_rx: tokio::sync::Mutex::new(new_flows_rx),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn new_tun(addr: String, tun: TunListener, chain: Arc<Chain>) -> Self {
        Self::Tun {
            addr,
            tun: tokio::sync::Mutex::new(Some(tun)),
            chain,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn addr(&self) -> &str {
        match self {
            Router::Tcp { addr, .. } | Router::Udp { addr, .. } | Router::Tun { addr, .. } => addr,
        }
    }

    fn closed_flag(&self) -> &Arc<AtomicBool> {
        match self {
            Router::Tcp { closed, .. } | Router::Udp { closed, .. } | Router::Tun { closed, .. } => closed,
        }
    }

    /// Runs until the listener is closed or an unrecoverable error
    /// occurs (spec §6 Lifecycle surface).
    pub async fn serve(&self) -> Result<(), CoreError> {
        match self {
            Router::Tcp { listener, handler, closed, addr } => {
                info!(%addr, "router serving tcp");
                loop {
                    if closed.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    match listener.accept().await {
                        Ok((conn, peer)) => {
                            let handler = Arc::clone(handler);
                            tokio::spawn(async move {
                                if let Err(e) = handle_tcp_connection(conn, handler).await {
                                    warn!(%peer, error = %e, "tcp connection handler failed");
                                }
                            });
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            warn!(error = %e, "transient accept error, retrying");
                        }
                        Err(e) => return Err(CoreError::fatal(format!("accept failed: {e}"))),
                    }
                }
            }
            Router::Udp { listener, remote, new_flows_rx, closed, addr } => {
                info!(%addr, "router serving udp");
                let handler = Arc::new(UdpDirectForwardHandler::new(*remote));
                let listener_run = {
                    let listener = Arc::clone(listener);
                    async move { listener.run().await }
                };
                let dispatch = async {
                    let mut rx = new_flows_rx.lock().await;
                    loop {
                        if closed.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        match rx.recv().await {
                            Some((src, inbound)) => {
                                let handler = Arc::clone(&handler);
                                let reply = listener.reply_handle(src);
                                tokio::spawn(async move {
                                    if let Err(e) = handler.handle(inbound, reply).await {
                                        warn!(%src, error = %e, "udp flow handler failed");
                                    }
                                });
                            }
                            None => return Ok(()),
                        }
                    }
                };
                tokio::select! {
                    r = listener_run => r,
                    r = dispatch => r,
                }
            }
            Router::Tun { tun, chain, closed, addr } => {
                info!(%addr, "router serving tun");
                let device = {
                    let mut guard = tun.lock().await;
                    guard.take().ok_or(CoreError::Closed)?
                };
                let forward = ChainPacketForward { chain: Arc::clone(chain) };
                let result = run_tun_handler(device, forward).await;
                if closed.load(Ordering::SeqCst) {
                    return Ok(());
                }
                result
            }
        }
    }

    /// Idempotent: a second call is a no-op (spec §6: "`close` is
    /// idempotent").
    pub fn close(&self) {
        self.closed_flag().store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_before_serve_returns_immediately() {
        let listener = TcpKeepAliveListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let router = Router::new_tcp(
            addr,
            listener,
            TcpHandlerKind::DirectForward { remote: "127.0.0.1:1".into() },
        );
        router.close();
        let result = tokio::time::timeout(std::time::Duration::from_millis(200), router.serve()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let listener = TcpKeepAliveListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let router = Router::new_tcp(
            addr,
            listener,
            TcpHandlerKind::DirectForward { remote: "127.0.0.1:1".into() },
        );
        router.close();
        router.close();
        assert!(router.closed_flag().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tcp_direct_forward_relays_connection() {
        let remote = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();
        let echo = tokio::spawn(async move {
            let (mut sock, _) = remote.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut sock, &buf[..n]).await.unwrap();
        });

        let listener = TcpKeepAliveListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new_tcp(
            addr.to_string(),
            listener,
            TcpHandlerKind::DirectForward { remote: remote_addr.to_string() },
        );
        let router = Arc::new(router);
        let serve_task = tokio::spawn({
            let router = Arc::clone(&router);
            async move { router.serve().await }
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        router.close();
        echo.await.unwrap();
        serve_task.abort();
    }
}
