//! UDP-over-TCP: the keystone of the tunnel core (spec §4.5).
//!
//! Client side: [`TunnelConnector`] turns an already-dialled TCP
//! connection into a packet-socket (`read_from`/`write_to`) that frames
//! each datagram with [`crate::codec`]. Server side: [`serve_tunnel`]
//! opens a fresh ephemeral UDP socket per accepted TCP connection and
//! runs the two-pump `errc` pattern described in spec §4.5 and §9.

use crate::codec::{encode, read_datagram, ANCHOR_ADDR};
use podlink_core::error::CoreError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Client-side UDP-over-TCP adapter. Presents a packet-socket contract
/// over an already-connected TCP stream.
///
/// A pre-read deadline of `connect_timeout` guards only the initial
/// handshake; after the first successful read or write no deadline is
/// installed, since the adapter is meant for long-lived tunnels.
#[derive(Debug)]
pub struct TunnelConnector<C> {
    conn: Mutex<C>,
    target: SocketAddr,
    closed: std::sync::atomic::AtomicBool,
}

impl<C> TunnelConnector<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(conn: C, target: SocketAddr) -> Self {
        Self {
            conn: Mutex::new(conn),
            target,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_closed(&self) -> Result<(), CoreError> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    /// Encodes and writes one datagram, ignoring `addr` beyond
    /// documentation purposes — the framing codec carries no address,
    /// per the Open Question decision (the anchor scheme).
    pub async fn write_to(&self, buf: &[u8], _addr: SocketAddr) -> Result<usize, CoreError> {
        self.check_closed()?;
        let framed = encode(buf)?;
        let mut conn = self.conn.lock().await;
        match conn.write_all(&framed).await {
            Ok(()) => Ok(buf.len()),
            Err(e) => {
                self.mark_closed();
                Err(CoreError::Io(e))
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize, CoreError> {
        self.write_to(buf, self.target).await
    }

    /// Decodes the next datagram, returning the conventional anchor
    /// address alongside the payload.
    pub async fn read_from(&self) -> Result<(Vec<u8>, SocketAddr), CoreError> {
        self.check_closed()?;
        let mut conn = self.conn.lock().await;
        match read_datagram(&mut *conn).await {
            Ok(pkt) => {
                let addr = pkt.addr();
                Ok((pkt.data, addr))
            }
            Err(e) => {
                self.mark_closed();
                Err(e)
            }
        }
    }

    pub async fn read(&self) -> Result<Vec<u8>, CoreError> {
        self.read_from().await.map(|(data, _)| data)
    }
}

/// Applies `connect_timeout` to the first read/write only; callers
/// invoke this around the initial handshake exchange, then fall back
/// to plain `read`/`write` for the long-lived tunnel.
pub async fn with_connect_timeout<F, T>(timeout: Duration, fut: F) -> Result<T, CoreError>
where
    F: std::future::Future<Output = Result<T, CoreError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| CoreError::timeout("udp-over-tcp handshake"))?
}

/// Server-side handling of one accepted TCP connection in tunnel mode.
///
/// Opens a fresh local UDP socket on an ephemeral port (the "peer"
/// face), then runs exactly two pumps sharing that socket and the TCP
/// connection, per spec §4.5:
///
/// - TCP→UDP: decodes a datagram off the TCP connection and writes its
///   payload to the UDP socket, targeting the first client address
///   observed on the UDP face (the relay's single-`clientAddr` scheme:
///   one TCP connection backs exactly one learned client address).
/// - UDP→TCP: reads any datagram from the UDP socket, frames it, and
///   writes it to the TCP connection.
///
/// The first fatal error from either pump is reported via a
/// capacity-2 channel; the handler returns on the first receipt and
/// closes the UDP socket (the TCP connection's lifetime is the
/// caller's responsibility).
pub async fn serve_tunnel<C>(tcp: C) -> Result<(), CoreError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let udp = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| CoreError::resource(format!("ephemeral udp bind failed: {e}")))?;
    serve_tunnel_on(udp, tcp).await
}

/// Same as [`serve_tunnel`] but over a caller-supplied UDP socket,
/// letting a caller (or a test) observe the bound address before the
/// pumps start.
pub async fn serve_tunnel_on<C>(udp: UdpSocket, tcp: C) -> Result<(), CoreError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!(local = %udp.local_addr().map_err(CoreError::Io)?, "udp-tun peer face opened");

    let udp = std::sync::Arc::new(udp);
    let client_addr = std::sync::Arc::new(Mutex::new(None::<SocketAddr>));
    let (errc_tx, mut errc_rx) = mpsc::channel::<CoreError>(2);
    let (mut tcp_read, tcp_write) = tokio::io::split(tcp);
    let tcp_write = std::sync::Arc::new(Mutex::new(tcp_write));

    // TCP→UDP pump: decodes frames off the TCP connection and writes
    // their payload to the UDP face, targeting the first client
    // address observed there.
    let tcp_to_udp = {
        let udp = std::sync::Arc::clone(&udp);
        let client_addr = std::sync::Arc::clone(&client_addr);
        let errc = errc_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_datagram(&mut tcp_read).await {
                    Ok(pkt) => {
                        let dest = *client_addr.lock().await;
                        match dest {
                            Some(dest) => {
                                if let Err(e) = udp.send_to(&pkt.data, dest).await {
                                    let _ = errc.send(CoreError::Io(e)).await;
                                    return;
                                }
                            }
                            None => {
                                warn!("udp-tun: dropping frame, no client address learned yet");
                            }
                        }
                    }
                    Err(e) => {
                        let _ = errc.send(e).await;
                        return;
                    }
                }
            }
        })
    };

    // UDP→TCP pump: learns the client address from the first datagram
    // observed on the UDP face, then frames and forwards every
    // subsequent datagram to the TCP side.
    let udp_to_tcp = {
        let udp = std::sync::Arc::clone(&udp);
        let client_addr = std::sync::Arc::clone(&client_addr);
        let tcp_write = std::sync::Arc::clone(&tcp_write);
        let errc = errc_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; podlink_core::types::MIN_POOLED_BUFFER];
            loop {
                match udp.recv_from(&mut buf).await {
                    Ok((n, peer)) => {
                        {
                            let mut guard = client_addr.lock().await;
                            if guard.is_none() {
                                *guard = Some(peer);
                            }
                        }
                        let mut writer = tcp_write.lock().await;
                        if let Err(e) = crate::codec::write_datagram(&mut *writer, &buf[..n]).await {
                            let _ = errc.send(e).await;
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = errc.send(CoreError::Io(e)).await;
                        return;
                    }
                }
            }
        })
    };

    drop(errc_tx);
    let first_error = errc_rx.recv().await;
    tcp_to_udp.abort();
    udp_to_tcp.abort();

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The anchor address a decoded frame carries when no real peer has
/// been learned yet. Exposed for callers that need to recognise it.
pub fn anchor_addr() -> SocketAddr {
    ANCHOR_ADDR
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn client_writes_three_datagrams_server_receives_in_order() {
        let (client_side, server_side) = duplex(4096);
        let connector = TunnelConnector::new(client_side, ANCHOR_ADDR);

        connector.write(b"ping-1").await.unwrap();
        connector.write(b"ping-2").await.unwrap();
        connector.write(b"ping-3").await.unwrap();
        drop(connector);

        let mut server_side = server_side;
        let p1 = read_datagram(&mut server_side).await.unwrap();
        let p2 = read_datagram(&mut server_side).await.unwrap();
        let p3 = read_datagram(&mut server_side).await.unwrap();
        assert_eq!(p1.data, b"ping-1");
        assert_eq!(p2.data, b"ping-2");
        assert_eq!(p3.data, b"ping-3");
    }

    #[tokio::test]
    async fn decode_error_closes_adapter() {
        let (client_side, mut server_side) = duplex(16);
        let connector = TunnelConnector::new(client_side, ANCHOR_ADDR);
        // Write a malformed header claiming more data than will ever arrive, then close.
        server_side.write_all(&[0u8, 200]).await.unwrap();
        drop(server_side);
        let err = connector.read().await.unwrap_err();
        assert!(matches!(err, CoreError::Framing(_) | CoreError::Closed));
        let err2 = connector.read().await.unwrap_err();
        assert!(matches!(err2, CoreError::Closed));
    }

    #[tokio::test]
    async fn pumps_relay_both_directions_once_client_addr_is_learned() {
        let server_udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_udp_addr = server_udp.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (mut client_tcp, server_tcp) = duplex(4096);
        let server_task = tokio::spawn(serve_tunnel_on(server_udp, server_tcp));

        // The peer speaks first so the udp->tcp pump learns its address.
        peer.send_to(b"hello-from-peer", server_udp_addr).await.unwrap();
        let forwarded = read_datagram(&mut client_tcp).await.unwrap();
        assert_eq!(forwarded.data, b"hello-from-peer");

        // Now the client can reach the peer through the tcp->udp pump.
        let framed = encode(b"hello-from-client").unwrap();
        client_tcp.write_all(&framed).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello-from-client");
        assert_eq!(from, server_udp_addr);

        drop(client_tcp);
        let _ = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_tcp_frame_terminates_pump_with_error() {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (mut client_tcp, server_tcp) = duplex(16);
        let server_task = tokio::spawn(serve_tunnel_on(udp, server_tcp));

        client_tcp.write_all(&[0xFFu8, 0xFF]).await.unwrap();
        drop(client_tcp);

        let result = server_task.await.unwrap();
        assert!(result.is_err());
    }
}
