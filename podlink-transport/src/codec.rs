//! Datagram packet framing for UDP-over-TCP (spec §4.1).
//!
//! Wire format: a 16-bit big-endian length, then exactly that many
//! payload bytes. No version byte, no checksum — the TCP layer
//! supplies reliability and a framing mismatch is fatal to the
//! connection.
//!
//! The address a datagram represents is never carried on the wire.
//! Both the client connector (`udp_over_tcp::TunnelConnector`) and the
//! server pump (`udp_over_tcp::serve_tunnel`) decorate decoded frames
//! with a conventional anchor address and re-derive the real peer out
//! of band instead.

use bytes::{Buf, BufMut, BytesMut};
use podlink_core::error::CoreError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio_util::codec::{Decoder, Encoder};

/// Conventional "server" address stamped on every decoded datagram.
/// Mirrors Go's hard-coded anchor: neither side ever dials it, it
/// exists only so the packet-socket contract in §4.5 has an `Addr` to
/// return.
pub const ANCHOR_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8422);

/// Maximum payload size enforced by the 16-bit length prefix.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// One length-prefixed UDP payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramPacket {
    pub data: Vec<u8>,
}

impl DatagramPacket {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn addr(&self) -> SocketAddr {
        ANCHOR_ADDR
    }
}

/// `tokio_util::codec::{Encoder,Decoder}` implementation for
/// [`DatagramPacket`], usable with `tokio_util::codec::Framed` over any
/// `AsyncRead + AsyncWrite` connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct DatagramCodec;

impl Encoder<&[u8]> for DatagramCodec {
    type Error = CoreError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_PAYLOAD {
            return Err(CoreError::framing(format!(
                "payload of {} bytes exceeds max {}",
                item.len(),
                MAX_PAYLOAD
            )));
        }
        dst.reserve(2 + item.len());
        dst.put_u16(item.len() as u16);
        dst.put_slice(item);
        Ok(())
    }
}

impl Decoder for DatagramCodec {
    type Item = DatagramPacket;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < 2 + len {
            src.reserve(2 + len - src.len());
            return Ok(None);
        }
        src.advance(2);
        let data = src.split_to(len).to_vec();
        Ok(Some(DatagramPacket::new(data)))
    }
}

/// Encodes a single datagram as a standalone byte buffer, for callers
/// that write directly to a socket rather than through a `Framed`
/// wrapper (the synchronous write path used by the server-side pumps,
/// which must emit the two-byte header and payload as one write call
/// per spec §4.1).
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, CoreError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(CoreError::framing(format!(
            "payload of {} bytes exceeds max {}",
            payload.len(),
            MAX_PAYLOAD
        )));
    }
    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Reads exactly one datagram packet off an async reader: two header
/// bytes, then exactly that many payload bytes, with no lookahead.
/// Fails with `Framing` on short reads after the header and `Closed`
/// on EOF before any header bytes arrive.
pub async fn read_datagram<R>(reader: &mut R) -> Result<DatagramPacket, CoreError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut header = [0u8; 2];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CoreError::Closed);
        }
        Err(e) => return Err(CoreError::Io(e)),
    }
    let len = u16::from_be_bytes(header) as usize;
    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                CoreError::framing(format!("truncated payload: wanted {len} bytes"))
            }
            _ => CoreError::Io(e),
        })?;
    Ok(DatagramPacket::new(data))
}

/// Writes one datagram as a single logical write: the header and
/// payload are concatenated before the write call so two concurrent
/// writers on the same connection can never interleave a datagram
/// (the caller is still responsible for serializing calls to this
/// function across tasks — see `udp_over_tcp`'s single-writer-per-
/// direction contract).
pub async fn write_datagram<W>(writer: &mut W, payload: &[u8]) -> Result<(), CoreError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    let framed = encode(payload)?;
    writer.write_all(&framed).await.map_err(CoreError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trip() {
        let payload = b"ping-1".to_vec();
        let framed = encode(&payload).unwrap();
        let mut cursor = Cursor::new(framed);
        let decoded = read_datagram(&mut cursor).await.unwrap();
        assert_eq!(decoded.data, payload);
    }

    #[tokio::test]
    async fn multiple_datagrams_preserve_order() {
        let payloads: Vec<&[u8]> = vec![b"ping-1", b"ping-2", b"ping-3"];
        let mut buf = Vec::new();
        for p in &payloads {
            buf.extend(encode(p).unwrap());
        }
        let mut cursor = Cursor::new(buf);
        for expected in payloads {
            let decoded = read_datagram(&mut cursor).await.unwrap();
            assert_eq!(decoded.data, expected);
        }
    }

    #[tokio::test]
    async fn truncated_payload_is_framing_error() {
        let mut buf = vec![0u8, 10]; // claims 10 bytes
        buf.extend_from_slice(b"abc"); // only supplies 3
        let mut cursor = Cursor::new(buf);
        let err = read_datagram(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CoreError::Framing(_)));
    }

    #[tokio::test]
    async fn eof_before_header_is_closed() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = read_datagram(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CoreError::Closed));
    }

    proptest! {
        #[test]
        fn prop_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let framed = encode(&payload).unwrap();
            let mut cursor = Cursor::new(framed);
            let decoded = tokio_test::block_on(read_datagram(&mut cursor)).unwrap();
            prop_assert_eq!(decoded.data, payload);
        }
    }
}
