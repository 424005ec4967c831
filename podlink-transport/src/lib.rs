#![forbid(unsafe_code)]

//! Transport and listener primitives for the podlink tunnel core.
//!
//! * Length-prefixed UDP-over-TCP framing ([`codec`]) with a process-
//!   wide buffer pool ([`pool`]).
//! * TCP dialer and keep-alive listener ([`tcp`]) plus a fixed-target
//!   direct-forward handler ([`tcp_forward`]).
//! * UDP listener with a per-source flow table ([`udp`]).
//! * The UDP-over-TCP connection adapter and server pump
//!   ([`udp_over_tcp`]).
//! * TUN/TAP device listener and packet-forwarding handler ([`tun`]).
//! * The `auto` handler/connector that picks between direct forward and
//!   UDP-over-TCP tunnelling ([`auto`]).

pub mod auto;
pub mod codec;
pub mod pool;
pub mod tcp;
pub mod tcp_forward;
pub mod tun;
pub mod udp;
pub mod udp_over_tcp;

pub use codec::{DatagramCodec, DatagramPacket};
pub use pool::{BufferPool, PooledBuffer, GLOBAL_POOL};
pub use tcp::{TcpKeepAliveListener, TcpTransport};
pub use tun::{IpRoute, TunConfig, TunListener};
pub use udp::{FlowReplyHandle, FlowTable, UdpDirectForwardHandler, UdpListenConfig, UdpListener};
pub use udp_over_tcp::{serve_tunnel, TunnelConnector};
