//! Auto handler and connector (spec §4.7).
//!
//! When a node's protocol tag is `auto`, the handler and connector each
//! resolve to one of the other concrete variants based on configuration
//! rather than a fixed tag, mirroring Go's `core.AutoHandler` /
//! `core.AutoConnector`.

use crate::udp_over_tcp::serve_tunnel;
use podlink_core::error::CoreError;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Resolves which concrete handling strategy an `auto` node should use.
///
/// A non-empty `remote` means the node forwards as a fixed TCP target;
/// an empty one means the connection is treated as a UDP-over-TCP
/// tunnel peer, per spec §4.7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoDecision {
    DirectForward { remote: String },
    UdpTunnel,
}

pub fn decide_handler(remote: &str) -> AutoDecision {
    if remote.is_empty() {
        AutoDecision::UdpTunnel
    } else {
        AutoDecision::DirectForward {
            remote: remote.to_string(),
        }
    }
}

/// Drives one accepted connection through whichever strategy
/// `decide_handler` selects for `remote`.
pub async fn run_auto_handler<C>(conn: C, remote: &str) -> Result<(), CoreError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match decide_handler(remote) {
        AutoDecision::DirectForward { remote } => {
            debug!(%remote, "auto handler: direct forward");
            crate::tcp_forward::direct_forward(conn, &remote).await
        }
        AutoDecision::UdpTunnel => {
            debug!("auto handler: udp-over-tcp tunnel");
            serve_tunnel(conn).await
        }
    }
}

/// Resolves which connector an `auto` node should dial with. Go's
/// `core.AutoConnector` keys this off the node's `user` field
/// (empty user ⇒ plain TCP, any user value ⇒ UDP-over-TCP tunnel
/// client); the same convention is kept here rather than inventing a
/// new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoConnectorKind {
    Tcp,
    UdpTunnel,
}

pub fn decide_connector(user: &str) -> AutoConnectorKind {
    if user.is_empty() {
        AutoConnectorKind::Tcp
    } else {
        AutoConnectorKind::UdpTunnel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_remote_selects_udp_tunnel() {
        assert_eq!(decide_handler(""), AutoDecision::UdpTunnel);
    }

    #[test]
    fn nonempty_remote_selects_direct_forward() {
        assert_eq!(
            decide_handler("10.0.0.1:8080"),
            AutoDecision::DirectForward {
                remote: "10.0.0.1:8080".to_string()
            }
        );
    }

    #[test]
    fn empty_user_selects_tcp_connector() {
        assert_eq!(decide_connector(""), AutoConnectorKind::Tcp);
    }

    #[test]
    fn nonempty_user_selects_udp_tunnel_connector() {
        assert_eq!(decide_connector("tunnel"), AutoConnectorKind::UdpTunnel);
    }
}
