//! Chain traversal and dial (spec §4.8).
//!
//! A chain dial retries the *whole* dial on any hop failure, not just
//! the failing hop (spec §5: "the chain retries whole dials, not
//! partial hops"). Only the two connector kinds this workspace
//! implements are composable across hops: a plain TCP stream, or a
//! UDP-over-TCP tunnel adapter wrapping the prior hop's stream. A
//! tunnel hop is necessarily the last hop, since it presents packet
//! semantics rather than a further-dialable stream.

use crate::group::NodeGroup;
use podlink_core::error::CoreError;
use podlink_transport::auto::{decide_connector, AutoConnectorKind};
use podlink_transport::tcp::TcpTransport;
use podlink_transport::udp_over_tcp::{anchor_addr, TunnelConnector};
use tokio::net::TcpStream;

/// The result of a chain dial: either a plain stream (ready to be
/// handed to a direct-forward handler) or a UDP-over-TCP tunnel
/// adapter.
#[derive(Debug)]
pub enum ChainConnection {
    Stream(TcpStream),
    Tunnel(TunnelConnector<TcpStream>),
}

/// Ordered sequence of node groups plus a retry budget.
pub struct Chain {
    groups: Vec<NodeGroup>,
    retries: u32,
    transport: TcpTransport,
}

impl Chain {
    pub fn new(retries: u32) -> Self {
        Self {
            groups: Vec::new(),
            retries,
            transport: TcpTransport::default(),
        }
    }

    pub fn add_group(&mut self, group: NodeGroup) {
        self.groups.push(group);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Dials through the chain, retrying the entire traversal up to
    /// `retries` additional times on any hop failure (spec §4.8).
    pub async fn dial(&self) -> Result<ChainConnection, CoreError> {
        let attempts = self.retries + 1;
        let mut last_err = None;
        for _ in 0..attempts {
            match self.try_dial_once().await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_err = Some(e),
            }
        }
        let _ = last_err;
        Err(CoreError::ChainExhausted { attempts })
    }

    async fn try_dial_once(&self) -> Result<ChainConnection, CoreError> {
        let mut groups = self.groups.iter();
        let first_group = groups
            .next()
            .ok_or_else(|| CoreError::config("chain has no node groups"))?;
        let node0 = first_group
            .select()
            .ok_or_else(|| CoreError::unreachable("no available node in first group"))?;

        let stream = match self.transport.dial(&node0.addr).await {
            Ok(s) => s,
            Err(e) => {
                first_group.mark_down(node0.id);
                return Err(e);
            }
        };

        let mut conn = ChainConnection::Stream(stream);
        for group in groups {
            let node = group
                .select()
                .ok_or_else(|| CoreError::unreachable("no available node in chain group"))?;
            conn = match conn {
                ChainConnection::Stream(stream) => match decide_connector(&node.user) {
                    AutoConnectorKind::UdpTunnel => {
                        ChainConnection::Tunnel(TunnelConnector::new(stream, anchor_addr()))
                    }
                    AutoConnectorKind::Tcp => ChainConnection::Stream(stream),
                },
                ChainConnection::Tunnel(_) => {
                    return Err(CoreError::config(
                        "cannot extend a chain past a udp-over-tcp tunnel hop",
                    ));
                }
            };
        }
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{parse_node, Node};
    use tokio::net::TcpListener;

    fn node_for(addr: std::net::SocketAddr, user: &str) -> Node {
        let mut n = parse_node(&format!("tcp+auto://{addr}?user={user}")).unwrap();
        n.user = user.to_string();
        n
    }

    #[tokio::test]
    async fn exhausts_after_retries_plus_one_attempts_when_all_nodes_refuse() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener); // nothing listening: every dial refuses

        let mut group = NodeGroup::new(1);
        let mut n = node_for(addr, "");
        n.id = 1;
        group.add_node([n]);

        let mut chain = Chain::new(2);
        chain.add_group(group);

        let err = chain.dial().await.unwrap_err();
        assert!(matches!(err, CoreError::ChainExhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn succeeds_once_round_robin_reaches_a_live_node() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        let accept_task = tokio::spawn(async move {
            let _ = live.accept().await;
        });

        let mut group = NodeGroup::new(1);
        let mut dead_node = node_for(dead_addr, "");
        dead_node.id = 1;
        let mut live_node = node_for(live_addr, "");
        live_node.id = 2;
        group.add_node([dead_node, live_node]);

        let mut chain = Chain::new(2);
        chain.add_group(group);

        let conn = chain.dial().await;
        assert!(conn.is_ok());
        accept_task.await.unwrap();
    }

    #[tokio::test]
    async fn second_group_with_tunnel_user_wraps_as_tunnel_connector() {
        let hop0 = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let hop0_addr = hop0.local_addr().unwrap();
        let accept_task = tokio::spawn(async move {
            let _ = hop0.accept().await;
        });

        let mut group0 = NodeGroup::new(1);
        let mut n0 = node_for(hop0_addr, "");
        n0.id = 1;
        group0.add_node([n0]);

        let mut group1 = NodeGroup::new(2);
        let mut n1 = node_for(hop0_addr, "tunnel-user");
        n1.id = 2;
        group1.add_node([n1]);

        let mut chain = Chain::new(0);
        chain.add_group(group0);
        chain.add_group(group1);

        let conn = chain.dial().await.unwrap();
        assert!(matches!(conn, ChainConnection::Tunnel(_)));
        accept_task.await.unwrap();
    }
}
