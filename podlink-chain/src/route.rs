//! Route spec parsing and router assembly (spec §6 Lifecycle surface,
//! grounded on `route.go`'s `GenRouters`).

use crate::chain::Chain;
use crate::group::NodeGroup;
use crate::node::{self, Node, Transport};
use crate::router::{Router, TcpHandlerKind};
use podlink_core::error::CoreError;
use podlink_transport::tcp::TcpKeepAliveListener;
use podlink_transport::tun::{self, TunConfig, TunListener};
use podlink_transport::udp::{UdpListenConfig, UdpListener};
use std::sync::Arc;
use tracing::warn;

/// Static wiring: one or more listener-side node URLs plus a single
/// chain-side node URL, per spec §3 Route.
#[derive(Debug, Clone, Default)]
pub struct RouteSpec {
    pub serve_nodes: Vec<String>,
    pub chain_nodes: String,
    pub retries: u32,
}

fn build_chain(chain_nodes: &str, retries: u32) -> Result<Chain, CoreError> {
    let mut chain = Chain::new(retries);
    if chain_nodes.trim().is_empty() {
        return Ok(chain);
    }
    let nodes = node::parse_chain_node(chain_nodes)?;
    let mut group = NodeGroup::new(1);
    let numbered: Vec<Node> = nodes
        .into_iter()
        .enumerate()
        .map(|(i, mut n)| {
            n.id = (i + 1) as u32;
            n
        })
        .collect();
    group.add_node(numbered);
    chain.add_group(group);
    Ok(chain)
}

async fn build_tcp_router(node: &Node, chain: Arc<Chain>) -> Result<Router, CoreError> {
    let listener = TcpKeepAliveListener::bind(&node.addr).await?;
    let handler = build_tcp_handler(node, chain);
    Ok(Router::new_tcp(node.addr.clone(), listener, handler))
}

async fn build_one_router(serve_node: &str, chain: Arc<Chain>) -> Result<Router, CoreError> {
    let node = node::parse_node(serve_node)?;
    let ttl = node.get_duration("ttl");
    let backlog = node.get_int("backlog").map(|v| v as usize);
    let queue = node.get_int("queue").map(|v| v as usize);

    let tun_routes = node
        .get("route")
        .map(tun::parse_ip_routes)
        .unwrap_or_default();
    let gateway = node.get("gw").and_then(|g| g.parse().ok());

    match &node.transport {
        Transport::Tcp => build_tcp_router(&node, Arc::clone(&chain)).await,
        Transport::Unknown(tag) => {
            warn!(tag = %tag, addr = %node.addr, "unrecognized transport tag, falling back to tcp listener");
            build_tcp_router(&node, Arc::clone(&chain)).await
        }
        Transport::Udp => {
            let mut cfg = UdpListenConfig::default();
            if let Some(ttl) = ttl {
                cfg.ttl = ttl;
            }
            if let Some(backlog) = backlog {
                cfg.backlog = backlog;
            }
            if let Some(queue) = queue {
                cfg.queue_size = queue;
            }
            let (listener, _table, new_flows_rx) = UdpListener::bind(&node.addr, cfg).await?;
            let remote: std::net::SocketAddr = node
                .remote
                .as_deref()
                .unwrap_or_default()
                .parse()
                .map_err(|_| CoreError::config("udp direct-forward handler requires a valid remote"))?;
            Ok(Router::new_udp(node.addr.clone(), listener, remote, new_flows_rx))
        }
        Transport::Tun => {
            let cfg = TunConfig {
                name: node.get("name").map(str::to_string),
                address: node.get("net").unwrap_or_default().to_string(),
                peer: node.get("peer").map(str::to_string),
                mtu: node
                    .get_int("mtu")
                    .map(|v| v as u16)
                    .unwrap_or(podlink_core::types::DEFAULT_MTU),
                routes: tun_routes,
                gateway,
            };
            let listener = TunListener::bind(cfg)?;
            Ok(Router::new_tun(node.addr.clone(), listener, chain))
        }
        Transport::Tap => Err(CoreError::config("tap transport is not implemented")),
    }
}

/// Picks the TCP handler strategy for a serve node, mirroring
/// `GenRouters`'s handler switch: a fixed `remote` always wins (plain
/// direct forward); otherwise a non-empty chain is used to reach the
/// target; with neither, the connection is treated as a UDP-over-TCP
/// tunnel peer (the `auto` fallback in spec §4.7).
fn build_tcp_handler(node: &Node, chain: Arc<Chain>) -> TcpHandlerKind {
    if let Some(remote) = &node.remote {
        return TcpHandlerKind::DirectForward { remote: remote.clone() };
    }
    if !chain.is_empty() {
        return TcpHandlerKind::Chain { chain };
    }
    TcpHandlerKind::UdpTunnel
}

/// Builds every router named by `spec`, per spec §6's
/// `build_routers(route_spec) → [router]`.
pub async fn build_routers(spec: &RouteSpec) -> Result<Vec<Router>, CoreError> {
    let chain = Arc::new(build_chain(&spec.chain_nodes, spec.retries)?);
    let mut routers = Vec::with_capacity(spec.serve_nodes.len());
    for serve_node in &spec.serve_nodes {
        routers.push(build_one_router(serve_node, Arc::clone(&chain)).await?);
    }
    Ok(routers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_tcp_router_with_direct_forward() {
        let spec = RouteSpec {
            serve_nodes: vec!["tcp://127.0.0.1:0?remote=127.0.0.1:9".to_string()],
            chain_nodes: String::new(),
            retries: 0,
        };
        let routers = build_routers(&spec).await.unwrap();
        assert_eq!(routers.len(), 1);
    }

    #[tokio::test]
    async fn empty_chain_nodes_yields_empty_chain() {
        let chain = build_chain("", 0).unwrap();
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn nonempty_chain_nodes_yields_one_group() {
        let chain = build_chain("tcp://127.0.0.1:9001", 1).unwrap();
        assert!(!chain.is_empty());
    }

    #[tokio::test]
    async fn unrecognized_transport_falls_back_to_tcp_listener() {
        let spec = RouteSpec {
            serve_nodes: vec!["bogus://127.0.0.1:0?remote=127.0.0.1:9".to_string()],
            chain_nodes: String::new(),
            retries: 0,
        };
        let routers = build_routers(&spec).await.unwrap();
        assert_eq!(routers.len(), 1);
    }
}
