//! Node URL parsing (spec §6 grammar) and the per-IP fan-out option
//! from Go's `parseChainNode`.

use podlink_core::error::CoreError;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Transport tag: how a node is dialled. An unrecognized tag is kept
/// as `Unknown` rather than rejected, so the listener side can fall
/// back to a plain TCP listener for it (spec §6, Go's `GenRouters`
/// `default:` arm).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
    Tun,
    Tap,
    Unknown(String),
}

/// Protocol tag: how a connection is handled once established. An
/// unrecognized tag falls back the same way `Auto` does: `Node::remote`
/// wins if set, otherwise the chain/auto-tunnel default applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Tun,
    Tap,
    Auto,
    Unknown(String),
}

fn parse_tag(s: &str) -> TagKind {
    match s {
        "tcp" => TagKind::Tcp,
        "udp" => TagKind::Udp,
        "tun" => TagKind::Tun,
        "tap" => TagKind::Tap,
        "auto" => TagKind::Auto,
        other => TagKind::Unknown(other.to_string()),
    }
}

enum TagKind {
    Tcp,
    Udp,
    Tun,
    Tap,
    Auto,
    Unknown(String),
}

/// A single addressed, configured endpoint, parsed from one node URL
/// per the grammar `scheme+protocol://[user[:password]@]host:port?k=v`.
/// Immutable once constructed, per spec §3 ("immutable once inserted
/// into a chain").
#[derive(Debug, Clone)]
pub struct Node {
    pub id: u32,
    pub addr: String,
    pub transport: Transport,
    pub protocol: Protocol,
    pub user: String,
    pub password: Option<String>,
    pub remote: Option<String>,
    pub host_override: Option<String>,
    options: HashMap<String, String>,
}

impl Node {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).map(podlink_core::types::parse_bool).unwrap_or(false)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        podlink_core::types::parse_duration_secs(self.get(key)?)
    }

    /// The effective dial host: the `host` query override if present,
    /// otherwise the URL's own host component (spec §6's connector
    /// hint table and `route.go`'s `host := node.Get("host"); if host
    /// == "" { host = node.Host }`).
    pub fn dial_host(&self) -> String {
        self.host_override
            .clone()
            .unwrap_or_else(|| self.addr.split(':').next().unwrap_or_default().to_string())
    }
}

/// Parses one node URL of the form `transport+protocol://...` (either
/// component may be omitted; a bare scheme is used as both). Query
/// parameters become the node's option map verbatim.
pub fn parse_node(raw: &str) -> Result<Node, CoreError> {
    let url = Url::parse(raw).map_err(|e| CoreError::config(format!("invalid node url {raw}: {e}")))?;

    let scheme = url.scheme();
    let (transport_raw, protocol_raw) = match scheme.split_once('+') {
        Some((t, p)) => (t, p),
        None => (scheme, scheme),
    };

    let transport = match parse_tag(transport_raw) {
        TagKind::Tcp => Transport::Tcp,
        TagKind::Udp => Transport::Udp,
        TagKind::Tun => Transport::Tun,
        TagKind::Tap => Transport::Tap,
        TagKind::Auto => return Err(CoreError::config("transport tag cannot be auto")),
        TagKind::Unknown(tag) => Transport::Unknown(tag),
    };
    let protocol = match parse_tag(protocol_raw) {
        TagKind::Tcp => Protocol::Tcp,
        TagKind::Udp => Protocol::Udp,
        TagKind::Tun => Protocol::Tun,
        TagKind::Tap => Protocol::Tap,
        TagKind::Auto => Protocol::Auto,
        TagKind::Unknown(tag) => Protocol::Unknown(tag),
    };

    let host = url.host_str().unwrap_or("").to_string();
    let port = url.port();
    let addr = match port {
        Some(p) => format!("{host}:{p}"),
        None => host.clone(),
    };

    let user = url.username().to_string();
    let password = url.password().map(str::to_string);

    let mut options: HashMap<String, String> = url.query_pairs().into_owned().collect();
    let remote = options.remove("remote").filter(|s| !s.is_empty());
    let host_override = options.get("host").cloned().filter(|s| !s.is_empty());

    Ok(Node {
        id: 0,
        addr,
        transport,
        protocol,
        user,
        password,
        remote,
        host_override,
        options,
    })
}

/// Parses a comma-separated `ip` option value into `ip:port` addresses
/// sharing the node's own port, the per-IP fan-out from
/// `parseChainNode`'s `parseIP`. Returns an empty vec when `raw` is
/// empty, signalling "no fan-out, use the node as-is".
pub fn parse_ip_fanout(raw: &str, port: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|ip| {
            if port.is_empty() {
                ip.to_string()
            } else {
                format!("{ip}:{port}")
            }
        })
        .collect()
}

/// Expands one chain-side node URL into one node per `ip` fan-out
/// entry, or a single node when no fan-out is configured. Mirrors
/// Go's `parseChainNode`.
pub fn parse_chain_node(raw: &str) -> Result<Vec<Node>, CoreError> {
    let base = parse_node(raw)?;
    let port = base.addr.split(':').nth(1).unwrap_or("");
    let ips = base
        .get("ip")
        .map(|v| parse_ip_fanout(v, port))
        .unwrap_or_default();

    if ips.is_empty() {
        return Ok(vec![base]);
    }

    Ok(ips
        .into_iter()
        .map(|addr| {
            let mut n = base.clone();
            n.addr = addr;
            n
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transport_and_protocol_from_combined_scheme() {
        let node = parse_node("tcp+auto://127.0.0.1:8080").unwrap();
        assert_eq!(node.transport, Transport::Tcp);
        assert_eq!(node.protocol, Protocol::Auto);
        assert_eq!(node.addr, "127.0.0.1:8080");
    }

    #[test]
    fn bare_scheme_applies_to_both_tags() {
        let node = parse_node("udp://127.0.0.1:9001?ttl=30s&backlog=64").unwrap();
        assert_eq!(node.transport, Transport::Udp);
        assert_eq!(node.protocol, Protocol::Udp);
        assert_eq!(node.get("backlog"), Some("64"));
    }

    #[test]
    fn unknown_transport_tag_is_kept_as_unknown() {
        let node = parse_node("bogus://127.0.0.1:1").unwrap();
        assert_eq!(node.transport, Transport::Unknown("bogus".to_string()));
    }

    #[test]
    fn auto_transport_tag_is_rejected() {
        let err = parse_node("auto://127.0.0.1:1").unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn host_option_overrides_url_host() {
        let node = parse_node("tcp://127.0.0.1:443?host=example.internal").unwrap();
        assert_eq!(node.dial_host(), "example.internal");
    }

    #[test]
    fn no_host_option_falls_back_to_url_host() {
        let node = parse_node("tcp://127.0.0.1:443").unwrap();
        assert_eq!(node.dial_host(), "127.0.0.1");
    }

    #[test]
    fn ip_fanout_produces_one_node_per_ip_sharing_port() {
        let nodes = parse_chain_node("tcp://placeholder:9000?ip=10.0.0.1,10.0.0.2").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].addr, "10.0.0.1:9000");
        assert_eq!(nodes[1].addr, "10.0.0.2:9000");
    }

    #[test]
    fn no_ip_option_yields_single_node() {
        let nodes = parse_chain_node("tcp://127.0.0.1:9000").unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].addr, "127.0.0.1:9000");
    }
}
