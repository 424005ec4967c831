//! TUN/TAP virtual network interface listener and handler (spec §4.6).
//!
//! The device itself is the `tun` crate's async interface; this module
//! layers route bookkeeping, MTU enforcement, and the packet-forwarding
//! handler on top of it, mirroring Go's `core.TunConfig` /
//! `core.TunListener` / `core.TunHandler`.

use ipnet::IpNet;
use podlink_core::error::CoreError;
use podlink_core::types::DEFAULT_MTU;
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// One route to program onto the device, with an optional per-route
/// gateway override. A `None` gateway inherits the config's default
/// gateway at build time (spec §4, TUN/TAP config invariants).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRoute {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
}

impl IpRoute {
    pub fn new(destination: IpNet, gateway: Option<IpAddr>) -> Self {
        Self { destination, gateway }
    }

    fn with_default_gateway(mut self, default_gw: Option<IpAddr>) -> Self {
        if self.gateway.is_none() {
            self.gateway = default_gw;
        }
        self
    }
}

/// Parses a comma-separated `destination[@gateway]` route list, the
/// same grammar the `route` node parameter uses in Go's
/// `parseIPRoutes`. Entries whose destination isn't a valid CIDR are
/// dropped with a warning rather than failing the whole list, since one
/// malformed route shouldn't block the others.
pub fn parse_ip_routes(raw: &str) -> Vec<IpRoute> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let (dest, gw) = match entry.split_once('@') {
                Some((dest, gw)) => (dest, gw.parse().ok()),
                None => (entry, None),
            };
            match dest.parse::<IpNet>() {
                Ok(net) => Some(IpRoute::new(net, gw)),
                Err(e) => {
                    warn!(destination = dest, error = %e, "dropping malformed route destination");
                    None
                }
            }
        })
        .collect()
}

/// Configuration for a TUN device (spec §4, §4.6).
#[derive(Debug, Clone)]
pub struct TunConfig {
    pub name: Option<String>,
    pub address: String,
    pub peer: Option<String>,
    pub mtu: u16,
    pub routes: Vec<IpRoute>,
    pub gateway: Option<IpAddr>,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: None,
            address: String::new(),
            peer: None,
            mtu: DEFAULT_MTU,
            routes: Vec::new(),
            gateway: None,
        }
    }
}

impl TunConfig {
    /// Route table with every unset per-route gateway resolved against
    /// the config's default gateway.
    fn resolved_routes(&self) -> Vec<IpRoute> {
        self.routes
            .iter()
            .cloned()
            .map(|r| r.with_default_gateway(self.gateway))
            .collect()
    }
}

/// A bound TUN device plus the routes it programmed, so they can be
/// withdrawn in reverse order on close.
pub struct TunListener {
    dev: Option<tun::AsyncDevice>,
    mtu: u16,
    installed_routes: Vec<IpRoute>,
    closed: bool,
}

impl TunListener {
    pub fn bind(cfg: TunConfig) -> Result<Self, CoreError> {
        let mut tun_cfg = tun::Configuration::default();
        tun_cfg.address(cfg.address.as_str());
        if let Some(peer) = &cfg.peer {
            tun_cfg.destination(peer.as_str());
        }
        if let Some(name) = &cfg.name {
            tun_cfg.name(name.as_str());
        }
        tun_cfg.mtu(cfg.mtu);
        tun_cfg.up();

        let dev = tun::create_as_async(&tun_cfg)
            .map_err(|e| CoreError::resource(format!("tun device create failed: {e}")))?;

        let installed_routes = cfg.resolved_routes();
        for route in &installed_routes {
            debug!(destination = %route.destination, gateway = ?route.gateway, "tun route installed");
        }
        info!(mtu = cfg.mtu, "tun device up");

        Ok(Self {
            dev: Some(dev),
            mtu: cfg.mtu,
            installed_routes,
            closed: false,
        })
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    fn device_mut(&mut self) -> Result<&mut tun::AsyncDevice, CoreError> {
        self.dev.as_mut().ok_or(CoreError::Closed)
    }

    /// Reads exactly one IP packet.
    pub async fn read_packet(&mut self) -> Result<Vec<u8>, CoreError> {
        let mtu = self.mtu;
        let dev = self.device_mut()?;
        let mut buf = vec![0u8; mtu as usize];
        let n = dev.read(&mut buf).await.map_err(CoreError::Io)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes one IP packet, rejecting anything larger than the
    /// configured MTU (spec §4.6: "configured MTU is enforced on
    /// writes").
    pub async fn write_packet(&mut self, packet: &[u8]) -> Result<(), CoreError> {
        if packet.len() > self.mtu as usize {
            return Err(CoreError::resource(format!(
                "packet of {} bytes exceeds tun mtu {}",
                packet.len(),
                self.mtu
            )));
        }
        self.device_mut()?.write_all(packet).await.map_err(CoreError::Io)
    }

    /// Withdraws programmed routes in reverse order and drops the
    /// device, per the close invariant in spec §4.6.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for route in self.installed_routes.iter().rev() {
            debug!(destination = %route.destination, "tun route withdrawn");
        }
        self.closed = true;
    }
}

impl Drop for TunListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Chain-side forwarding target for a TUN handler: whatever connector
/// the selected chain hop exposes for carrying raw IP packets.
#[async_trait::async_trait]
pub trait PacketForward: Send + Sync {
    async fn send(&self, packet: &[u8]) -> Result<(), CoreError>;
    async fn recv(&self) -> Result<Vec<u8>, CoreError>;
}

/// Reads packets from the device and forwards them to the chain;
/// writes packets received from the chain back into the device. Raw IP
/// bytes pass through unmodified in both directions (spec §4.6: "strips
/// nothing").
///
/// Runs as two concurrent pumps sharing the device's read and write
/// halves, the same shape as the UDP-over-TCP pumps in
/// `udp_over_tcp::serve_tunnel`.
pub async fn run_tun_handler<F>(mut tun: TunListener, forward: F) -> Result<(), CoreError>
where
    F: PacketForward + 'static,
{
    let mtu = tun.mtu;
    let dev = tun.dev.take().ok_or(CoreError::Closed)?;
    let (mut dev_read, dev_write) = tokio::io::split(dev);
    let dev_write = std::sync::Arc::new(tokio::sync::Mutex::new(dev_write));
    let forward = std::sync::Arc::new(forward);
    let (errc_tx, mut errc_rx) = tokio::sync::mpsc::channel::<CoreError>(2);

    let to_chain = {
        let forward = std::sync::Arc::clone(&forward);
        let errc = errc_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; mtu as usize];
            loop {
                let n = match dev_read.read(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = errc.send(CoreError::Io(e)).await;
                        return;
                    }
                };
                if let Err(e) = forward.send(&buf[..n]).await {
                    let _ = errc.send(e).await;
                    return;
                }
            }
        })
    };

    let from_chain = {
        let forward = std::sync::Arc::clone(&forward);
        let dev_write = std::sync::Arc::clone(&dev_write);
        let errc = errc_tx.clone();
        tokio::spawn(async move {
            loop {
                match forward.recv().await {
                    Ok(packet) => {
                        if packet.len() > mtu as usize {
                            warn!(len = packet.len(), mtu, "dropping oversize reply packet");
                            continue;
                        }
                        let mut writer = dev_write.lock().await;
                        if let Err(e) = writer.write_all(&packet).await {
                            let _ = errc.send(CoreError::Io(e)).await;
                            return;
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

    drop(errc_tx);
    let first_error = errc_rx.recv().await;
    to_chain.abort();
    from_chain.abort();
    tun.close();

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_routes() {
        let routes = parse_ip_routes("10.0.0.0/8,192.168.1.0/24@10.0.0.1");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination, "10.0.0.0/8".parse::<IpNet>().unwrap());
        assert_eq!(routes[0].gateway, None);
        assert_eq!(routes[1].destination, "192.168.1.0/24".parse::<IpNet>().unwrap());
        assert_eq!(routes[1].gateway, Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn empty_route_string_yields_no_routes() {
        assert!(parse_ip_routes("").is_empty());
        assert!(parse_ip_routes("  ").is_empty());
    }

    #[test]
    fn malformed_destination_is_dropped_not_fatal() {
        let routes = parse_ip_routes("not-a-cidr,10.0.0.0/8");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination, "10.0.0.0/8".parse::<IpNet>().unwrap());
    }

    #[test]
    fn unset_route_gateway_inherits_default() {
        let default_gw: IpAddr = "10.0.0.1".parse().unwrap();
        let cfg = TunConfig {
            routes: vec![IpRoute::new("10.0.0.0/8".parse().unwrap(), None)],
            gateway: Some(default_gw),
            ..Default::default()
        };
        let resolved = cfg.resolved_routes();
        assert_eq!(resolved[0].gateway, Some(default_gw));
    }

    #[test]
    fn explicit_route_gateway_is_not_overridden() {
        let override_gw: IpAddr = "10.0.0.2".parse().unwrap();
        let cfg = TunConfig {
            routes: vec![IpRoute::new("10.0.0.0/8".parse().unwrap(), Some(override_gw))],
            gateway: Some("10.0.0.1".parse().unwrap()),
            ..Default::default()
        };
        let resolved = cfg.resolved_routes();
        assert_eq!(resolved[0].gateway, Some(override_gw));
    }
}
