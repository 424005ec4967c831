//! UDP listener, per-source flow table, and the UDP direct-forward
//! handler (spec §3 Flow table, §4.4).

use dashmap::DashMap;
use podlink_core::error::CoreError;
use podlink_core::types::{DEFAULT_FLOW_BACKLOG, DEFAULT_FLOW_QUEUE, DEFAULT_FLOW_TTL};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Tunable limits for a UDP listener's flow table.
#[derive(Debug, Clone, Copy)]
pub struct UdpListenConfig {
    pub ttl: Duration,
    pub backlog: usize,
    pub queue_size: usize,
}

impl Default for UdpListenConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_FLOW_TTL,
            backlog: DEFAULT_FLOW_BACKLOG,
            queue_size: DEFAULT_FLOW_QUEUE,
        }
    }
}

/// Per-source state tracked by the flow table.
struct Flow {
    last_seen: Mutex<Instant>,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    drops: AtomicU64,
    queue_size: usize,
}

impl Flow {
    fn new(queue_size: usize, outbound_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
            inbound: Mutex::new(VecDeque::new()),
            outbound_tx,
            drops: AtomicU64::new(0),
            queue_size,
        }
    }

    async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    async fn last_seen(&self) -> Instant {
        *self.last_seen.lock().await
    }

    /// Enqueues an inbound payload, dropping the newest on overflow
    /// per spec §3.
    async fn push_inbound(&self, payload: Vec<u8>) {
        let mut q = self.inbound.lock().await;
        if q.len() >= self.queue_size {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        q.push_back(payload);
    }

    async fn pop_inbound(&self) -> Option<Vec<u8>> {
        self.inbound.lock().await.pop_front()
    }

    fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }
}

/// Bounded, LRU-evicting table of per-source UDP flows.
///
/// Flow eviction order is least-recently-seen. A background sweeper
/// (see [`FlowTable::sweep`]) reaps flows idle longer than `ttl`.
pub struct FlowTable {
    flows: DashMap<SocketAddr, Arc<Flow>>,
    order: Mutex<VecDeque<SocketAddr>>,
    config: UdpListenConfig,
}

impl FlowTable {
    pub fn new(config: UdpListenConfig) -> Arc<Self> {
        Arc::new(Self {
            flows: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            config,
        })
    }

    /// Looks up (creating if absent) the flow for `src`, evicting the
    /// least-recently-seen flow if the table is already at capacity.
    /// Returns the flow plus the outbound receiver when a new flow was
    /// created (the listener's reply-writer task owns that receiver).
    async fn get_or_insert(&self, src: SocketAddr) -> (Arc<Flow>, Option<mpsc::Receiver<Vec<u8>>>) {
        if let Some(existing) = self.flows.get(&src) {
            return (Arc::clone(existing.value()), None);
        }

        if self.flows.len() >= self.config.backlog {
            self.evict_lru().await;
        }

        let (tx, rx) = mpsc::channel(self.config.queue_size.max(1));
        let flow = Arc::new(Flow::new(self.config.queue_size, tx));
        self.flows.insert(src, Arc::clone(&flow));
        self.order.lock().await.push_back(src);
        (flow, Some(rx))
    }

    /// Marks `src` as most-recently-seen: refreshes its flow's
    /// `last_seen` and moves it to the back of the eviction order.
    async fn touch(&self, src: SocketAddr) {
        if let Some(flow) = self.flows.get(&src) {
            flow.touch().await;
        }
        let mut order = self.order.lock().await;
        if let Some(pos) = order.iter().position(|s| *s == src) {
            order.remove(pos);
        }
        order.push_back(src);
    }

    async fn evict_lru(&self) {
        let mut order = self.order.lock().await;
        while let Some(candidate) = order.pop_front() {
            if self.flows.remove(&candidate).is_some() {
                debug!(addr = %candidate, "evicted least-recently-seen flow");
                return;
            }
        }
    }

    /// Drops flows idle longer than `ttl`. Call periodically from a
    /// background task.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in self.flows.iter() {
            if now.duration_since(entry.value().last_seen().await) > self.config.ttl {
                expired.push(*entry.key());
            }
        }
        if expired.is_empty() {
            return;
        }
        let mut order = self.order.lock().await;
        for addr in &expired {
            self.flows.remove(addr);
            order.retain(|s| s != addr);
            debug!(%addr, "flow expired after ttl");
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn drops_for(&self, src: &SocketAddr) -> Option<u64> {
        self.flows.get(src).map(|f| f.drop_count())
    }
}

/// A UDP listener that demultiplexes inbound datagrams into a
/// per-source [`FlowTable`] and exposes each new flow to a handler via
/// `new_flows`.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    table: Arc<FlowTable>,
    new_flows: mpsc::Sender<(SocketAddr, mpsc::Receiver<Vec<u8>>)>,
}

/// Handle to a single flow's reply path, handed to the forward
/// handler so it can write packets back toward the original source.
pub struct FlowReplyHandle {
    socket: Arc<UdpSocket>,
    src: SocketAddr,
}

impl FlowReplyHandle {
    pub async fn reply(&self, payload: &[u8]) -> Result<(), CoreError> {
        self.socket.send_to(payload, self.src).await.map_err(CoreError::Io)?;
        Ok(())
    }
}

impl UdpListener {
    pub async fn bind(
        addr: &str,
        config: UdpListenConfig,
    ) -> Result<
        (
            Self,
            Arc<FlowTable>,
            mpsc::Receiver<(SocketAddr, mpsc::Receiver<Vec<u8>>)>,
        ),
        CoreError,
    > {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| CoreError::fatal(format!("bind {addr}: {e}")))?;
        let table = FlowTable::new(config);
        let (tx, rx) = mpsc::channel(64);
        Ok((
            Self {
                socket: Arc::new(socket),
                table: Arc::clone(&table),
                new_flows: tx,
            },
            table,
            rx,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CoreError> {
        self.socket.local_addr().map_err(CoreError::Io)
    }

    pub fn reply_handle(&self, src: SocketAddr) -> FlowReplyHandle {
        FlowReplyHandle {
            socket: Arc::clone(&self.socket),
            src,
        }
    }

    /// Runs the listener's read loop: receives datagrams into pooled
    /// buffers, enqueues them on the per-source flow, and notifies a
    /// handler of newly created flows. Runs until the socket errors.
    pub async fn run(&self) -> Result<(), CoreError> {
        loop {
            let mut buf = crate::pool::GLOBAL_POOL.acquire();
            let (n, src) = self
                .socket
                .recv_from(buf.as_mut_slice())
                .await
                .map_err(CoreError::Io)?;
            let payload = buf.as_slice()[..n].to_vec();

            let (flow, new_rx) = self.table.get_or_insert(src).await;
            self.table.touch(src).await;
            flow.push_inbound(payload).await;

            if let Some(rx) = new_rx {
                if self.new_flows.send((src, rx)).await.is_err() {
                    warn!("new-flow channel closed; listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    pub fn table(&self) -> Arc<FlowTable> {
        Arc::clone(&self.table)
    }
}

/// Spawns the background sweeper that expires idle flows.
pub fn spawn_sweeper(table: Arc<FlowTable>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            table.sweep().await;
        }
    })
}

/// UDP direct-forward handler: owns a remote UDP socket per flow,
/// copying inbound payloads to `remote` and routing replies back
/// through the flow's reply handle.
pub struct UdpDirectForwardHandler {
    remote: SocketAddr,
}

impl UdpDirectForwardHandler {
    pub fn new(remote: SocketAddr) -> Self {
        Self { remote }
    }

    /// Drives one flow: dials `remote` on a fresh ephemeral socket,
    /// then pumps `inbound` payloads to it and any replies back via
    /// `reply`. Returns when either direction errors or `inbound`
    /// closes (the listener reaped the flow).
    pub async fn handle(
        &self,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        reply: FlowReplyHandle,
    ) -> Result<(), CoreError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(CoreError::Io)?;
        socket.connect(self.remote).await.map_err(|e| CoreError::unreachable(e.to_string()))?;

        let mut recv_buf = vec![0u8; podlink_core::types::MIN_POOLED_BUFFER];
        loop {
            tokio::select! {
                maybe_payload = inbound.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            socket.send(&payload).await.map_err(CoreError::Io)?;
                        }
                        None => return Ok(()),
                    }
                }
                recv = socket.recv(&mut recv_buf) => {
                    let n = recv.map_err(CoreError::Io)?;
                    reply.reply(&recv_buf[..n]).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flow_isolation_preserves_per_source_order() {
        let table = FlowTable::new(UdpListenConfig::default());
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();

        let (flow_a, _) = table.get_or_insert(a).await;
        flow_a.push_inbound(b"a1".to_vec()).await;
        flow_a.push_inbound(b"a2".to_vec()).await;

        let (flow_b, _) = table.get_or_insert(b).await;
        flow_b.push_inbound(b"b1".to_vec()).await;

        assert_eq!(flow_a.pop_inbound().await.unwrap(), b"a1");
        assert_eq!(flow_a.pop_inbound().await.unwrap(), b"a2");
        assert_eq!(flow_b.pop_inbound().await.unwrap(), b"b1");
    }

    #[tokio::test]
    async fn backlog_eviction_drops_oldest() {
        let config = UdpListenConfig {
            ttl: Duration::from_secs(60),
            backlog: 2,
            queue_size: 1,
        };
        let table = FlowTable::new(config);
        let a: SocketAddr = "127.0.0.1:10".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:11".parse().unwrap();
        let c: SocketAddr = "127.0.0.1:12".parse().unwrap();

        table.get_or_insert(a).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        table.get_or_insert(b).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        table.get_or_insert(c).await;

        assert_eq!(table.len(), 2);
        assert!(table.flows.get(&a).is_none());
        assert!(table.flows.get(&b).is_some());
        assert!(table.flows.get(&c).is_some());

        // A fresh packet from `a` creates a new, empty flow.
        let (flow_a_again, _) = table.get_or_insert(a).await;
        assert!(flow_a_again.pop_inbound().await.is_none());
    }

    #[tokio::test]
    async fn backlog_eviction_prefers_least_recently_seen() {
        let config = UdpListenConfig {
            ttl: Duration::from_secs(60),
            backlog: 2,
            queue_size: 1,
        };
        let table = FlowTable::new(config);
        let a: SocketAddr = "127.0.0.1:40".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:41".parse().unwrap();
        let c: SocketAddr = "127.0.0.1:42".parse().unwrap();

        table.get_or_insert(a).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        table.get_or_insert(b).await;

        // `a` was inserted first but is touched again after `b`, so it
        // is no longer the least-recently-seen entry.
        tokio::time::sleep(Duration::from_millis(2)).await;
        table.touch(a).await;

        table.get_or_insert(c).await;

        assert!(table.flows.get(&a).is_some());
        assert!(table.flows.get(&b).is_none());
        assert!(table.flows.get(&c).is_some());
    }

    #[tokio::test]
    async fn queue_overflow_drops_newest_and_counts() {
        let config = UdpListenConfig {
            ttl: Duration::from_secs(60),
            backlog: 8,
            queue_size: 1,
        };
        let table = FlowTable::new(config);
        let src: SocketAddr = "127.0.0.1:20".parse().unwrap();
        let (flow, _) = table.get_or_insert(src).await;
        flow.push_inbound(b"first".to_vec()).await;
        flow.push_inbound(b"second".to_vec()).await;
        assert_eq!(flow.drop_count(), 1);
        assert_eq!(flow.pop_inbound().await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn ttl_expiry_reaps_idle_flow() {
        let config = UdpListenConfig {
            ttl: Duration::from_millis(10),
            backlog: 8,
            queue_size: 4,
        };
        let table = FlowTable::new(config);
        let src: SocketAddr = "127.0.0.1:30".parse().unwrap();
        table.get_or_insert(src).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        table.sweep().await;
        assert_eq!(table.len(), 0);
    }
}
