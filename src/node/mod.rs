//! Relay node: probe resolution, distribution trees, payload fan-out
//!
//! A node is one [`Handler`] on the signal bus. All routing state lives in a
//! single [`NodeState`] behind a mutex taken once per signal; the slow part of
//! resolution (asking media servers) runs with the lock released and feeds its
//! answer back through the same code path a network response would take.
//!
//! ```text
//!            ProbeRequest            ProbeRequest
//!   peer ──────────────▶ node ──────────────▶ neighbours
//!                          │
//!                          └──▶ servers (parallel, first hit wins)
//! ```

pub mod engine;
pub mod metrics;
pub mod tables;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::packet::{Packet, ProbeRequest, ProbeResponse};
use crate::signal::{request_tcp, Handler, Signal, SignalBus, SignalSender};
use crate::transport::{TcpTransport, UdpTransport};

pub use metrics::{LinkMetrics, MetricsMonitor};
pub use tables::{
    Downstream, NodeState, ProbeOutcome, RunningStream, StreamPhase, StreamSnapshot, WaitingStream,
};

/// A directly connected relay peer and the capacity of the link to it
#[derive(Debug, Clone, Copy)]
pub struct Neighbour {
    pub addr: SocketAddr,
    /// Usable bitrate of the link in kbit/s
    pub bandwidth: u32,
}

impl Neighbour {
    pub fn new(addr: SocketAddr, bandwidth: u32) -> Self {
        Self { addr, bandwidth }
    }
}

/// Static node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub neighbours: Vec<Neighbour>,
    /// Media servers this node can query directly; a node with at least one
    /// server is a rendezvous point and may author negative probe answers
    pub servers: Vec<SocketAddr>,
    /// How long to wait for each server's probe answer
    pub probe_timeout: Duration,
    /// How often link metrics to servers are refreshed
    pub metrics_period: Duration,
    /// Upper bound on simultaneously relayed streams; 0 means unlimited
    pub max_relay_ports: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            neighbours: Vec::new(),
            servers: Vec::new(),
            probe_timeout: Duration::from_secs(5),
            metrics_period: Duration::from_secs(10),
            max_relay_ports: 0,
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn neighbour(mut self, addr: SocketAddr, bandwidth: u32) -> Self {
        self.neighbours.push(Neighbour::new(addr, bandwidth));
        self
    }

    pub fn server(mut self, addr: SocketAddr) -> Self {
        self.servers.push(addr);
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn metrics_period(mut self, period: Duration) -> Self {
        self.metrics_period = period;
        self
    }

    pub fn max_relay_ports(mut self, max: usize) -> Self {
        self.max_relay_ports = max;
        self
    }

    /// Whether this node can consult media servers directly
    pub fn is_rendezvous(&self) -> bool {
        !self.servers.is_empty()
    }
}

/// Everything the routing engine does to the outside world.
///
/// Split out so the engine can be driven in tests without sockets.
#[async_trait]
pub trait NodeIo: Send + Sync {
    /// Open (or reuse) a control connection to `addr`
    async fn connect(&self, addr: SocketAddr) -> Result<()>;

    /// Send on an existing control connection; fails synchronously when the
    /// connection is gone
    fn send_control(&self, packet: Packet, dest: SocketAddr) -> Result<()>;

    /// Fire-and-forget payload datagram
    async fn send_media(&self, packet: &Packet, dest: SocketAddr) -> Result<()>;

    /// Ask one media server whether it carries the probed stream
    async fn probe_server(
        &self,
        request: ProbeRequest,
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<ProbeResponse>;

    /// Allocate a UDP port for receiving one stream's payload
    async fn open_relay_port(&self) -> Result<u16>;

    /// Release a previously allocated relay port
    async fn close_relay_port(&self, port: u16);

    /// Random id for a probe this node originates
    fn fresh_request_id(&self) -> u32;
}

/// Production [`NodeIo`] backed by the real transports
pub struct RuntimeIo {
    bus: Arc<SignalBus>,
    tcp: Arc<TcpTransport>,
    signals: SignalSender,
    relay_ports: Mutex<HashMap<u16, UdpTransport>>,
    max_relay_ports: usize,
}

impl RuntimeIo {
    pub fn new(bus: Arc<SignalBus>, tcp: Arc<TcpTransport>, max_relay_ports: usize) -> Self {
        let signals = bus.sender();
        Self {
            bus,
            tcp,
            signals,
            relay_ports: Mutex::new(HashMap::new()),
            max_relay_ports,
        }
    }
}

#[async_trait]
impl NodeIo for RuntimeIo {
    async fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.tcp.connect(addr).await
    }

    fn send_control(&self, packet: Packet, dest: SocketAddr) -> Result<()> {
        self.tcp.send(packet, dest)
    }

    async fn send_media(&self, packet: &Packet, dest: SocketAddr) -> Result<()> {
        // Relay ports are receive-oriented but any bound socket can send;
        // use the first one, falling back to a throwaway socket.
        let ports = self.relay_ports.lock().await;
        match ports.values().next() {
            Some(transport) => transport.send(packet, dest).await,
            None => {
                let socket = tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await?;
                let frame = crate::packet::encode(packet)?;
                socket.send_to(&frame, dest).await?;
                Ok(())
            }
        }
    }

    async fn probe_server(
        &self,
        request: ProbeRequest,
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<ProbeResponse> {
        let request_id = request.request_id;
        let answer = request_tcp(
            &self.bus,
            &self.tcp,
            Packet::ProbeRequest(request),
            server,
            move |p| {
                matches!(p, Packet::ProbeResponse(r) if r.request_id == request_id)
            },
            timeout,
        )
        .await?;
        match answer {
            Packet::ProbeResponse(response) => Ok(response),
            _ => Err(Error::ResponseTimeout(server)),
        }
    }

    async fn open_relay_port(&self) -> Result<u16> {
        let mut ports = self.relay_ports.lock().await;
        if self.max_relay_ports > 0 && ports.len() >= self.max_relay_ports {
            return Err(Error::RelayPortsExhausted);
        }
        let transport = UdpTransport::bind(0, self.signals.clone()).await?;
        let port = transport.local_port();
        ports.insert(port, transport);
        Ok(port)
    }

    async fn close_relay_port(&self, port: u16) {
        if let Some(transport) = self.relay_ports.lock().await.remove(&port) {
            transport.close();
        }
    }

    fn fresh_request_id(&self) -> u32 {
        rand::random()
    }
}

pub(crate) struct NodeInner {
    pub(crate) config: NodeConfig,
    pub(crate) io: Arc<dyn NodeIo>,
    pub(crate) state: Mutex<NodeState>,
    pub(crate) monitor: std::sync::Mutex<Option<MetricsMonitor>>,
}

/// The relay node handler. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig, io: Arc<dyn NodeIo>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                config,
                io,
                state: Mutex::new(NodeState::new()),
                monitor: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Current phase and tree edges for one stream
    pub async fn stream_snapshot(&self, stream_id: &str) -> StreamSnapshot {
        self.inner.state.lock().await.snapshot(stream_id)
    }

    pub async fn stream_phase(&self, stream_id: &str) -> StreamPhase {
        self.inner.state.lock().await.phase(stream_id)
    }

    /// Last measured quality of the link to `addr`, if the monitor has
    /// sampled it yet
    pub fn link_metrics(&self, addr: SocketAddr) -> Option<LinkMetrics> {
        self.inner
            .monitor
            .lock()
            .expect("monitor slot poisoned")
            .as_ref()
            .and_then(|m| m.get(addr))
    }

    async fn start(&self) {
        for neighbour in &self.inner.config.neighbours {
            if let Err(e) = self.inner.io.connect(neighbour.addr).await {
                tracing::warn!(error = %e, neighbour = %neighbour.addr, "cannot reach neighbour");
            }
        }
        for &server in &self.inner.config.servers {
            if let Err(e) = self.inner.io.connect(server).await {
                tracing::error!(error = %e, server = %server, "cannot reach media server");
            }
        }

        if !self.inner.config.servers.is_empty() {
            let monitor = MetricsMonitor::start(
                self.inner.config.servers.clone(),
                self.inner.config.metrics_period,
            );
            *self.inner.monitor.lock().expect("monitor slot poisoned") = Some(monitor);
        }
    }

    fn stop(&self) {
        if let Some(monitor) = self
            .inner
            .monitor
            .lock()
            .expect("monitor slot poisoned")
            .take()
        {
            monitor.stop();
        }
    }
}

#[async_trait]
impl Handler for Node {
    async fn handle(&self, signal: Signal) -> bool {
        match signal {
            Signal::Init => {
                self.start().await;
                true
            }
            Signal::Closing => {
                self.stop();
                true
            }
            Signal::TcpDisconnected { peer } => {
                self.handle_disconnect(peer).await;
                true
            }
            Signal::TcpMessage { packet, peer } => match packet {
                Packet::ProbeRequest(request) => {
                    self.drive_probe_request(request, Some(peer)).await;
                    true
                }
                Packet::ProbeResponse(response) => {
                    self.drive_probe_response(response, Some(peer)).await;
                    true
                }
                Packet::StreamRequest {
                    stream_id,
                    request_id,
                    port,
                } => {
                    self.drive_stream_request(
                        &stream_id,
                        request_id,
                        vec![Downstream::new(peer, port)],
                    )
                    .await;
                    true
                }
                Packet::StreamResponse {
                    stream_id,
                    description,
                } => {
                    let mut state = self.inner.state.lock().await;
                    self.handle_stream_response(&mut state, &stream_id, description, peer)
                        .await;
                    true
                }
                Packet::StreamCancel { stream_id, port } => {
                    let mut state = self.inner.state.lock().await;
                    self.cancel_stream(&mut state, &stream_id, peer, port).await;
                    true
                }
                Packet::StreamEnd { stream_id } => {
                    let mut state = self.inner.state.lock().await;
                    self.handle_stream_end(&mut state, &stream_id, peer).await;
                    true
                }
                _ => false,
            },
            Signal::UdpMessage {
                packet: packet @ Packet::StreamPacket { .. },
                local_port,
                ..
            } => {
                self.relay_media(packet, local_port).await;
                true
            }
            _ => false,
        }
    }
}
