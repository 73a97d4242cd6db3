//! Signal bus and dispatch runtime
//!
//! Every peer process (node, media server, client) is built on the same
//! event runtime: transport adapters turn socket activity into typed
//! [`Signal`]s and push them onto a single ordered queue; the [`SignalBus`]
//! hands each signal to a LIFO stack of [`Handler`]s. A temporary
//! [interceptor](SignalBus::intercept) can claim specific future signals
//! ahead of the ordinary handlers, which is what makes "send a request, then
//! wait for the matching response" expressible without losing other traffic.

pub mod bus;
pub mod interceptor;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::packet::Packet;

pub use bus::{HandlerId, PauseGuard, SignalBus, SignalSender};
pub use interceptor::request_tcp;

/// A typed event delivered through the bus
#[derive(Debug, Clone)]
pub enum Signal {
    /// The runtime has started; handlers may begin connecting out
    Init,
    /// Terminal signal, delivered to every handler during shutdown
    Closing,
    /// A TCP peer connected to our listener
    TcpConnected { peer: SocketAddr },
    /// A TCP connection ended (either side, for any reason)
    TcpDisconnected { peer: SocketAddr },
    /// A packet arrived on a TCP connection
    TcpMessage { packet: Packet, peer: SocketAddr },
    /// A datagram arrived on one of our UDP sockets
    UdpMessage {
        packet: Packet,
        peer: SocketAddr,
        /// Local port the datagram arrived on (relay ports are per-stream)
        local_port: u16,
    },
}

impl Signal {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Init => "Init",
            Signal::Closing => "Closing",
            Signal::TcpConnected { .. } => "TcpConnected",
            Signal::TcpDisconnected { .. } => "TcpDisconnected",
            Signal::TcpMessage { .. } => "TcpMessage",
            Signal::UdpMessage { .. } => "UdpMessage",
        }
    }

    /// Signals sharing an ordering key are dispatched in arrival order;
    /// everything else dispatches concurrently. TCP signals are keyed by the
    /// connection so one peer's messages never overtake each other.
    pub(crate) fn ordering_key(&self) -> Option<SocketAddr> {
        match self {
            Signal::TcpConnected { peer }
            | Signal::TcpDisconnected { peer }
            | Signal::TcpMessage { peer, .. } => Some(*peer),
            _ => None,
        }
    }
}

/// A participant in the dispatch stack.
///
/// Returning `true` marks the signal as consumed and stops the chain.
/// Handlers may add or remove handlers (including themselves) from within
/// `handle`; dispatch iterates over a snapshot of the stack.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, signal: Signal) -> bool;
}
