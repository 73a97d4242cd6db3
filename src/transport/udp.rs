//! Best-effort media-plane transport
//!
//! One bound datagram socket per instance. Relay nodes open one of these per
//! relayed stream (the "relay port"); inbound datagrams decode into
//! [`Signal::UdpMessage`] carrying the local port they arrived on so handlers
//! can tell relay sockets apart.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::packet::{self, Packet};
use crate::signal::{Signal, SignalSender};

/// Largest datagram we accept; RTP payloads stay far below this
const MAX_DATAGRAM: usize = 65_536;

/// UDP adapter bound to a single local port
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_port: u16,
    recv_task: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind to `port` (0 picks an ephemeral port) and start receiving
    pub async fn bind(port: u16, signals: SignalSender) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        let local_port = socket.local_addr()?.port();
        tracing::info!(port = local_port, "listening for UDP messages");

        let recv_task = tokio::spawn(recv_loop(Arc::clone(&socket), local_port, signals));
        Ok(Self {
            socket,
            local_port,
            recv_task,
        })
    }

    /// Port this socket is bound to
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Fire-and-forget send
    pub async fn send(&self, packet: &Packet, dest: SocketAddr) -> Result<()> {
        let frame = packet::encode(packet)?;
        self.socket.send_to(&frame, dest).await?;
        Ok(())
    }

    /// Stop receiving and release the socket
    pub fn close(&self) {
        self.recv_task.abort();
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, local_port: u16, signals: SignalSender) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                let mut frame = BytesMut::from(&buf[..n]);
                match packet::decode_frame(&mut frame) {
                    Ok(Some(packet)) => {
                        signals.publish(Signal::UdpMessage {
                            packet,
                            peer,
                            local_port,
                        });
                    }
                    Ok(None) => {
                        tracing::warn!(peer = %peer, len = n, "short UDP datagram dropped");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, peer = %peer, "malformed UDP datagram dropped");
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "error receiving UDP message");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalBus;
    use std::time::Duration;

    #[tokio::test]
    async fn test_datagram_roundtrip_carries_local_port() {
        let bus = SignalBus::new();
        let receiver = UdpTransport::bind(0, bus.sender()).await.unwrap();
        let sender = UdpTransport::bind(0, bus.sender()).await.unwrap();

        let mut signals = bus.intercept(|s| matches!(s, Signal::UdpMessage { .. }), 1);
        let run = tokio::spawn(Arc::clone(&bus).run());

        let dest: SocketAddr = format!("127.0.0.1:{}", receiver.local_port())
            .parse()
            .unwrap();
        sender.send(&Packet::Ping { id: 3 }, dest).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), signals.recv())
            .await
            .unwrap()
            .unwrap();
        match got {
            Signal::UdpMessage {
                packet: Packet::Ping { id },
                local_port,
                ..
            } => {
                assert_eq!(id, 3);
                assert_eq!(local_port, receiver.local_port());
            }
            other => panic!("unexpected signal {other:?}"),
        }

        bus.close();
        run.await.unwrap().unwrap();
    }
}
