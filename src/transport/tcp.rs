//! Reliable control-plane transport
//!
//! Owns the TCP listener and the table of live connections, keyed by exact
//! remote address. Inbound bytes are framed, decoded, and published as
//! [`Signal::TcpMessage`]; connection lifecycle surfaces as
//! [`Signal::TcpConnected`] / [`Signal::TcpDisconnected`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::packet::{self, Packet};
use crate::signal::{Signal, SignalSender};

struct Conn {
    writer: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

/// TCP adapter: listener plus connection table
pub struct TcpTransport {
    signals: SignalSender,
    local_addr: SocketAddr,
    conns: Mutex<HashMap<SocketAddr, Conn>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind the listener and start accepting. Bind failure is fatal to the
    /// process and is surfaced here, at startup.
    pub async fn bind(port: u16, signals: SignalSender) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "listening for TCP connections");

        let transport = Arc::new(Self {
            signals,
            local_addr,
            conns: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
        });

        let accept = tokio::spawn(Arc::clone(&transport).accept_loop(listener));
        *transport.accept_task.lock().expect("accept slot poisoned") = Some(accept);
        Ok(transport)
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Establish a connection to `addr`. Idempotent: an existing connection
    /// is left untouched.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        if self.conns.lock().expect("conn table poisoned").contains_key(&addr) {
            return Ok(());
        }

        tracing::info!(addr = %addr, "connecting to remote");
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true).ok();
        self.register(socket, addr);
        Ok(())
    }

    /// Send a packet to an already-connected peer.
    ///
    /// Fails synchronously with [`Error::NotConnected`] when no live
    /// connection to `addr` exists.
    pub fn send(&self, packet: Packet, addr: SocketAddr) -> Result<()> {
        let frame = packet::encode(&packet)?;
        tracing::debug!(packet = packet.name(), addr = %addr, "sending TCP message");

        let conns = self.conns.lock().expect("conn table poisoned");
        let conn = conns.get(&addr).ok_or(Error::NotConnected(addr))?;
        conn.writer
            .send(frame)
            .map_err(|_| Error::NotConnected(addr))
    }

    /// Send, establishing the connection first if necessary. The connection
    /// is left open.
    pub async fn send_connect(self: &Arc<Self>, packet: Packet, addr: SocketAddr) -> Result<()> {
        self.connect(addr).await?;
        self.send(packet, addr)
    }

    /// Close the connection to `addr`. Idempotent.
    pub fn close_conn(&self, addr: SocketAddr) {
        let removed = self
            .conns
            .lock()
            .expect("conn table poisoned")
            .remove(&addr);
        if let Some(conn) = removed {
            conn.reader.abort();
            self.signals.publish(Signal::TcpDisconnected { peer: addr });
        }
    }

    /// Tear down the listener and every live connection
    pub fn close_all(&self) {
        if let Some(accept) = self
            .accept_task
            .lock()
            .expect("accept slot poisoned")
            .take()
        {
            accept.abort();
        }

        let conns = std::mem::take(&mut *self.conns.lock().expect("conn table poisoned"));
        for (_, conn) in conns {
            conn.reader.abort();
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    tracing::info!(peer = %peer, "accepted TCP connection");
                    socket.set_nodelay(true).ok();
                    self.register(socket, peer);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    /// Insert the connection into the table and spawn its reader/writer tasks
    fn register(self: &Arc<Self>, socket: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = socket.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(write_half, writer_rx, peer));
        let reader = tokio::spawn(Arc::clone(self).read_loop(read_half, peer));

        self.conns.lock().expect("conn table poisoned").insert(
            peer,
            Conn {
                writer: writer_tx,
                reader,
            },
        );
        self.signals.publish(Signal::TcpConnected { peer });
    }

    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf, peer: SocketAddr) {
        let mut buf = BytesMut::with_capacity(8 * 1024);

        loop {
            loop {
                match packet::decode_frame(&mut buf) {
                    Ok(Some(packet)) => {
                        tracing::debug!(packet = packet.name(), peer = %peer, "received TCP message");
                        self.signals.publish(Signal::TcpMessage { packet, peer });
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, peer = %peer, "malformed TCP frame, dropping connection");
                        self.drop_conn(peer);
                        return;
                    }
                }
            }

            match read_half.read_buf(&mut buf).await {
                Ok(0) => {
                    tracing::info!(peer = %peer, "TCP connection closed by remote");
                    self.drop_conn(peer);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, peer = %peer, "TCP read error");
                    self.drop_conn(peer);
                    return;
                }
            }
        }
    }

    /// Remove from the table (if still present) and announce the disconnect
    fn drop_conn(&self, peer: SocketAddr) {
        let removed = self
            .conns
            .lock()
            .expect("conn table poisoned")
            .remove(&peer)
            .is_some();
        if removed {
            self.signals.publish(Signal::TcpDisconnected { peer });
        }
    }
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    peer: SocketAddr,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            tracing::warn!(error = %e, peer = %peer, "TCP write error");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalBus;
    use std::time::Duration;

    async fn recv_matching(
        rx: &mut mpsc::Receiver<Signal>,
        mut want: impl FnMut(&Signal) -> bool,
    ) -> Signal {
        loop {
            let signal = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for signal")
                .expect("bus closed");
            if want(&signal) {
                return signal;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_send_receive() {
        let bus_a = SignalBus::new();
        let bus_b = SignalBus::new();

        let a = TcpTransport::bind(0, bus_a.sender()).await.unwrap();
        let b = TcpTransport::bind(0, bus_b.sender()).await.unwrap();

        let mut b_signals = bus_b.intercept(|_| true, 0);
        let run_b = tokio::spawn(Arc::clone(&bus_b).run());

        a.connect(b.local_addr()).await.unwrap();
        a.send(Packet::Ping { id: 99 }, b.local_addr()).unwrap();

        let got = recv_matching(&mut b_signals, |s| matches!(s, Signal::TcpMessage { .. })).await;
        match got {
            Signal::TcpMessage {
                packet: Packet::Ping { id },
                ..
            } => assert_eq!(id, 99),
            other => panic!("unexpected signal {other:?}"),
        }

        bus_b.close();
        run_b.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_without_connection_fails_synchronously() {
        let bus = SignalBus::new();
        let a = TcpTransport::bind(0, bus.sender()).await.unwrap();

        let dest: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = a.send(Packet::Ping { id: 1 }, dest).unwrap_err();
        assert!(matches!(err, Error::NotConnected(addr) if addr == dest));
    }

    #[tokio::test]
    async fn test_remote_close_publishes_disconnect() {
        let bus_a = SignalBus::new();
        let bus_b = SignalBus::new();

        let a = TcpTransport::bind(0, bus_a.sender()).await.unwrap();
        let b = TcpTransport::bind(0, bus_b.sender()).await.unwrap();

        let mut a_signals = bus_a.intercept(|_| true, 0);
        let run_a = tokio::spawn(Arc::clone(&bus_a).run());

        a.connect(b.local_addr()).await.unwrap();
        // Give B a moment to register the accepted conn, then kill it
        tokio::time::sleep(Duration::from_millis(100)).await;
        b.close_all();

        let got =
            recv_matching(&mut a_signals, |s| matches!(s, Signal::TcpDisconnected { .. })).await;
        match got {
            Signal::TcpDisconnected { peer } => assert_eq!(peer, b.local_addr()),
            other => panic!("unexpected signal {other:?}"),
        }

        bus_a.close();
        run_a.await.unwrap().unwrap();
    }
}
