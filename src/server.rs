//! Media server: the authoritative origin of streams
//!
//! A media server carries a static catalog of streams. It answers probes
//! authoritatively (it either has the stream or it does not), confirms
//! subscriptions, and pumps payload chunks from a [`MediaSource`] to every
//! subscriber over UDP. The transcoder feeding a real deployment sits behind
//! the `MediaSource` seam and is not part of this crate.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::node::Downstream;
use crate::packet::{MediaKind, Packet, StreamMetadata};
use crate::signal::{Handler, Signal};
use crate::transport::{TcpTransport, UdpTransport};

/// Supplies one stream's payload chunks to the pump
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Next chunk, paced by the source; `None` ends the stream
    async fn next_chunk(&self) -> Option<(MediaKind, Bytes)>;
}

/// One catalog entry
pub struct StreamSource {
    pub metadata: StreamMetadata,
    pub description: String,
    pub source: Arc<dyn MediaSource>,
}

/// The set of streams a server offers
#[derive(Default)]
pub struct ServerCatalog {
    streams: HashMap<String, StreamSource>,
}

impl ServerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(
        mut self,
        stream_id: impl Into<String>,
        bitrate: u32,
        description: impl Into<String>,
        source: Arc<dyn MediaSource>,
    ) -> Self {
        self.streams.insert(
            stream_id.into(),
            StreamSource {
                metadata: StreamMetadata { bitrate },
                description: description.into(),
                source,
            },
        );
        self
    }

    pub fn get(&self, stream_id: &str) -> Option<&StreamSource> {
        self.streams.get(stream_id)
    }
}

struct Pump {
    subscribers: Arc<StdMutex<HashSet<Downstream>>>,
    task: JoinHandle<()>,
}

/// The media server signal handler
pub struct MediaServer {
    catalog: ServerCatalog,
    tcp: Arc<TcpTransport>,
    udp: Arc<UdpTransport>,
    pumps: StdMutex<HashMap<String, Pump>>,
}

impl MediaServer {
    pub fn new(catalog: ServerCatalog, tcp: Arc<TcpTransport>, udp: Arc<UdpTransport>) -> Self {
        Self {
            catalog,
            tcp,
            udp,
            pumps: StdMutex::new(HashMap::new()),
        }
    }

    /// Subscribers currently fed for `stream_id`
    pub fn subscriber_count(&self, stream_id: &str) -> usize {
        self.pumps
            .lock()
            .expect("pump table poisoned")
            .get(stream_id)
            .map(|p| p.subscribers.lock().expect("subscriber set poisoned").len())
            .unwrap_or(0)
    }

    fn subscribe(&self, stream_id: &str, dest: Downstream) {
        let Some(entry) = self.catalog.get(stream_id) else {
            tracing::info!(stream = stream_id, peer = %dest.control, "request for unknown stream");
            if let Err(e) = self.tcp.send(
                Packet::StreamEnd {
                    stream_id: stream_id.to_string(),
                },
                dest.control,
            ) {
                tracing::warn!(error = %e, peer = %dest.control, "failed to refuse stream request");
            }
            return;
        };

        {
            let mut pumps = self.pumps.lock().expect("pump table poisoned");
            let pump = pumps.entry(stream_id.to_string()).or_insert_with(|| {
                tracing::info!(stream = stream_id, "starting pump");
                let subscribers = Arc::new(StdMutex::new(HashSet::new()));
                let task = tokio::spawn(pump_stream(
                    stream_id.to_string(),
                    Arc::clone(&entry.source),
                    Arc::clone(&subscribers),
                    Arc::clone(&self.udp),
                    Arc::clone(&self.tcp),
                ));
                Pump { subscribers, task }
            });
            pump.subscribers
                .lock()
                .expect("subscriber set poisoned")
                .insert(dest);
        }

        tracing::info!(stream = stream_id, subscriber = %dest.control, port = dest.media_port, "subscriber joined");
        let response = Packet::StreamResponse {
            stream_id: stream_id.to_string(),
            description: entry.description.clone(),
        };
        if let Err(e) = self.tcp.send(response, dest.control) {
            tracing::warn!(error = %e, peer = %dest.control, "failed to confirm subscription");
        }
    }

    fn unsubscribe(&self, stream_id: &str, dest: Downstream) {
        let mut pumps = self.pumps.lock().expect("pump table poisoned");
        let Some(pump) = pumps.get_mut(stream_id) else {
            tracing::debug!(stream = stream_id, "cancel for stream without pump");
            return;
        };
        pump.subscribers
            .lock()
            .expect("subscriber set poisoned")
            .remove(&dest);
        if pump
            .subscribers
            .lock()
            .expect("subscriber set poisoned")
            .is_empty()
        {
            tracing::info!(stream = stream_id, "last subscriber gone, stopping pump");
            pump.task.abort();
            pumps.remove(stream_id);
        }
    }

    fn drop_peer(&self, peer: SocketAddr) {
        let mut pumps = self.pumps.lock().expect("pump table poisoned");
        pumps.retain(|stream_id, pump| {
            let mut subscribers = pump.subscribers.lock().expect("subscriber set poisoned");
            subscribers.retain(|d| d.control != peer);
            if subscribers.is_empty() {
                tracing::info!(stream = %stream_id, "last subscriber gone, stopping pump");
                pump.task.abort();
                false
            } else {
                true
            }
        });
    }

    fn stop_all(&self) {
        let pumps = std::mem::take(&mut *self.pumps.lock().expect("pump table poisoned"));
        for (_, pump) in pumps {
            pump.task.abort();
        }
    }
}

/// Feed one stream's chunks to its current subscriber set until the source
/// runs dry, then declare the stream over
async fn pump_stream(
    stream_id: String,
    source: Arc<dyn MediaSource>,
    subscribers: Arc<StdMutex<HashSet<Downstream>>>,
    udp: Arc<UdpTransport>,
    tcp: Arc<TcpTransport>,
) {
    while let Some((kind, payload)) = source.next_chunk().await {
        let packet = Packet::StreamPacket {
            stream_id: stream_id.clone(),
            kind,
            payload,
        };
        let dests: Vec<SocketAddr> = subscribers
            .lock()
            .expect("subscriber set poisoned")
            .iter()
            .map(|d| d.media_addr())
            .collect();
        for dest in dests {
            if let Err(e) = udp.send(&packet, dest).await {
                tracing::debug!(error = %e, dest = %dest, "payload send failed");
            }
        }
    }

    tracing::info!(stream = %stream_id, "source exhausted, ending stream");
    let notice = Packet::StreamEnd {
        stream_id: stream_id.clone(),
    };
    let controls: Vec<SocketAddr> = subscribers
        .lock()
        .expect("subscriber set poisoned")
        .iter()
        .map(|d| d.control)
        .collect();
    for control in controls {
        if let Err(e) = tcp.send(notice.clone(), control) {
            tracing::warn!(error = %e, peer = %control, "failed to deliver stream end");
        }
    }
}

#[async_trait]
impl Handler for MediaServer {
    async fn handle(&self, signal: Signal) -> bool {
        match signal {
            Signal::Closing => {
                self.stop_all();
                true
            }
            Signal::TcpDisconnected { peer } => {
                self.drop_peer(peer);
                true
            }
            Signal::TcpMessage { packet, peer } => match packet {
                Packet::ProbeRequest(request) => {
                    let response = match self.catalog.get(&request.stream_id) {
                        Some(entry) => request.respond_existing(entry.metadata),
                        None => request.respond_missing(),
                    };
                    tracing::debug!(
                        stream = %request.stream_id,
                        exists = response.exists,
                        peer = %peer,
                        "answering probe"
                    );
                    if let Err(e) = self.tcp.send(Packet::ProbeResponse(response), peer) {
                        tracing::warn!(error = %e, peer = %peer, "failed to answer probe");
                    }
                    true
                }
                Packet::StreamRequest {
                    stream_id, port, ..
                } => {
                    self.subscribe(&stream_id, Downstream::new(peer, port));
                    true
                }
                Packet::StreamCancel { stream_id, port } => {
                    self.unsubscribe(&stream_id, Downstream::new(peer, port));
                    true
                }
                _ => false,
            },
            Signal::UdpMessage {
                packet: Packet::Ping { id },
                peer,
                ..
            } => {
                if let Err(e) = self.udp.send(&Packet::Ping { id }, peer).await {
                    tracing::debug!(error = %e, peer = %peer, "ping echo failed");
                }
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ProbeRequest;
    use crate::signal::SignalBus;
    use std::time::Duration;
    use tokio::sync::Mutex as TokioMutex;

    /// Emits a fixed set of chunks, one every few milliseconds
    struct ScriptedSource {
        chunks: TokioMutex<Vec<Bytes>>,
    }

    impl ScriptedSource {
        fn new(count: usize) -> Arc<Self> {
            Arc::new(Self {
                chunks: TokioMutex::new(vec![Bytes::from_static(b"chunk"); count]),
            })
        }
    }

    #[async_trait]
    impl MediaSource for ScriptedSource {
        async fn next_chunk(&self) -> Option<(MediaKind, Bytes)> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.chunks
                .lock()
                .await
                .pop()
                .map(|payload| (MediaKind::Video, payload))
        }
    }

    async fn server_fixture(
        catalog: ServerCatalog,
    ) -> (Arc<SignalBus>, Arc<TcpTransport>, Arc<MediaServer>) {
        let bus = SignalBus::new();
        let tcp = TcpTransport::bind(0, bus.sender()).await.unwrap();
        let udp = Arc::new(UdpTransport::bind(0, bus.sender()).await.unwrap());
        let server = Arc::new(MediaServer::new(catalog, Arc::clone(&tcp), udp));
        bus.add_handler(Arc::clone(&server) as Arc<dyn Handler>);
        (bus, tcp, server)
    }

    #[tokio::test]
    async fn test_probe_answered_from_catalog() {
        let catalog = ServerCatalog::new().stream("s1", 300, "sdp", ScriptedSource::new(0));
        let (bus, server_tcp, _server) = server_fixture(catalog).await;
        let run = tokio::spawn(Arc::clone(&bus).run());

        // A raw peer asks about a present and an absent stream
        let peer_bus = SignalBus::new();
        let peer_tcp = TcpTransport::bind(0, peer_bus.sender()).await.unwrap();
        let mut answers = peer_bus.intercept(
            |s| matches!(s, Signal::TcpMessage { packet: Packet::ProbeResponse(_), .. }),
            2,
        );
        let peer_run = tokio::spawn(Arc::clone(&peer_bus).run());

        peer_tcp
            .send_connect(
                Packet::ProbeRequest(ProbeRequest {
                    stream_id: "s1".into(),
                    request_id: 1,
                }),
                server_tcp.local_addr(),
            )
            .await
            .unwrap();
        peer_tcp
            .send(
                Packet::ProbeRequest(ProbeRequest {
                    stream_id: "missing".into(),
                    request_id: 2,
                }),
                server_tcp.local_addr(),
            )
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let signal = tokio::time::timeout(Duration::from_secs(2), answers.recv())
                .await
                .unwrap()
                .unwrap();
            if let Signal::TcpMessage {
                packet: Packet::ProbeResponse(response),
                ..
            } = signal
            {
                seen.push((response.request_id, response.exists));
            }
        }
        seen.sort();
        assert_eq!(seen, [(1, true), (2, false)]);

        bus.close();
        peer_bus.close();
        run.await.unwrap().unwrap();
        peer_run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_subscription_confirmed_and_fed() {
        let catalog = ServerCatalog::new().stream("s1", 300, "sdp", ScriptedSource::new(50));
        let (bus, server_tcp, server) = server_fixture(catalog).await;
        let run = tokio::spawn(Arc::clone(&bus).run());

        let peer_bus = SignalBus::new();
        let peer_tcp = TcpTransport::bind(0, peer_bus.sender()).await.unwrap();
        let peer_udp = UdpTransport::bind(0, peer_bus.sender()).await.unwrap();
        let mut confirmations = peer_bus.intercept(
            |s| matches!(s, Signal::TcpMessage { packet: Packet::StreamResponse { .. }, .. }),
            1,
        );
        let mut payloads = peer_bus.intercept(
            |s| matches!(s, Signal::UdpMessage { packet: Packet::StreamPacket { .. }, .. }),
            1,
        );
        let peer_run = tokio::spawn(Arc::clone(&peer_bus).run());

        peer_tcp
            .send_connect(
                Packet::StreamRequest {
                    stream_id: "s1".into(),
                    request_id: 1,
                    port: peer_udp.local_port(),
                },
                server_tcp.local_addr(),
            )
            .await
            .unwrap();

        let confirmed = tokio::time::timeout(Duration::from_secs(2), confirmations.recv())
            .await
            .unwrap()
            .unwrap();
        match confirmed {
            Signal::TcpMessage {
                packet: Packet::StreamResponse { description, .. },
                ..
            } => assert_eq!(description, "sdp"),
            other => panic!("unexpected signal {other:?}"),
        }
        assert_eq!(server.subscriber_count("s1"), 1);

        // Payload flows to the requested UDP port
        let payload = tokio::time::timeout(Duration::from_secs(2), payloads.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            payload,
            Signal::UdpMessage {
                packet: Packet::StreamPacket { .. },
                ..
            }
        ));

        // Cancelling the only subscriber stops the pump
        peer_tcp
            .send(
                Packet::StreamCancel {
                    stream_id: "s1".into(),
                    port: peer_udp.local_port(),
                },
                server_tcp.local_addr(),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.subscriber_count("s1"), 0);

        bus.close();
        peer_bus.close();
        run.await.unwrap().unwrap();
        peer_run.await.unwrap().unwrap();
    }
}
