//! Stream client: the leaf of a distribution tree
//!
//! A client asks its access node for one stream and hands everything that
//! arrives to a [`MediaSink`]. The player consuming the sink is outside this
//! crate. An unresolvable stream surfaces as an explicit end-of-stream on the
//! sink, never as a silent timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::packet::{MediaKind, Packet};
use crate::signal::{Handler, Signal};
use crate::transport::TcpTransport;

/// Receives the stream on behalf of the player
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// One payload chunk, in arrival order with possible loss
    async fn deliver(&self, kind: MediaKind, payload: Bytes);

    /// The stream ended, could not be resolved, or the runtime is closing
    async fn stream_ended(&self);
}

/// The client signal handler
pub struct StreamClient {
    stream_id: String,
    access_node: SocketAddr,
    /// Local UDP port payload should be delivered to
    media_port: u16,
    request_id: u32,
    sink: Arc<dyn MediaSink>,
    tcp: Arc<TcpTransport>,
    description: StdMutex<Option<String>>,
    ended: AtomicBool,
}

impl StreamClient {
    pub fn new(
        stream_id: impl Into<String>,
        access_node: SocketAddr,
        media_port: u16,
        sink: Arc<dyn MediaSink>,
        tcp: Arc<TcpTransport>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            access_node,
            media_port,
            request_id: rand::random(),
            sink,
            tcp,
            description: StdMutex::new(None),
            ended: AtomicBool::new(false),
        }
    }

    /// Session description from the subscription confirmation, once received
    pub fn description(&self) -> Option<String> {
        self.description
            .lock()
            .expect("description slot poisoned")
            .clone()
    }

    async fn end_once(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.sink.stream_ended().await;
        }
    }
}

#[async_trait]
impl Handler for StreamClient {
    async fn handle(&self, signal: Signal) -> bool {
        match signal {
            Signal::Init => {
                tracing::info!(
                    stream = %self.stream_id,
                    access_node = %self.access_node,
                    port = self.media_port,
                    "requesting stream"
                );
                let request = Packet::StreamRequest {
                    stream_id: self.stream_id.clone(),
                    request_id: self.request_id,
                    port: self.media_port,
                };
                if let Err(e) = self.tcp.send_connect(request, self.access_node).await {
                    tracing::error!(error = %e, access_node = %self.access_node, "cannot reach access node");
                    self.end_once().await;
                }
                true
            }
            Signal::Closing => {
                // Unsubscribe politely; the access node also notices the
                // connection closing.
                let cancel = Packet::StreamCancel {
                    stream_id: self.stream_id.clone(),
                    port: self.media_port,
                };
                if self.tcp.send(cancel, self.access_node).is_err() {
                    tracing::debug!(access_node = %self.access_node, "access node already gone");
                }
                self.end_once().await;
                true
            }
            Signal::TcpDisconnected { peer } if peer == self.access_node => {
                tracing::warn!(access_node = %peer, "lost access node");
                self.end_once().await;
                true
            }
            Signal::TcpMessage { packet, peer } if peer == self.access_node => match packet {
                Packet::StreamResponse {
                    stream_id,
                    description,
                } if stream_id == self.stream_id => {
                    tracing::info!(stream = %stream_id, "subscription confirmed");
                    *self
                        .description
                        .lock()
                        .expect("description slot poisoned") = Some(description);
                    true
                }
                Packet::StreamEnd { stream_id } if stream_id == self.stream_id => {
                    tracing::info!(stream = %stream_id, "stream ended");
                    self.end_once().await;
                    true
                }
                _ => false,
            },
            Signal::UdpMessage {
                packet:
                    Packet::StreamPacket {
                        stream_id,
                        kind,
                        payload,
                    },
                ..
            } if stream_id == self.stream_id => {
                self.sink.deliver(kind, payload).await;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalBus;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        chunks: StdMutex<Vec<Bytes>>,
        ended: StdMutex<bool>,
    }

    #[async_trait]
    impl MediaSink for RecordingSink {
        async fn deliver(&self, _kind: MediaKind, payload: Bytes) {
            self.chunks.lock().unwrap().push(payload);
        }

        async fn stream_ended(&self) {
            *self.ended.lock().unwrap() = true;
        }
    }

    async fn client_fixture() -> (Arc<RecordingSink>, StreamClient, SocketAddr) {
        let bus = SignalBus::new();
        let tcp = TcpTransport::bind(0, bus.sender()).await.unwrap();
        let access: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let client =
            StreamClient::new("s1", access, 6000, Arc::clone(&sink) as Arc<dyn MediaSink>, tcp);
        (sink, client, access)
    }

    #[tokio::test]
    async fn test_payload_reaches_sink() {
        let (sink, client, _access) = client_fixture().await;

        let consumed = client
            .handle(Signal::UdpMessage {
                packet: Packet::StreamPacket {
                    stream_id: "s1".into(),
                    kind: MediaKind::Video,
                    payload: Bytes::from_static(b"frame"),
                },
                peer: "127.0.0.1:5000".parse().unwrap(),
                local_port: 6000,
            })
            .await;
        assert!(consumed);
        assert_eq!(sink.chunks.lock().unwrap().len(), 1);

        // Payload for a different stream falls through
        let consumed = client
            .handle(Signal::UdpMessage {
                packet: Packet::StreamPacket {
                    stream_id: "other".into(),
                    kind: MediaKind::Video,
                    payload: Bytes::from_static(b"frame"),
                },
                peer: "127.0.0.1:5000".parse().unwrap(),
                local_port: 6000,
            })
            .await;
        assert!(!consumed);
    }

    #[tokio::test]
    async fn test_confirmation_records_description() {
        let (_sink, client, access) = client_fixture().await;

        client
            .handle(Signal::TcpMessage {
                packet: Packet::StreamResponse {
                    stream_id: "s1".into(),
                    description: "sdp".into(),
                },
                peer: access,
            })
            .await;
        assert_eq!(client.description().as_deref(), Some("sdp"));
    }

    #[tokio::test]
    async fn test_stream_end_hits_sink_once() {
        let (sink, client, access) = client_fixture().await;

        client
            .handle(Signal::TcpMessage {
                packet: Packet::StreamEnd {
                    stream_id: "s1".into(),
                },
                peer: access,
            })
            .await;
        assert!(*sink.ended.lock().unwrap());

        // Losing the access node afterwards does not re-notify
        *sink.ended.lock().unwrap() = false;
        client
            .handle(Signal::TcpDisconnected { peer: access })
            .await;
        assert!(!*sink.ended.lock().unwrap());
    }

    #[tokio::test]
    async fn test_end_from_stranger_ignored() {
        let (sink, client, _access) = client_fixture().await;

        let consumed = client
            .handle(Signal::TcpMessage {
                packet: Packet::StreamEnd {
                    stream_id: "s1".into(),
                },
                peer: "127.0.0.1:1234".parse().unwrap(),
            })
            .await;
        assert!(!consumed);
        assert!(!*sink.ended.lock().unwrap());
    }
}
