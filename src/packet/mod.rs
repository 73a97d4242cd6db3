//! Wire packet types
//!
//! The overlay speaks a small tagged-union protocol. Every packet is framed as
//! a 2-byte little-endian body length, a 1-byte type tag, and the body. The
//! same frames travel over both the reliable control connections (TCP) and the
//! best-effort media path (UDP).

pub mod codec;

use std::net::SocketAddr;

use bytes::Bytes;

pub use codec::{decode_body, decode_frame, encode, CodecError, HEADER_LEN};

/// Role a peer announces to the bootstrapper at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Bootstrapper,
    Client,
    Node,
    Server,
}

/// Media payload category carried by a [`Packet::StreamPacket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    VideoControl,
    AudioControl,
}

/// Static properties of a stream, learned from probe responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamMetadata {
    /// Average bitrate in kbit/s, used for link admission control
    pub bitrate: u32,
}

/// Flooded query: does anyone serve this stream, and where?
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub stream_id: String,
    /// Random value chosen by the original requester; travels unchanged
    /// through every relay and suppresses flood loops.
    pub request_id: u32,
}

impl ProbeRequest {
    /// Build the positive answer to this probe
    pub fn respond_existing(&self, metadata: StreamMetadata) -> ProbeResponse {
        ProbeResponse {
            stream_id: self.stream_id.clone(),
            request_id: self.request_id,
            exists: true,
            metadata,
        }
    }

    /// Build the negative answer to this probe
    pub fn respond_missing(&self) -> ProbeResponse {
        ProbeResponse {
            stream_id: self.stream_id.clone(),
            request_id: self.request_id,
            exists: false,
            metadata: StreamMetadata::default(),
        }
    }
}

/// Answer to a [`ProbeRequest`]. A negative answer still propagates so that
/// waiting subscribers learn the stream cannot be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub stream_id: String,
    pub request_id: u32,
    pub exists: bool,
    /// Meaningful only when `exists` is true
    pub metadata: StreamMetadata,
}

/// A wire packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Peer announcing itself to the bootstrapper
    StartupRequest { role: PeerRole },
    /// Bootstrapper assignment: neighbour edges for nodes, an access node
    /// for clients. Handled by the bootstrap collaborator, not this crate.
    StartupResponse {
        neighbours: Vec<SocketAddr>,
        servers: Vec<SocketAddr>,
        access_node: Option<SocketAddr>,
    },
    /// Latency probe; the receiver echoes it back unchanged
    Ping { id: u32 },
    ProbeRequest(ProbeRequest),
    ProbeResponse(ProbeResponse),
    /// Subscribe to a stream; `port` is the UDP port payload should be
    /// delivered to on the requester's host
    StreamRequest {
        stream_id: String,
        request_id: u32,
        port: u16,
    },
    /// Upstream confirmation of a subscription, carrying the session
    /// description the decoder needs
    StreamResponse {
        stream_id: String,
        description: String,
    },
    /// Unsubscribe the given delivery port from a stream
    StreamCancel { stream_id: String, port: u16 },
    /// The stream ended or could not be resolved
    StreamEnd { stream_id: String },
    /// One chunk of media payload (RTP-style, opaque to the overlay)
    StreamPacket {
        stream_id: String,
        kind: MediaKind,
        payload: Bytes,
    },
}

impl Packet {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Packet::StartupRequest { .. } => "StartupRequest",
            Packet::StartupResponse { .. } => "StartupResponse",
            Packet::Ping { .. } => "Ping",
            Packet::ProbeRequest(_) => "ProbeRequest",
            Packet::ProbeResponse(_) => "ProbeResponse",
            Packet::StreamRequest { .. } => "StreamRequest",
            Packet::StreamResponse { .. } => "StreamResponse",
            Packet::StreamCancel { .. } => "StreamCancel",
            Packet::StreamEnd { .. } => "StreamEnd",
            Packet::StreamPacket { .. } => "StreamPacket",
        }
    }
}
