//! Packet encoding and decoding
//!
//! Frame layout: `u16` little-endian body length, `u8` type tag, body. Strings
//! are a `u16` length followed by UTF-8 bytes. Addresses are a family byte
//! (4 or 6), the raw octets, and a `u16` port. All integers little-endian.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{MediaKind, Packet, PeerRole, ProbeRequest, ProbeResponse, StreamMetadata};

/// Bytes of framing before the body: length (2) + tag (1)
pub const HEADER_LEN: usize = 3;

const TAG_STARTUP_REQUEST: u8 = 0;
const TAG_STARTUP_RESPONSE: u8 = 1;
const TAG_PING: u8 = 2;
const TAG_PROBE_REQUEST: u8 = 3;
const TAG_PROBE_RESPONSE: u8 = 4;
const TAG_STREAM_REQUEST: u8 = 5;
const TAG_STREAM_RESPONSE: u8 = 6;
const TAG_STREAM_CANCEL: u8 = 7;
const TAG_STREAM_END: u8 = 8;
const TAG_STREAM_PACKET: u8 = 9;

/// Errors produced while encoding or decoding packets
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown packet tag {0}")]
    UnknownTag(u8),
    #[error("frame truncated")]
    Truncated,
    #[error("packet body exceeds maximum frame size")]
    Oversize,
    #[error("string field is not valid UTF-8")]
    BadUtf8,
    #[error("unknown peer role {0}")]
    BadRole(u8),
    #[error("unknown media kind {0}")]
    BadKind(u8),
    #[error("unknown address family {0}")]
    BadAddrFamily(u8),
}

/// Encode a packet into a complete wire frame
pub fn encode(packet: &Packet) -> Result<Bytes, CodecError> {
    let mut body = BytesMut::with_capacity(64);
    let tag = encode_body(packet, &mut body)?;

    if body.len() > u16::MAX as usize {
        return Err(CodecError::Oversize);
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    frame.put_u16_le(body.len() as u16);
    frame.put_u8(tag);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Try to decode one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` if the buffer does not yet hold a full frame; the
/// buffer is left untouched in that case.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let body_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < HEADER_LEN + body_len {
        return Ok(None);
    }

    buf.advance(2);
    let tag = buf.get_u8();
    let mut body = buf.split_to(body_len).freeze();
    decode_body(tag, &mut body).map(Some)
}

fn encode_body(packet: &Packet, buf: &mut BytesMut) -> Result<u8, CodecError> {
    let tag = match packet {
        Packet::StartupRequest { role } => {
            buf.put_u8(role_code(*role));
            TAG_STARTUP_REQUEST
        }
        Packet::StartupResponse {
            neighbours,
            servers,
            access_node,
        } => {
            put_addr_list(buf, neighbours)?;
            put_addr_list(buf, servers)?;
            match access_node {
                Some(addr) => {
                    buf.put_u8(1);
                    put_addr(buf, addr);
                }
                None => buf.put_u8(0),
            }
            TAG_STARTUP_RESPONSE
        }
        Packet::Ping { id } => {
            buf.put_u32_le(*id);
            TAG_PING
        }
        Packet::ProbeRequest(req) => {
            put_string(buf, &req.stream_id)?;
            buf.put_u32_le(req.request_id);
            TAG_PROBE_REQUEST
        }
        Packet::ProbeResponse(resp) => {
            put_string(buf, &resp.stream_id)?;
            buf.put_u32_le(resp.request_id);
            buf.put_u8(resp.exists as u8);
            buf.put_u32_le(resp.metadata.bitrate);
            TAG_PROBE_RESPONSE
        }
        Packet::StreamRequest {
            stream_id,
            request_id,
            port,
        } => {
            put_string(buf, stream_id)?;
            buf.put_u32_le(*request_id);
            buf.put_u16_le(*port);
            TAG_STREAM_REQUEST
        }
        Packet::StreamResponse {
            stream_id,
            description,
        } => {
            put_string(buf, stream_id)?;
            put_string(buf, description)?;
            TAG_STREAM_RESPONSE
        }
        Packet::StreamCancel { stream_id, port } => {
            put_string(buf, stream_id)?;
            buf.put_u16_le(*port);
            TAG_STREAM_CANCEL
        }
        Packet::StreamEnd { stream_id } => {
            put_string(buf, stream_id)?;
            TAG_STREAM_END
        }
        Packet::StreamPacket {
            stream_id,
            kind,
            payload,
        } => {
            put_string(buf, stream_id)?;
            buf.put_u8(kind_code(*kind));
            buf.extend_from_slice(payload);
            TAG_STREAM_PACKET
        }
    };
    Ok(tag)
}

/// Decode a packet body given its type tag
pub fn decode_body(tag: u8, buf: &mut Bytes) -> Result<Packet, CodecError> {
    match tag {
        TAG_STARTUP_REQUEST => {
            let role = role_from(get_u8(buf)?)?;
            Ok(Packet::StartupRequest { role })
        }
        TAG_STARTUP_RESPONSE => {
            let neighbours = get_addr_list(buf)?;
            let servers = get_addr_list(buf)?;
            let access_node = match get_u8(buf)? {
                0 => None,
                _ => Some(get_addr(buf)?),
            };
            Ok(Packet::StartupResponse {
                neighbours,
                servers,
                access_node,
            })
        }
        TAG_PING => Ok(Packet::Ping { id: get_u32(buf)? }),
        TAG_PROBE_REQUEST => Ok(Packet::ProbeRequest(ProbeRequest {
            stream_id: get_string(buf)?,
            request_id: get_u32(buf)?,
        })),
        TAG_PROBE_RESPONSE => Ok(Packet::ProbeResponse(ProbeResponse {
            stream_id: get_string(buf)?,
            request_id: get_u32(buf)?,
            exists: get_u8(buf)? != 0,
            metadata: StreamMetadata {
                bitrate: get_u32(buf)?,
            },
        })),
        TAG_STREAM_REQUEST => Ok(Packet::StreamRequest {
            stream_id: get_string(buf)?,
            request_id: get_u32(buf)?,
            port: get_u16(buf)?,
        }),
        TAG_STREAM_RESPONSE => Ok(Packet::StreamResponse {
            stream_id: get_string(buf)?,
            description: get_string(buf)?,
        }),
        TAG_STREAM_CANCEL => Ok(Packet::StreamCancel {
            stream_id: get_string(buf)?,
            port: get_u16(buf)?,
        }),
        TAG_STREAM_END => Ok(Packet::StreamEnd {
            stream_id: get_string(buf)?,
        }),
        TAG_STREAM_PACKET => {
            let stream_id = get_string(buf)?;
            let kind = kind_from(get_u8(buf)?)?;
            let payload = buf.split_to(buf.len());
            Ok(Packet::StreamPacket {
                stream_id,
                kind,
                payload,
            })
        }
        other => Err(CodecError::UnknownTag(other)),
    }
}

fn role_code(role: PeerRole) -> u8 {
    match role {
        PeerRole::Bootstrapper => 0,
        PeerRole::Client => 1,
        PeerRole::Node => 2,
        PeerRole::Server => 3,
    }
}

fn role_from(code: u8) -> Result<PeerRole, CodecError> {
    match code {
        0 => Ok(PeerRole::Bootstrapper),
        1 => Ok(PeerRole::Client),
        2 => Ok(PeerRole::Node),
        3 => Ok(PeerRole::Server),
        other => Err(CodecError::BadRole(other)),
    }
}

fn kind_code(kind: MediaKind) -> u8 {
    match kind {
        MediaKind::Video => 0,
        MediaKind::Audio => 1,
        MediaKind::VideoControl => 2,
        MediaKind::AudioControl => 3,
    }
}

fn kind_from(code: u8) -> Result<MediaKind, CodecError> {
    match code {
        0 => Ok(MediaKind::Video),
        1 => Ok(MediaKind::Audio),
        2 => Ok(MediaKind::VideoControl),
        3 => Ok(MediaKind::AudioControl),
        other => Err(CodecError::BadKind(other)),
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    if s.len() > u16::MAX as usize {
        return Err(CodecError::Oversize);
    }
    buf.put_u16_le(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let len = get_u16(buf)? as usize;
    if buf.len() < len {
        return Err(CodecError::Truncated);
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::BadUtf8)
}

fn put_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.put_u16_le(addr.port());
}

fn get_addr(buf: &mut Bytes) -> Result<SocketAddr, CodecError> {
    let ip = match get_u8(buf)? {
        4 => {
            if buf.len() < 4 {
                return Err(CodecError::Truncated);
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            if buf.len() < 16 {
                return Err(CodecError::Truncated);
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(CodecError::BadAddrFamily(other)),
    };
    Ok(SocketAddr::new(ip, get_u16(buf)?))
}

fn put_addr_list(buf: &mut BytesMut, addrs: &[SocketAddr]) -> Result<(), CodecError> {
    if addrs.len() > u16::MAX as usize {
        return Err(CodecError::Oversize);
    }
    buf.put_u16_le(addrs.len() as u16);
    for addr in addrs {
        put_addr(buf, addr);
    }
    Ok(())
}

fn get_addr_list(buf: &mut Bytes) -> Result<Vec<SocketAddr>, CodecError> {
    let count = get_u16(buf)? as usize;
    let mut addrs = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        addrs.push(get_addr(buf)?);
    }
    Ok(addrs)
}

fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u32_le())
}
