//! Per-stream routing state
//!
//! A stream id is, at any instant, in exactly one of three phases on a node:
//! absent, waiting (upstream asked, not yet confirmed) or running (actively
//! relaying). The tables here are owned by the routing engine and only ever
//! touched from signal-handling tasks.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::packet::StreamMetadata;

/// One direct child in the distribution tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Downstream {
    /// The subscriber's control (TCP) address, used for responses,
    /// cancellations and end-of-stream notices
    pub control: SocketAddr,
    /// UDP port on the subscriber's host where payload is delivered
    pub media_port: u16,
}

impl Downstream {
    pub fn new(control: SocketAddr, media_port: u16) -> Self {
        Self {
            control,
            media_port,
        }
    }

    /// Where this subscriber wants payload datagrams
    pub fn media_addr(&self) -> SocketAddr {
        SocketAddr::new(self.control.ip(), self.media_port)
    }
}

/// Cached result of a resolved probe, keyed by RequestID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The stream exists and `source` is the next hop toward it
    Found {
        source: SocketAddr,
        metadata: StreamMetadata,
    },
    /// The stream could not be located anywhere
    Missing,
}

/// Subscription interest waiting on an upstream confirmation
#[derive(Debug, Default)]
pub struct WaitingStream {
    /// Subscribers to notify once the stream resolves; never empty while the
    /// record exists
    pub pending: HashSet<Downstream>,
    /// Relay port allocated when the upstream subscription was sent
    pub relay_port: Option<u16>,
    /// Where the subscription was sent, once it was
    pub upstream: Option<SocketAddr>,
    pub metadata: Option<StreamMetadata>,
}

/// A stream this node is actively relaying
#[derive(Debug)]
pub struct RunningStream {
    /// Unique parent in the distribution tree
    pub upstream: SocketAddr,
    /// Local UDP port upstream delivers payload to
    pub relay_port: u16,
    /// Direct children; never empty while the record exists
    pub downstreams: HashSet<Downstream>,
    /// Session description handed to joining subscribers
    pub description: String,
    pub metadata: StreamMetadata,
}

/// Phase of a stream id on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Absent,
    Waiting,
    Running,
}

/// Read-only view of one stream's state, for tests and operators
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub phase: StreamPhase,
    pub upstream: Option<SocketAddr>,
    pub downstreams: Vec<Downstream>,
    pub relay_port: Option<u16>,
}

/// All mutable routing state of a node
#[derive(Debug, Default)]
pub struct NodeState {
    /// RequestIDs already processed (request or response). Append-only for
    /// the node's lifetime; unbounded growth is a known limitation.
    pub seen_requests: HashSet<u32>,
    /// Resolved probes, for answering StreamRequests without re-flooding.
    /// Also append-only.
    pub probe_outcomes: HashMap<u32, ProbeOutcome>,
    pub waiting: HashMap<String, WaitingStream>,
    pub running: HashMap<String, RunningStream>,
}

impl NodeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed bitrate on the link to `addr`, counting streams flowing in
    /// either direction over it
    pub fn link_usage(&self, addr: SocketAddr) -> u64 {
        let mut total = 0u64;
        for stream in self.running.values() {
            if stream.upstream == addr {
                total += stream.metadata.bitrate as u64;
            }
            for downstream in &stream.downstreams {
                if downstream.control == addr {
                    total += stream.metadata.bitrate as u64;
                }
            }
        }
        total
    }

    pub fn phase(&self, stream_id: &str) -> StreamPhase {
        if self.running.contains_key(stream_id) {
            StreamPhase::Running
        } else if self.waiting.contains_key(stream_id) {
            StreamPhase::Waiting
        } else {
            StreamPhase::Absent
        }
    }

    pub fn snapshot(&self, stream_id: &str) -> StreamSnapshot {
        if let Some(stream) = self.running.get(stream_id) {
            StreamSnapshot {
                phase: StreamPhase::Running,
                upstream: Some(stream.upstream),
                downstreams: stream.downstreams.iter().copied().collect(),
                relay_port: Some(stream.relay_port),
            }
        } else if let Some(stream) = self.waiting.get(stream_id) {
            StreamSnapshot {
                phase: StreamPhase::Waiting,
                upstream: stream.upstream,
                downstreams: stream.pending.iter().copied().collect(),
                relay_port: stream.relay_port,
            }
        } else {
            StreamSnapshot {
                phase: StreamPhase::Absent,
                upstream: None,
                downstreams: Vec::new(),
                relay_port: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_link_usage_counts_both_directions() {
        let mut state = NodeState::new();
        state.running.insert(
            "s1".into(),
            RunningStream {
                upstream: addr(1),
                relay_port: 5000,
                downstreams: [Downstream::new(addr(2), 6000)].into_iter().collect(),
                description: String::new(),
                metadata: StreamMetadata { bitrate: 300 },
            },
        );
        state.running.insert(
            "s2".into(),
            RunningStream {
                upstream: addr(2),
                relay_port: 5001,
                downstreams: [Downstream::new(addr(3), 6000)].into_iter().collect(),
                description: String::new(),
                metadata: StreamMetadata { bitrate: 200 },
            },
        );

        // addr(2) receives s1 (300) and sources s2 (200)
        assert_eq!(state.link_usage(addr(2)), 500);
        assert_eq!(state.link_usage(addr(1)), 300);
        assert_eq!(state.link_usage(addr(3)), 200);
        assert_eq!(state.link_usage(addr(9)), 0);
    }

    #[test]
    fn test_phase_reporting() {
        let mut state = NodeState::new();
        assert_eq!(state.phase("s1"), StreamPhase::Absent);

        state.waiting.insert("s1".into(), WaitingStream::default());
        assert_eq!(state.phase("s1"), StreamPhase::Waiting);

        state.waiting.remove("s1");
        state.running.insert(
            "s1".into(),
            RunningStream {
                upstream: addr(1),
                relay_port: 5000,
                downstreams: [Downstream::new(addr(2), 6000)].into_iter().collect(),
                description: String::new(),
                metadata: StreamMetadata::default(),
            },
        );
        assert_eq!(state.phase("s1"), StreamPhase::Running);
    }
}
