//! # meshcast
//!
//! An overlay mesh for distributing live video streams.
//!
//! Relay nodes form a static mesh. A stream is located by flooding a probe
//! through the mesh (loop-suppressed by random request ids) down to the media
//! servers that carry it; subscriptions then build a per-stream distribution
//! tree along the probe's reverse path, with payload fanned out over UDP at
//! each hop. Every peer process (node, media server, client) is a set of
//! handlers on the same signal-dispatch runtime.
//!
//! ```text
//!   server ──▶ node ──▶ node ──▶ client
//!                └────▶ node ──▶ client
//! ```
//!
//! Entry points:
//! - [`runtime::Runtime`] binds the sockets and drives dispatch
//! - [`node::Node`] is the relay role
//! - [`server::MediaServer`] serves a catalog of streams
//! - [`client::StreamClient`] consumes one stream into a [`client::MediaSink`]

pub mod client;
pub mod error;
pub mod node;
pub mod packet;
pub mod runtime;
pub mod server;
pub mod signal;
pub mod transport;

pub use client::{MediaSink, StreamClient};
pub use error::{Error, Result};
pub use node::{Node, NodeConfig, NodeIo, RuntimeIo};
pub use packet::{MediaKind, Packet, StreamMetadata};
pub use runtime::{Runtime, RuntimeConfig};
pub use server::{MediaServer, MediaSource, ServerCatalog};
pub use signal::{Handler, Signal, SignalBus};
pub use transport::{TcpTransport, UdpTransport};
