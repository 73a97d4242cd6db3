//! Transport adapters
//!
//! Adapters own the sockets and connection tables; everything above them sees
//! only decoded [`Packet`](crate::packet::Packet)s wrapped as
//! [`Signal`](crate::signal::Signal)s. Adapters never touch routing state;
//! they enqueue signals and nothing else.

pub mod tcp;
pub mod udp;

pub use tcp::TcpTransport;
pub use udp::UdpTransport;
