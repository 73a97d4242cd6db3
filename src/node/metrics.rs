//! Link quality measurement
//!
//! Quality of a link is sampled actively: a burst of pings over UDP, each
//! awaited for at most the inter-ping interval. An unanswered burst pins the
//! latency at a one-hour sentinel so unreachable peers always compare worse
//! than any live one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::Result;
use crate::packet::{self, Packet};

/// Pings sent per measurement round
const PINGS_PER_ROUND: u32 = 10;
/// Gap between pings; doubles as the per-ping answer deadline
const PING_INTERVAL: Duration = Duration::from_millis(200);
/// Latency assigned when no ping came back
pub const UNREACHABLE_LATENCY: Duration = Duration::from_secs(3600);

/// Measured quality of one link
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkMetrics {
    /// Mean round-trip time of the answered pings
    pub latency: Duration,
    /// Fraction of pings lost, 0.0 to 1.0
    pub loss: f64,
}

impl LinkMetrics {
    /// Quality of two links traversed back to back
    pub fn compose(&self, other: &LinkMetrics) -> LinkMetrics {
        LinkMetrics {
            latency: self.latency + other.latency,
            loss: 1.0 - (1.0 - self.loss) * (1.0 - other.loss),
        }
    }

    /// Single figure of merit; loss weighs in at 5 seconds per 100%
    fn score(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0 + self.loss * 5000.0
    }

    pub fn better_than(&self, other: &LinkMetrics) -> bool {
        self.score() < other.score()
    }
}

/// Run one measurement round against `addr`.
///
/// Uses its own throwaway socket so echoed pings never enter the signal bus.
pub async fn measure_link(addr: SocketAddr, pings: u32, interval: Duration) -> Result<LinkMetrics> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    let mut buf = [0u8; 1500];
    let mut answered = 0u32;
    let mut total_rtt = Duration::ZERO;

    for _ in 0..pings {
        let id: u32 = rand::random();
        let frame = packet::encode(&Packet::Ping { id })?;
        socket.send_to(&frame, addr).await?;

        let sent = Instant::now();
        let deadline = sent + interval;
        loop {
            let now = Instant::now();
            let Some(left) = deadline.checked_duration_since(now) else {
                break;
            };
            match tokio::time::timeout(left, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok((n, _))) => {
                    let mut frame = BytesMut::from(&buf[..n]);
                    match packet::decode_frame(&mut frame) {
                        Ok(Some(Packet::Ping { id: echoed })) if echoed == id => {
                            total_rtt += sent.elapsed();
                            answered += 1;
                            break;
                        }
                        // Stray or stale datagram; keep waiting for our echo
                        _ => continue,
                    }
                }
            }
        }
    }

    let latency = if answered == 0 {
        UNREACHABLE_LATENCY
    } else {
        total_rtt / answered
    };
    Ok(LinkMetrics {
        latency,
        loss: f64::from(pings - answered) / f64::from(pings),
    })
}

/// Periodically re-measures a fixed set of links in the background
pub struct MetricsMonitor {
    metrics: Arc<Mutex<HashMap<SocketAddr, LinkMetrics>>>,
    task: JoinHandle<()>,
}

impl MetricsMonitor {
    pub fn start(targets: Vec<SocketAddr>, period: Duration) -> Self {
        let metrics = Arc::new(Mutex::new(HashMap::new()));
        let table = Arc::clone(&metrics);

        let task = tokio::spawn(async move {
            loop {
                for &addr in &targets {
                    match measure_link(addr, PINGS_PER_ROUND, PING_INTERVAL).await {
                        Ok(measured) => {
                            tracing::debug!(
                                addr = %addr,
                                latency_ms = measured.latency.as_millis() as u64,
                                loss = measured.loss,
                                "link measured"
                            );
                            table.lock().expect("metrics table poisoned").insert(addr, measured);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, addr = %addr, "link measurement failed");
                        }
                    }
                }
                tokio::time::sleep(period).await;
            }
        });

        Self { metrics, task }
    }

    /// Last measurement for `addr`, if any round has completed
    pub fn get(&self, addr: SocketAddr) -> Option<LinkMetrics> {
        self.metrics
            .lock()
            .expect("metrics table poisoned")
            .get(&addr)
            .copied()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MetricsMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echo every datagram back to its sender
    async fn spawn_echo() -> SocketAddr {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_measure_responsive_link() {
        let echo = spawn_echo().await;
        let measured = measure_link(echo, 3, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(measured.loss, 0.0);
        assert!(measured.latency < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_silent_link_hits_sentinel() {
        // Bound but never read, so pings simply vanish
        let silent = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = silent.local_addr().unwrap();

        let measured = measure_link(addr, 2, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(measured.loss, 1.0);
        assert_eq!(measured.latency, UNREACHABLE_LATENCY);
    }

    #[test]
    fn test_compose_and_compare() {
        let a = LinkMetrics {
            latency: Duration::from_millis(20),
            loss: 0.1,
        };
        let b = LinkMetrics {
            latency: Duration::from_millis(30),
            loss: 0.0,
        };
        let chained = a.compose(&b);
        assert_eq!(chained.latency, Duration::from_millis(50));
        assert!((chained.loss - 0.1).abs() < 1e-9);

        assert!(b.better_than(&a));
        assert!(!a.better_than(&a));
    }

    #[tokio::test]
    async fn test_monitor_populates_table() {
        let echo = spawn_echo().await;
        let monitor = MetricsMonitor::start(vec![echo], Duration::from_secs(60));

        let mut measured = None;
        for _ in 0..100 {
            if let Some(m) = monitor.get(echo) {
                measured = Some(m);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let measured = measured.expect("monitor never sampled the link");
        assert_eq!(measured.loss, 0.0);
        monitor.stop();
    }
}
