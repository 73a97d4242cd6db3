//! Interceptors: temporary, self-removing handlers for correlating requests
//! with future signals
//!
//! An interceptor sits at the top of the handler stack, so it always gets
//! first refusal on a signal. Matched signals are forwarded into a bounded
//! channel; once the configured number of matches is claimed the interceptor
//! unregisters itself. The output buffer never blocks the dispatch loop: on
//! overflow the interceptor logs, drops, and removes itself.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{Handler, HandlerId, Signal, SignalBus};
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::transport::TcpTransport;

/// Largest number of matched signals buffered before the consumer reads them
const MAX_BUFFER: usize = 20;

struct Interceptor {
    bus: Weak<SignalBus>,
    id: HandlerId,
    predicate: Box<dyn Fn(&Signal) -> bool + Send + Sync>,
    /// `None` means unbounded
    remaining: Mutex<Option<usize>>,
    tx: mpsc::Sender<Signal>,
}

impl Interceptor {
    fn unregister(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_handler(self.id);
        }
    }
}

#[async_trait]
impl Handler for Interceptor {
    async fn handle(&self, signal: Signal) -> bool {
        if !(self.predicate)(&signal) {
            return false;
        }

        let last = {
            let mut remaining = self.remaining.lock().expect("interceptor counter poisoned");
            match remaining.as_mut() {
                Some(n) => {
                    *n = n.saturating_sub(1);
                    *n == 0
                }
                None => false,
            }
        };

        match self.tx.try_send(signal) {
            Ok(()) => {
                if last {
                    self.unregister();
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!("interceptor buffer full, removing");
                self.unregister();
                false
            }
            Err(TrySendError::Closed(_)) => {
                // Consumer gave up (e.g. timed out); let the signal fall
                // through to the ordinary handlers.
                self.unregister();
                false
            }
        }
    }
}

impl SignalBus {
    /// Intercept the first `max_matches` signals satisfying `predicate`
    /// (0 = unbounded). The interceptor is registered on top of the stack and
    /// removes itself after the final match, or as soon as the returned
    /// receiver is dropped and another match arrives.
    pub fn intercept<F>(self: &Arc<Self>, predicate: F, max_matches: usize) -> mpsc::Receiver<Signal>
    where
        F: Fn(&Signal) -> bool + Send + Sync + 'static,
    {
        let capacity = match max_matches {
            0 => MAX_BUFFER,
            n => n.min(MAX_BUFFER),
        };
        let (tx, rx) = mpsc::channel(capacity);

        let id = self.allocate_handler_id();
        self.add_handler_with_id(
            id,
            Arc::new(Interceptor {
                bus: Arc::downgrade(self),
                id,
                predicate: Box::new(predicate),
                remaining: Mutex::new((max_matches > 0).then_some(max_matches)),
                tx,
            }),
        );
        rx
    }

    /// Intercept the first `max_matches` TCP packets from `peer` for which
    /// `matches` returns true
    pub fn intercept_tcp<F>(
        self: &Arc<Self>,
        peer: SocketAddr,
        matches: F,
        max_matches: usize,
    ) -> mpsc::Receiver<Signal>
    where
        F: Fn(&Packet) -> bool + Send + Sync + 'static,
    {
        self.intercept(
            move |signal| {
                matches!(signal, Signal::TcpMessage { peer: from, packet } if *from == peer && matches(packet))
            },
            max_matches,
        )
    }
}

/// Send `request` to `dest` over TCP and await the first response packet from
/// `dest` matching `matches`.
///
/// Registration of the interceptor and the send happen under a dispatch
/// pause, so a response racing back cannot slip past before the interceptor
/// is in place. If the send fails no interceptor is left behind; if the wait
/// times out the abandoned interceptor cleans itself up on its next match.
pub async fn request_tcp<F>(
    bus: &Arc<SignalBus>,
    tcp: &TcpTransport,
    request: Packet,
    dest: SocketAddr,
    matches: F,
    timeout: Duration,
) -> Result<Packet>
where
    F: Fn(&Packet) -> bool + Send + Sync + 'static,
{
    let mut rx = {
        let _pause = bus.pause().await;
        tcp.send(request, dest)?;
        bus.intercept_tcp(dest, matches, 1)
    };

    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(Signal::TcpMessage { packet, .. })) => Ok(packet),
        Ok(_) => Err(Error::BusClosed),
        Err(_) => Err(Error::ResponseTimeout(dest)),
    }
}
