//! The signal bus: ordered intake, LIFO handler stack, concurrent dispatch
//!
//! All inbound transport events funnel through one queue. Each signal is
//! dispatched on its own task so a handler that blocks awaiting a correlated
//! future signal cannot stall unrelated traffic; signals from the same TCP
//! connection are serialized through a per-peer worker to preserve their
//! arrival order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinSet;

use super::{Handler, Signal};
use crate::error::{Error, Result};

/// Identifies a registered handler for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

struct HandlerEntry {
    id: HandlerId,
    handler: Arc<dyn Handler>,
}

/// Scoped "pause dispatch" guard.
///
/// While this guard is alive no new signal starts its handler chain;
/// already-dispatching signals may finish. Used to make "send request, then
/// register interceptor" atomic relative to the dispatch loop.
pub struct PauseGuard {
    _guard: OwnedRwLockWriteGuard<()>,
}

/// Cloneable producer half handed to transport adapters
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<Signal>,
    closed: watch::Sender<bool>,
}

impl SignalSender {
    /// Enqueue a signal. Silently dropped once the bus is closing.
    pub fn publish(&self, signal: Signal) {
        if *self.closed.borrow() {
            tracing::debug!(signal = signal.name(), "bus closing, signal dropped");
            return;
        }
        let _ = self.tx.send(signal);
    }
}

/// The per-process signal bus
pub struct SignalBus {
    tx: mpsc::UnboundedSender<Signal>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    handlers: Mutex<Vec<HandlerEntry>>,
    next_id: AtomicU64,
    gate: Arc<RwLock<()>>,
    closed: watch::Sender<bool>,
    shutdown_grace: Duration,
}

impl SignalBus {
    pub fn new() -> Arc<Self> {
        Self::with_shutdown_grace(Duration::from_secs(2))
    }

    /// `shutdown_grace` bounds how long `run` waits for in-flight dispatches
    /// after delivering `Closing`; stragglers (typically interceptor waits
    /// that will never match) are aborted.
    pub fn with_shutdown_grace(shutdown_grace: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            gate: Arc::new(RwLock::new(())),
            closed,
            shutdown_grace,
        })
    }

    /// Producer handle for transport adapters
    pub fn sender(&self) -> SignalSender {
        SignalSender {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Enqueue a signal onto the bus
    pub fn publish(&self, signal: Signal) {
        self.sender().publish(signal);
    }

    /// Register a handler on top of the stack (consulted first)
    pub fn add_handler(&self, handler: Arc<dyn Handler>) -> HandlerId {
        let id = self.allocate_handler_id();
        self.add_handler_with_id(id, handler);
        id
    }

    pub(crate) fn allocate_handler_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn add_handler_with_id(&self, id: HandlerId, handler: Arc<dyn Handler>) {
        self.handlers
            .lock()
            .expect("handler stack poisoned")
            .push(HandlerEntry { id, handler });
    }

    /// Remove a handler; no-op if already gone
    pub fn remove_handler(&self, id: HandlerId) {
        self.handlers
            .lock()
            .expect("handler stack poisoned")
            .retain(|entry| entry.id != id);
    }

    /// Hold delivery of new signals until the returned guard is dropped
    pub async fn pause(&self) -> PauseGuard {
        PauseGuard {
            _guard: Arc::clone(&self.gate).write_owned().await,
        }
    }

    /// Begin shutdown: stop intake and wake the dispatch loop
    pub fn close(&self) {
        let _ = self.closed.send(true);
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Drive the dispatch loop until shutdown.
    ///
    /// On `close` the loop stops accepting input, delivers [`Signal::Closing`]
    /// to every handler, waits up to the shutdown grace period for in-flight
    /// dispatches, then aborts the rest.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .expect("bus receiver poisoned")
            .take()
            .ok_or(Error::BusClosed)?;

        let mut closed = self.closed.subscribe();
        let mut workers: HashMap<SocketAddr, mpsc::UnboundedSender<Signal>> = HashMap::new();
        let mut tasks = JoinSet::new();

        while !*closed.borrow() {
            tokio::select! {
                _ = closed.changed() => break,
                signal = rx.recv() => {
                    let Some(signal) = signal else { break };
                    match signal.ordering_key() {
                        Some(peer) => {
                            let disconnect = matches!(signal, Signal::TcpDisconnected { .. });
                            let worker = workers.entry(peer).or_insert_with(|| {
                                let (tx, mut worker_rx) = mpsc::unbounded_channel();
                                let bus = Arc::clone(&self);
                                tasks.spawn(async move {
                                    while let Some(signal) = worker_rx.recv().await {
                                        Arc::clone(&bus).dispatch(signal).await;
                                    }
                                });
                                tx
                            });
                            let _ = worker.send(signal);
                            if disconnect {
                                // The connection is gone; drop the sender so
                                // the worker drains its queue and exits. A
                                // reconnect gets a fresh worker.
                                workers.remove(&peer);
                            }
                        }
                        None => {
                            tasks.spawn(Arc::clone(&self).dispatch(signal));
                        }
                    }
                }
            }
        }

        let _ = self.closed.send(true);
        tracing::info!("signal bus closing");

        Arc::clone(&self).dispatch(Signal::Closing).await;

        // Dropping the worker senders lets idle workers exit; blocked
        // dispatches get the grace period, then are cut loose.
        drop(workers);
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    let left = tasks.len();
                    if left > 0 {
                        tracing::debug!(tasks = left, "aborting dispatches still in flight");
                    }
                    tasks.abort_all();
                    break;
                }
            }
        }

        self.handlers.lock().expect("handler stack poisoned").clear();
        Ok(())
    }

    /// Run one signal through the handler stack, top-down.
    ///
    /// `Closing` is delivered to every handler regardless of consumption.
    async fn dispatch(self: Arc<Self>, signal: Signal) {
        // Turnstile: a held pause blocks new chains from starting.
        {
            let _turnstile = self.gate.read().await;
        }

        let snapshot: Vec<Arc<dyn Handler>> = {
            let handlers = self.handlers.lock().expect("handler stack poisoned");
            handlers.iter().rev().map(|e| Arc::clone(&e.handler)).collect()
        };

        let terminal = matches!(signal, Signal::Closing);
        let mut consumed = false;
        for handler in snapshot {
            if handler.handle(signal.clone()).await {
                consumed = true;
                if !terminal {
                    return;
                }
            }
        }

        if !consumed {
            tracing::debug!(signal = signal.name(), "signal not consumed by any handler");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        tag: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
        consume: bool,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, signal: Signal) -> bool {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.tag, signal.name()));
            self.consume
        }
    }

    fn peer(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn tcp_ping(port: u16, id: u32) -> Signal {
        Signal::TcpMessage {
            packet: crate::packet::Packet::Ping { id },
            peer: peer(port),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_topmost_handler_wins() {
        let bus = SignalBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.add_handler(Arc::new(Recorder {
            tag: "bottom",
            log: Arc::clone(&log),
            consume: true,
        }));
        bus.add_handler(Arc::new(Recorder {
            tag: "top",
            log: Arc::clone(&log),
            consume: true,
        }));

        let run = tokio::spawn(Arc::clone(&bus).run());
        bus.publish(Signal::Init);
        settle().await;

        assert_eq!(log.lock().unwrap().as_slice(), ["top:Init"]);
        bus.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unconsumed_falls_through_stack() {
        let bus = SignalBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.add_handler(Arc::new(Recorder {
            tag: "bottom",
            log: Arc::clone(&log),
            consume: false,
        }));
        bus.add_handler(Arc::new(Recorder {
            tag: "top",
            log: Arc::clone(&log),
            consume: false,
        }));

        let run = tokio::spawn(Arc::clone(&bus).run());
        bus.publish(Signal::Init);
        settle().await;

        // Both consulted, top first; nobody consumed and nothing crashed.
        assert_eq!(log.lock().unwrap().as_slice(), ["top:Init", "bottom:Init"]);
        bus.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_removed_handler_not_consulted() {
        let bus = SignalBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let id = bus.add_handler(Arc::new(Recorder {
            tag: "gone",
            log: Arc::clone(&log),
            consume: true,
        }));
        bus.remove_handler(id);

        let run = tokio::spawn(Arc::clone(&bus).run());
        bus.publish(Signal::Init);
        settle().await;

        assert!(log.lock().unwrap().is_empty());
        bus.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_same_connection_order_preserved() {
        struct Jittery {
            log: Arc<StdMutex<Vec<u32>>>,
        }

        #[async_trait]
        impl Handler for Jittery {
            async fn handle(&self, signal: Signal) -> bool {
                if let Signal::TcpMessage {
                    packet: crate::packet::Packet::Ping { id },
                    ..
                } = signal
                {
                    // Uneven processing time must not reorder one peer's signals
                    tokio::time::sleep(Duration::from_millis((id % 3) as u64 * 10)).await;
                    self.log.lock().unwrap().push(id);
                    return true;
                }
                false
            }
        }

        let bus = SignalBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.add_handler(Arc::new(Jittery {
            log: Arc::clone(&log),
        }));

        let run = tokio::spawn(Arc::clone(&bus).run());
        for id in 0..10 {
            bus.publish(tcp_ping(9000, id));
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(log.lock().unwrap().as_slice(), (0..10).collect::<Vec<_>>());
        bus.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_peer_worker_retired_on_disconnect() {
        let bus = SignalBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.add_handler(Arc::new(Recorder {
            tag: "h",
            log: Arc::clone(&log),
            consume: true,
        }));

        let run = tokio::spawn(Arc::clone(&bus).run());
        bus.publish(tcp_ping(9000, 1));
        bus.publish(Signal::TcpDisconnected { peer: peer(9000) });
        settle().await;

        // Traffic from the same address after a reconnect still arrives, in
        // order, through a fresh worker
        bus.publish(tcp_ping(9000, 2));
        bus.publish(tcp_ping(9000, 3));
        settle().await;

        assert_eq!(
            log.lock().unwrap().as_slice(),
            [
                "h:TcpMessage",
                "h:TcpDisconnected",
                "h:TcpMessage",
                "h:TcpMessage"
            ]
        );
        bus.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_blocked_handler_does_not_stall_other_connections() {
        struct Blocker {
            release: Arc<tokio::sync::Notify>,
            log: Arc<StdMutex<Vec<u16>>>,
        }

        #[async_trait]
        impl Handler for Blocker {
            async fn handle(&self, signal: Signal) -> bool {
                if let Signal::TcpMessage { peer, .. } = signal {
                    if peer.port() == 1 {
                        // Simulates awaiting a correlated response
                        self.release.notified().await;
                    }
                    self.log.lock().unwrap().push(peer.port());
                    return true;
                }
                false
            }
        }

        let bus = SignalBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let release = Arc::new(tokio::sync::Notify::new());
        bus.add_handler(Arc::new(Blocker {
            release: Arc::clone(&release),
            log: Arc::clone(&log),
        }));

        let run = tokio::spawn(Arc::clone(&bus).run());
        bus.publish(tcp_ping(1, 0));
        bus.publish(tcp_ping(2, 0));
        settle().await;

        // Peer 2 got through while peer 1 is still blocked
        assert_eq!(log.lock().unwrap().as_slice(), [2]);

        release.notify_one();
        settle().await;
        assert_eq!(log.lock().unwrap().as_slice(), [2, 1]);

        bus.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pause_holds_delivery() {
        let bus = SignalBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.add_handler(Arc::new(Recorder {
            tag: "h",
            log: Arc::clone(&log),
            consume: true,
        }));

        let run = tokio::spawn(Arc::clone(&bus).run());
        let guard = bus.pause().await;
        bus.publish(Signal::Init);
        settle().await;
        assert!(log.lock().unwrap().is_empty());

        drop(guard);
        settle().await;
        assert_eq!(log.lock().unwrap().as_slice(), ["h:Init"]);

        bus.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closing_reaches_every_handler() {
        let bus = SignalBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        bus.add_handler(Arc::new(Recorder {
            tag: "a",
            log: Arc::clone(&log),
            consume: true,
        }));
        bus.add_handler(Arc::new(Recorder {
            tag: "b",
            log: Arc::clone(&log),
            consume: true,
        }));

        let run = tokio::spawn(Arc::clone(&bus).run());
        settle().await;
        bus.close();
        run.await.unwrap().unwrap();

        let log = log.lock().unwrap();
        assert!(log.contains(&"a:Closing".to_string()));
        assert!(log.contains(&"b:Closing".to_string()));
    }

    #[tokio::test]
    async fn test_handler_can_register_handler_mid_dispatch() {
        struct SelfExtending {
            bus: Arc<SignalBus>,
            log: Arc<StdMutex<Vec<String>>>,
        }

        #[async_trait]
        impl Handler for SelfExtending {
            async fn handle(&self, signal: Signal) -> bool {
                if matches!(signal, Signal::Init) {
                    self.bus.add_handler(Arc::new(Recorder {
                        tag: "late",
                        log: Arc::clone(&self.log),
                        consume: true,
                    }));
                    return true;
                }
                false
            }
        }

        let bus = SignalBus::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        bus.add_handler(Arc::new(SelfExtending {
            bus: Arc::clone(&bus),
            log: Arc::clone(&log),
        }));

        let run = tokio::spawn(Arc::clone(&bus).run());
        bus.publish(Signal::Init);
        settle().await;
        bus.publish(tcp_ping(5, 1));
        settle().await;

        assert_eq!(log.lock().unwrap().as_slice(), ["late:TcpMessage"]);
        bus.close();
        run.await.unwrap().unwrap();
    }
}
