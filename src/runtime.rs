//! Per-process runtime: sockets + bus, wired together
//!
//! Every peer process builds exactly one `Runtime`, registers its role
//! handlers, and calls [`Runtime::run`]. There is no ambient global state;
//! two runtimes in one process (as the tests do) stay fully independent.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::signal::{Handler, HandlerId, Signal, SignalBus};
use crate::transport::{TcpTransport, UdpTransport};

/// Listener configuration for one process
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Control-plane listener port; 0 picks an ephemeral port
    pub tcp_port: u16,
    /// Media/ping datagram port; 0 picks an ephemeral port
    pub udp_port: u16,
    /// How long shutdown waits for in-flight signal dispatches
    pub shutdown_grace: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tcp_port: 0,
            udp_port: 0,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    pub fn udp_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// One process's bus and transports
pub struct Runtime {
    bus: Arc<SignalBus>,
    tcp: Arc<TcpTransport>,
    udp: Arc<UdpTransport>,
}

impl Runtime {
    /// Bind the listeners. A port that cannot be bound is a fatal startup
    /// error and surfaces here.
    pub async fn bind(config: RuntimeConfig) -> Result<Self> {
        let bus = SignalBus::with_shutdown_grace(config.shutdown_grace);
        let tcp = TcpTransport::bind(config.tcp_port, bus.sender()).await?;
        let udp = Arc::new(UdpTransport::bind(config.udp_port, bus.sender()).await?);
        Ok(Self { bus, tcp, udp })
    }

    pub fn bus(&self) -> Arc<SignalBus> {
        Arc::clone(&self.bus)
    }

    pub fn tcp(&self) -> Arc<TcpTransport> {
        Arc::clone(&self.tcp)
    }

    pub fn udp(&self) -> Arc<UdpTransport> {
        Arc::clone(&self.udp)
    }

    pub fn add_handler(&self, handler: Arc<dyn Handler>) -> HandlerId {
        self.bus.add_handler(handler)
    }

    /// Publish `Init` and drive dispatch until [`Runtime::shutdown`].
    /// Transports are torn down after the bus drains.
    pub async fn run(&self) -> Result<()> {
        self.bus.publish(Signal::Init);
        let result = Arc::clone(&self.bus).run().await;
        self.tcp.close_all();
        self.udp.close();
        result
    }

    /// Begin shutdown; `run` delivers `Closing` and returns
    pub fn shutdown(&self) {
        self.bus.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct Lifecycle {
        log: Arc<StdMutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Handler for Lifecycle {
        async fn handle(&self, signal: Signal) -> bool {
            match signal {
                Signal::Init => {
                    self.log.lock().unwrap().push("init");
                    true
                }
                Signal::Closing => {
                    self.log.lock().unwrap().push("closing");
                    true
                }
                _ => false,
            }
        }
    }

    #[tokio::test]
    async fn test_init_then_closing() {
        let runtime = Runtime::bind(RuntimeConfig::new()).await.unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        runtime.add_handler(Arc::new(Lifecycle {
            log: Arc::clone(&log),
        }));

        let runtime = Arc::new(runtime);
        let driver = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.run().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        runtime.shutdown();
        driver.await.unwrap().unwrap();

        assert_eq!(log.lock().unwrap().as_slice(), ["init", "closing"]);
    }
}
