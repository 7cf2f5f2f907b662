//! Node lifecycle
//!
//! The node owns the tables and every spawned unit, and walks through
//!
//! ```text
//! Unconfigured -> TablesLoaded -> InterfacesReady -> SessionsEstablishing
//!              -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! `Running` is reached once the listener is bound and every peer task is
//! spawned, even while peers are still retrying their handshake.

use crate::config::{Config, ConfigError, InterfaceConfig};
use crate::connection::{ConnectionManager, PeerExit, RetryPolicy};
use crate::device::{TunnelDevice, TunnelDriver};
use crate::inbound::InboundServer;
use crate::reader::{InterfaceReader, ReaderStats};
use crate::shutdown::Shutdown;
use crate::tables::Tables;
use crate::transport::{self, Transport, TransportError};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unconfigured,
    TablesLoaded,
    InterfacesReady,
    SessionsEstablishing,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: TransportError,
    },

    #[error("listener failed: {0}")]
    ListenerFailed(#[source] TransportError),

    #[error("failed to spawn reader for {name}: {source}")]
    SpawnReader {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("operation not allowed in state {0:?}")]
    InvalidState(NodeState),
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// Why `run_until` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The external signal resolved.
    Signal,
    /// Someone triggered the node's `Shutdown`.
    Cancelled,
}

pub struct Node {
    config: Config,
    driver: Arc<dyn TunnelDriver>,
    transport: Arc<dyn Transport>,
    tables: Arc<Tables>,
    shutdown: Shutdown,
    state: NodeState,
    devices: Vec<Arc<dyn TunnelDevice>>,
    readers: Vec<std::thread::JoinHandle<ReaderStats>>,
    peers: JoinSet<(Ipv4Addr, PeerExit)>,
    inbound: Option<JoinHandle<transport::Result<()>>>,
}

impl Node {
    pub fn new(config: Config, driver: Arc<dyn TunnelDriver>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            driver,
            transport,
            tables: Arc::new(Tables::new()),
            shutdown: Shutdown::new(),
            state: NodeState::Unconfigured,
            devices: Vec::new(),
            readers: Vec::new(),
            peers: JoinSet::new(),
            inbound: None,
        }
    }

    /// Run every startup step up to `Running`.
    ///
    /// On a fatal error everything started so far is torn down again.
    pub async fn start(
        config: Config,
        driver: Arc<dyn TunnelDriver>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let mut node = Self::new(config, driver, transport);
        node.load_tables()?;
        node.setup_interfaces()?;
        if let Err(e) = node.start_sessions().await {
            node.shutdown().await;
            return Err(e);
        }
        Ok(node)
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn tables(&self) -> &Arc<Tables> {
        &self.tables
    }

    /// Handle for cancelling the node from elsewhere.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    fn expect_state(&self, expected: NodeState) -> Result<()> {
        if self.state != expected {
            return Err(NodeError::InvalidState(self.state));
        }
        Ok(())
    }

    /// Populate the address table from the configuration.
    pub fn load_tables(&mut self) -> Result<()> {
        self.expect_state(NodeState::Unconfigured)?;
        self.config.validate()?;

        for (vaddr, raddr) in &self.config.peers {
            self.tables.addresses.add(*vaddr, *raddr);
        }
        info!(peers = self.tables.addresses.len(), "Address table loaded");

        self.state = NodeState::TablesLoaded;
        Ok(())
    }

    /// Create, configure and register every local interface.
    ///
    /// A failing interface is logged and skipped. Returns how many
    /// interfaces are ready.
    pub fn setup_interfaces(&mut self) -> Result<usize> {
        self.expect_state(NodeState::TablesLoaded)?;

        for iface in self.config.interfaces.clone() {
            match self.setup_interface(&iface) {
                Ok(device) => {
                    self.tables.endpoints.add(iface.address, device.clone());
                    self.devices.push(device);
                }
                Err(e) => {
                    error!(name = %iface.name, address = %iface.address, error = %e, "Interface setup failed");
                }
            }
        }

        info!(
            ready = self.devices.len(),
            configured = self.config.interfaces.len(),
            "Interfaces ready"
        );
        self.state = NodeState::InterfacesReady;
        Ok(self.devices.len())
    }

    fn setup_interface(&self, iface: &InterfaceConfig) -> io::Result<Arc<dyn TunnelDevice>> {
        let device = self.driver.create(&iface.name)?;
        if let Err(e) = self
            .driver
            .configure(device.as_ref(), iface.address, iface.netmask)
        {
            if let Err(e) = self.driver.teardown(device.as_ref()) {
                debug!(name = %iface.name, error = %e, "Teardown after failed configure");
            }
            return Err(e);
        }
        Ok(device)
    }

    /// Bind the listener, then start peer tasks and interface readers.
    pub async fn start_sessions(&mut self) -> Result<()> {
        self.expect_state(NodeState::InterfacesReady)?;
        self.state = NodeState::SessionsEstablishing;

        let addr = self.config.listen;
        let acceptor = self
            .transport
            .listen(addr)
            .await
            .map_err(|source| NodeError::Listen { addr, source })?;
        self.inbound = Some(tokio::spawn(
            InboundServer::new(acceptor, self.tables.clone(), self.shutdown.listener()).run(),
        ));

        let manager = ConnectionManager::new(
            self.transport.clone(),
            self.tables.clone(),
            RetryPolicy {
                interval: self.config.retry_interval,
            },
            self.config.channel_capacity,
            self.shutdown.listener(),
        );
        self.peers = manager.start();

        for device in &self.devices {
            let reader = InterfaceReader::new(
                device.clone(),
                self.tables.clone(),
                self.shutdown.listener(),
                self.config.buffer_size,
            );
            let handle = reader.spawn().map_err(|source| NodeError::SpawnReader {
                name: device.name().to_string(),
                source,
            })?;
            self.readers.push(handle);
        }

        info!(
            %addr,
            peers = self.tables.addresses.len(),
            interfaces = self.devices.len(),
            "Node running"
        );
        self.state = NodeState::Running;
        Ok(())
    }

    /// Run until `signal` resolves, the node is cancelled, or the listener
    /// fails. Shuts the node down before returning in every case.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<StopReason>
    where
        F: Future<Output = ()>,
    {
        self.expect_state(NodeState::Running)?;
        tokio::pin!(signal);
        let mut cancelled = self.shutdown.listener();
        let mut inbound = self.inbound.take();

        let outcome = loop {
            tokio::select! {
                _ = &mut signal => break Ok(StopReason::Signal),
                _ = cancelled.triggered() => break Ok(StopReason::Cancelled),
                res = join_inbound(&mut inbound), if inbound.is_some() => {
                    inbound = None;
                    break match res {
                        Ok(Ok(())) => Ok(StopReason::Cancelled),
                        Ok(Err(e)) => Err(NodeError::ListenerFailed(e)),
                        Err(e) => Err(NodeError::ListenerFailed(TransportError::Closed(e.to_string()))),
                    };
                }
                Some(res) = self.peers.join_next(), if !self.peers.is_empty() => {
                    match res {
                        Ok((vaddr, PeerExit::Abandoned(e))) => {
                            warn!(%vaddr, error = %e, "Peer abandoned, its traffic is dropped");
                        }
                        Ok((vaddr, PeerExit::Shutdown)) => debug!(%vaddr, "Peer task stopped"),
                        Err(e) => error!(error = %e, "Peer task panicked"),
                    }
                }
            }
        };

        self.inbound = inbound;
        if let Err(e) = &outcome {
            error!(error = %e, "Shutting down after failure");
        }
        self.shutdown().await;
        outcome
    }

    /// Stop every unit, join it, and tear down the interfaces. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.state == NodeState::Stopped {
            return;
        }
        self.state = NodeState::ShuttingDown;
        info!("Shutting down");

        self.shutdown.trigger();
        // Closing the devices unblocks readers waiting for a frame
        for device in &self.devices {
            device.close();
        }

        if let Some(inbound) = self.inbound.take() {
            match inbound.await {
                Ok(Err(e)) => debug!(error = %e, "Listener ended with error"),
                Err(e) => error!(error = %e, "Inbound task panicked"),
                Ok(Ok(())) => {}
            }
        }
        while let Some(res) = self.peers.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "Peer task panicked");
            }
        }

        let readers = std::mem::take(&mut self.readers);
        let joined = tokio::task::spawn_blocking(move || {
            readers
                .into_iter()
                .map(|handle| handle.join().ok())
                .collect::<Vec<_>>()
        })
        .await;
        if let Ok(stats) = joined {
            for stats in stats.into_iter().flatten() {
                debug!(?stats, "Reader joined");
            }
        }

        for device in self.devices.drain(..) {
            if let Err(e) = self.driver.teardown(device.as_ref()) {
                warn!(name = %device.name(), error = %e, "Interface teardown failed");
            }
        }
        self.tables.endpoints.drain();
        self.tables.routes.drain();

        self.state = NodeState::Stopped;
        info!("Stopped");
    }
}

async fn join_inbound(
    inbound: &mut Option<JoinHandle<transport::Result<()>>>,
) -> std::result::Result<transport::Result<()>, tokio::task::JoinError> {
    match inbound {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
