//! In-process transport
//!
//! A `MemoryNetwork` connects any number of `MemoryTransport`s. Sessions
//! are pairs of queues of `tokio::io::duplex` pipes, so the same
//! length-prefixed framing as the QUIC transport runs over them.
//!
//! Tests can script dial failures per remote address, kill established
//! sessions and fail listeners.

use crate::Frame;
use crate::transport::{
    Acceptor, FrameReceiver, FrameSender, Result, Session, Transport, TransportError,
    read_frame, write_frame,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Buffer size of one in-memory stream pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Scripted result of a dial attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialOutcome {
    HandshakeTimeout,
    Refused,
}

type SessionQueue = mpsc::UnboundedSender<Arc<dyn Session>>;

#[derive(Default)]
struct NetworkInner {
    listeners: Mutex<HashMap<SocketAddr, SessionQueue>>,
    scripts: Mutex<HashMap<SocketAddr, VecDeque<DialOutcome>>>,
    dials: Mutex<Vec<(SocketAddr, Instant)>>,
    links: Mutex<Vec<(SocketAddr, Arc<watch::Sender<bool>>)>>,
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for a node whose sessions originate from `local`.
    pub fn transport(&self, local: SocketAddr) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            inner: Arc::clone(&self.inner),
            local,
        })
    }

    /// Queue outcomes for the next dials to `remote`.
    pub fn script_dials(&self, remote: SocketAddr, outcomes: impl IntoIterator<Item = DialOutcome>) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(remote)
            .or_default()
            .extend(outcomes);
    }

    /// Times of every dial attempt to `remote`.
    pub fn dial_attempts(&self, remote: SocketAddr) -> Vec<Instant> {
        self.inner
            .dials
            .lock()
            .unwrap()
            .iter()
            .filter(|(addr, _)| *addr == remote)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Close every established session dialled to `remote`.
    pub fn kill_sessions(&self, remote: SocketAddr) {
        let mut links = self.inner.links.lock().unwrap();
        links.retain(|(addr, closed)| {
            if *addr == remote {
                closed.send_replace(true);
                false
            } else {
                true
            }
        });
    }

    /// Drop the listener bound at `local`, failing its pending `accept`.
    pub fn fail_listener(&self, local: SocketAddr) {
        self.inner.listeners.lock().unwrap().remove(&local);
    }

    pub fn is_listening(&self, local: SocketAddr) -> bool {
        self.inner.listeners.lock().unwrap().contains_key(&local)
    }
}

pub struct MemoryTransport {
    inner: Arc<NetworkInner>,
    local: SocketAddr,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn listen(&self, local: SocketAddr) -> Result<Box<dyn Acceptor>> {
        let mut listeners = self.inner.listeners.lock().unwrap();
        if listeners.contains_key(&local) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "address in use",
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(local, tx);

        let (closed, _) = watch::channel(false);
        Ok(Box::new(MemoryAcceptor {
            inner: Arc::clone(&self.inner),
            local,
            sessions: rx,
            closed,
        }))
    }

    async fn dial(&self, remote: SocketAddr) -> Result<Arc<dyn Session>> {
        self.inner
            .dials
            .lock()
            .unwrap()
            .push((remote, Instant::now()));

        let scripted = self
            .inner
            .scripts
            .lock()
            .unwrap()
            .get_mut(&remote)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(DialOutcome::HandshakeTimeout) => return Err(TransportError::HandshakeTimeout),
            Some(DialOutcome::Refused) => {
                return Err(TransportError::connection_failed(remote, "refused"));
            }
            None => {}
        }

        // Nobody listening looks like an unanswered handshake
        let queue = self
            .inner
            .listeners
            .lock()
            .unwrap()
            .get(&remote)
            .cloned()
            .ok_or(TransportError::HandshakeTimeout)?;

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let (to_listener, listener_incoming) = mpsc::unbounded_channel();
        let (to_dialer, dialer_incoming) = mpsc::unbounded_channel();

        let dialer_side = Arc::new(MemorySession {
            remote,
            closed: Arc::clone(&closed),
            peer_streams: to_listener,
            incoming: tokio::sync::Mutex::new(dialer_incoming),
        });
        let listener_side: Arc<dyn Session> = Arc::new(MemorySession {
            remote: self.local,
            closed: Arc::clone(&closed),
            peer_streams: to_dialer,
            incoming: tokio::sync::Mutex::new(listener_incoming),
        });

        queue
            .send(listener_side)
            .map_err(|_| TransportError::HandshakeTimeout)?;
        self.inner.links.lock().unwrap().push((remote, closed));

        Ok(dialer_side)
    }
}

struct MemoryAcceptor {
    inner: Arc<NetworkInner>,
    local: SocketAddr,
    sessions: mpsc::UnboundedReceiver<Arc<dyn Session>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    async fn accept(&mut self) -> Result<Arc<dyn Session>> {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed("listener closed".to_string())),
            session = self.sessions.recv() => {
                session.ok_or_else(|| TransportError::Closed("listener failed".to_string()))
            }
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
        self.inner.listeners.lock().unwrap().remove(&self.local);
    }
}

struct MemorySession {
    remote: SocketAddr,
    closed: Arc<watch::Sender<bool>>,
    peer_streams: mpsc::UnboundedSender<DuplexStream>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

#[async_trait]
impl Session for MemorySession {
    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn open_stream(&self) -> Result<Box<dyn FrameSender>> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed("session closed".to_string()));
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.peer_streams
            .send(remote)
            .map_err(|_| TransportError::Closed("peer gone".to_string()))?;
        Ok(Box::new(MemoryFrameSender {
            pipe: local,
            closed: self.closed.subscribe(),
        }))
    }

    async fn accept_stream(&self) -> Result<Box<dyn FrameReceiver>> {
        let mut closed = self.closed.subscribe();
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed("session closed".to_string())),
            pipe = incoming.recv() => match pipe {
                Some(pipe) => Ok(Box::new(MemoryFrameReceiver {
                    pipe,
                    closed: self.closed.subscribe(),
                }) as Box<dyn FrameReceiver>),
                None => Err(TransportError::Closed("session closed".to_string())),
            },
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

struct MemoryFrameSender {
    pipe: DuplexStream,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl FrameSender for MemoryFrameSender {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|c| *c) => Err(TransportError::Closed("session closed".to_string())),
            res = write_frame(&mut self.pipe, frame) => res,
        }
    }
}

struct MemoryFrameReceiver {
    pipe: DuplexStream,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl FrameReceiver for MemoryFrameReceiver {
    async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|c| *c) => Err(TransportError::Closed("session closed".to_string())),
            res = read_frame(&mut self.pipe) => res,
        }
    }
}
