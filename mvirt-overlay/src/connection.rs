//! Connection manager: one outbound session per configured peer.
//!
//! For every address table entry a task runs this state machine:
//!
//! ```text
//!          +--------- handshake timeout: sleep(interval) ---------+
//!          v                                                      |
//!      [dial] --ok--> [open stream] --> [route added] --> [drain channel]
//!          |                 |                                    |
//!   other error         error: abandon            write failed: remove route,
//!          v                                      close session, back to [dial]
//!      abandoned
//! ```
//!
//! Every wait also watches the shutdown signal.

use crate::shutdown::ShutdownListener;
use crate::tables::Tables;
use crate::transport::{FrameSender, Session, Transport, TransportError};
use crate::Frame;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Default wait between handshake-timeout retries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Fixed-interval, unbounded retry on handshake timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Why a peer task ended.
#[derive(Debug)]
pub enum PeerExit {
    Shutdown,
    /// A non-retryable failure. The peer is not dialled again.
    Abandoned(TransportError),
}

/// Dial `remote`, retrying handshake timeouts every `policy.interval`.
///
/// Returns `Ok(None)` if shutdown was signalled first. Any other dial
/// error is returned as is.
pub async fn establish(
    transport: &dyn Transport,
    remote: SocketAddr,
    policy: &RetryPolicy,
    shutdown: &mut ShutdownListener,
) -> Result<Option<Arc<dyn Session>>, TransportError> {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let dialed = tokio::select! {
            _ = shutdown.triggered() => return Ok(None),
            res = transport.dial(remote) => res,
        };

        match dialed {
            Ok(session) => {
                debug!(%remote, attempt, "Session established");
                return Ok(Some(session));
            }
            Err(e) if e.is_handshake_timeout() => {
                warn!(%remote, attempt, retry_in = ?policy.interval, "Handshake timed out, retrying");
                tokio::select! {
                    _ = shutdown.triggered() => return Ok(None),
                    _ = tokio::time::sleep(policy.interval) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

enum DrainEnd {
    Shutdown,
    Failed(TransportError),
}

/// Dials every peer in the address table and owns their route channels.
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    tables: Arc<Tables>,
    policy: RetryPolicy,
    capacity: usize,
    shutdown: ShutdownListener,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        tables: Arc<Tables>,
        policy: RetryPolicy,
        capacity: usize,
        shutdown: ShutdownListener,
    ) -> Self {
        Self {
            transport,
            tables,
            policy,
            capacity,
            shutdown,
        }
    }

    /// Spawn one independent task per address table entry.
    pub fn start(&self) -> JoinSet<(Ipv4Addr, PeerExit)> {
        let mut tasks = JoinSet::new();
        for (vaddr, raddr) in self.tables.addresses.snapshot() {
            let manager = self.clone();
            tasks.spawn(async move {
                let exit = manager.run_peer(vaddr, raddr).await;
                (vaddr, exit)
            });
        }
        tasks
    }

    /// Keep a session to the peer behind `vaddr` until shutdown or until
    /// a non-retryable failure.
    pub async fn run_peer(mut self, vaddr: Ipv4Addr, raddr: SocketAddr) -> PeerExit {
        loop {
            let session =
                match establish(self.transport.as_ref(), raddr, &self.policy, &mut self.shutdown)
                    .await
                {
                    Ok(Some(session)) => session,
                    Ok(None) => return PeerExit::Shutdown,
                    Err(e) => {
                        error!(%vaddr, %raddr, error = %e, "Failed to connect to peer, giving up");
                        return PeerExit::Abandoned(e);
                    }
                };

            let mut stream = match session.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(%vaddr, %raddr, error = %e, "Failed to open stream, giving up");
                    session.close();
                    return PeerExit::Abandoned(e);
                }
            };

            let (tx, mut rx) = mpsc::channel(self.capacity);
            if self.tables.routes.add(vaddr, tx.clone()).is_some() {
                warn!(%vaddr, "Replaced an existing route");
            }
            info!(%vaddr, %raddr, "Route established");

            let end = self.drain(&mut rx, stream.as_mut()).await;

            self.tables.routes.remove_channel(vaddr, &tx);
            session.close();

            match end {
                DrainEnd::Shutdown => {
                    debug!(%vaddr, "Peer writer stopped");
                    return PeerExit::Shutdown;
                }
                DrainEnd::Failed(e) => {
                    warn!(%vaddr, %raddr, error = %e, "Session to peer failed, reconnecting");
                }
            }
        }
    }

    /// Move frames from the route channel to the stream in FIFO order.
    async fn drain(&mut self, rx: &mut mpsc::Receiver<Frame>, stream: &mut dyn FrameSender) -> DrainEnd {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.triggered() => return DrainEnd::Shutdown,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => return DrainEnd::Shutdown,
                },
            };

            let sent = tokio::select! {
                _ = self.shutdown.triggered() => return DrainEnd::Shutdown,
                res = stream.send_frame(&frame) => res,
            };
            if let Err(e) = sent {
                return DrainEnd::Failed(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use crate::test_util::packets::{numbered, sequence_of};
    use crate::test_util::{DialOutcome, MemoryNetwork};
    use crate::transport::FrameReceiver;

    const VADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);

    fn remote() -> SocketAddr {
        "203.0.113.5:2345".parse().unwrap()
    }

    fn local() -> SocketAddr {
        "203.0.113.6:2345".parse().unwrap()
    }

    fn manager(network: &MemoryNetwork, shutdown: &Shutdown) -> (ConnectionManager, Arc<Tables>) {
        let tables = Arc::new(Tables::with_addresses([(VADDR, remote())]));
        let manager = ConnectionManager::new(
            network.transport(local()),
            tables.clone(),
            RetryPolicy::default(),
            10,
            shutdown.listener(),
        );
        (manager, tables)
    }

    async fn wait_for_route(tables: &Tables, not: Option<&mpsc::Sender<Frame>>) -> mpsc::Sender<Frame> {
        loop {
            if let Some(route) = tables.routes.get(&VADDR)
                && !not.is_some_and(|old| old.same_channel(&route))
            {
                return route;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn accept_stream(acceptor: &mut Box<dyn crate::transport::Acceptor>) -> Box<dyn FrameReceiver> {
        let session = acceptor.accept().await.unwrap();
        session.accept_stream().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_handshake_timeout() {
        let network = MemoryNetwork::new();
        let mut acceptor = network.transport(remote()).listen(remote()).await.unwrap();
        network.script_dials(remote(), [DialOutcome::HandshakeTimeout]);

        let shutdown = Shutdown::new();
        let (manager, tables) = manager(&network, &shutdown);
        let mut tasks = manager.start();

        let route = wait_for_route(&tables, None).await;

        let attempts = network.dial_attempts(remote());
        assert_eq!(attempts.len(), 2);
        let waited = attempts[1] - attempts[0];
        assert!(waited >= Duration::from_secs(3), "retried after {waited:?}");
        assert!(waited < Duration::from_millis(3100), "retried after {waited:?}");

        // Channel writes flow to the peer's stream
        let mut stream = accept_stream(&mut acceptor).await;
        route.send(numbered(LOCAL, VADDR, 7)).await.unwrap();
        let frame = stream.recv_frame().await.unwrap().unwrap();
        assert_eq!(sequence_of(&frame), Some(7));

        // No further dials once established
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(network.dial_attempts(remote()).len(), 2);

        shutdown.trigger();
        let (vaddr, exit) = tasks.join_next().await.unwrap().unwrap();
        assert_eq!(vaddr, VADDR);
        assert!(matches!(exit, PeerExit::Shutdown));
        assert!(!tables.routes.contains(&VADDR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_dial_failure_abandons_peer() {
        let network = MemoryNetwork::new();
        network.script_dials(remote(), [DialOutcome::Refused]);

        let shutdown = Shutdown::new();
        let (manager, tables) = manager(&network, &shutdown);
        let mut tasks = manager.start();

        let (vaddr, exit) = tasks.join_next().await.unwrap().unwrap();
        assert_eq!(vaddr, VADDR);
        assert!(matches!(
            exit,
            PeerExit::Abandoned(TransportError::ConnectionFailed { .. })
        ));
        assert!(tables.routes.is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(network.dial_attempts(remote()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_retry_wait() {
        let network = MemoryNetwork::new();
        // Nothing listening: every dial times out

        let shutdown = Shutdown::new();
        let (manager, _tables) = manager(&network, &shutdown);
        let mut tasks = manager.start();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(network.dial_attempts(remote()).len(), 4);

        shutdown.trigger();
        let (_, exit) = tasks.join_next().await.unwrap().unwrap();
        assert!(matches!(exit, PeerExit::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_keep_fifo_order() {
        let network = MemoryNetwork::new();
        let mut acceptor = network.transport(remote()).listen(remote()).await.unwrap();

        let shutdown = Shutdown::new();
        let (manager, tables) = manager(&network, &shutdown);
        let _tasks = manager.start();

        let route = wait_for_route(&tables, None).await;
        let mut stream = accept_stream(&mut acceptor).await;

        let producer = tokio::spawn(async move {
            for seq in 0..100 {
                route.send(numbered(LOCAL, VADDR, seq)).await.unwrap();
            }
        });

        for seq in 0..100 {
            let frame = stream.recv_frame().await.unwrap().unwrap();
            assert_eq!(sequence_of(&frame), Some(seq));
        }
        producer.await.unwrap();
        shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_session_removes_route_and_redials() {
        let network = MemoryNetwork::new();
        let mut acceptor = network.transport(remote()).listen(remote()).await.unwrap();

        let shutdown = Shutdown::new();
        let (manager, tables) = manager(&network, &shutdown);
        let _tasks = manager.start();

        let first = wait_for_route(&tables, None).await;
        let _first_stream = accept_stream(&mut acceptor).await;

        network.kill_sessions(remote());
        // The writer notices on its next write
        first.send(numbered(LOCAL, VADDR, 0)).await.unwrap();

        let second = wait_for_route(&tables, Some(&first)).await;
        assert!(!second.same_channel(&first));
        assert_eq!(network.dial_attempts(remote()).len(), 2);

        let mut stream = accept_stream(&mut acceptor).await;
        second.send(numbered(LOCAL, VADDR, 1)).await.unwrap();
        let frame = stream.recv_frame().await.unwrap().unwrap();
        assert_eq!(sequence_of(&frame), Some(1));

        shutdown.trigger();
    }
}
