//! Inbound session handler
//!
//! ```text
//! accept loop ──> one task per session ──> one task per stream
//!                   (accept_stream)          (recv_frame -> writer::deliver)
//! ```
//!
//! A failing stream or session only ends its own task. A failing
//! acceptor ends `run` with an error, which the node treats as fatal.
//!
//! A pending `accept` is only abandoned on shutdown. Finished session
//! tasks are reaped between accepts, never by racing them.

use crate::shutdown::ShutdownListener;
use crate::tables::Tables;
use crate::transport::{Acceptor, FrameReceiver, Result, Session};
use crate::writer::{self, Delivery};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct InboundServer {
    acceptor: Box<dyn Acceptor>,
    tables: Arc<Tables>,
    shutdown: ShutdownListener,
}

impl InboundServer {
    pub fn new(acceptor: Box<dyn Acceptor>, tables: Arc<Tables>, shutdown: ShutdownListener) -> Self {
        Self {
            acceptor,
            tables,
            shutdown,
        }
    }

    /// Accept sessions until shutdown (`Ok`) or until the listener fails.
    pub async fn run(mut self) -> Result<()> {
        if let Ok(local) = self.acceptor.local_addr() {
            info!(%local, "Accepting peer sessions");
        }

        let mut sessions = JoinSet::new();
        let result = loop {
            let session = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break Ok(()),
                res = self.acceptor.accept() => match res {
                    Ok(session) => session,
                    Err(e) => break Err(e),
                },
            };
            while sessions.try_join_next().is_some() {}

            info!(remote = %session.remote_addr(), "Accepted peer session");
            sessions.spawn(handle_session(
                session,
                self.tables.clone(),
                self.shutdown.clone(),
            ));
        };

        self.acceptor.close();
        if result.is_ok() {
            while sessions.join_next().await.is_some() {}
        } else {
            sessions.shutdown().await;
        }
        result
    }
}

/// Accept streams on one session and spawn a read loop for each.
pub async fn handle_session(session: Arc<dyn Session>, tables: Arc<Tables>, mut shutdown: ShutdownListener) {
    let remote = session.remote_addr();
    let mut streams = JoinSet::new();

    loop {
        let stream = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            Some(_) = streams.join_next(), if !streams.is_empty() => continue,
            res = session.accept_stream() => match res {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%remote, error = %e, "Session ended");
                    break;
                }
            },
        };

        debug!(%remote, "Accepted stream");
        streams.spawn(handle_stream(stream, remote, tables.clone(), shutdown.clone()));
    }

    while streams.join_next().await.is_some() {}
    session.close();
    info!(%remote, "Peer session closed");
}

/// Read frames from one stream and deliver each locally.
///
/// Endpoint misses and non-IPv4 frames are dropped and the loop goes on.
/// A read error or a failed device write ends the loop.
pub async fn handle_stream(
    mut stream: Box<dyn FrameReceiver>,
    remote: SocketAddr,
    tables: Arc<Tables>,
    mut shutdown: ShutdownListener,
) -> u64 {
    let mut delivered = 0u64;

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            res = stream.recv_frame() => match res {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(%remote, "Stream finished by peer");
                    break;
                }
                Err(e) => {
                    debug!(%remote, error = %e, "Stream read failed");
                    break;
                }
            },
        };

        match writer::deliver(&tables, &frame) {
            Ok(Delivery::Delivered { .. }) => delivered += 1,
            Ok(Delivery::NotIpv4 | Delivery::NoEndpoint(_) | Delivery::DeviceBusy(_)) => {}
            Err(e) => {
                warn!(%remote, error = %e, "Local delivery failed, closing stream");
                break;
            }
        }
    }

    debug!(%remote, delivered, "Stream loop ended");
    delivered
}
