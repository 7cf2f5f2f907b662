//! Interface readers
//!
//! One OS thread per local tunnel device. Each thread reads frames,
//! resolves the destination in the route table and pushes the frame onto
//! that peer's channel. `blocking_send` waits while the channel is full,
//! which back-pressures the device instead of dropping.

use crate::device::{RecvResult, TunnelDevice};
use crate::packet;
use crate::shutdown::ShutdownListener;
use crate::tables::Tables;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace};

/// Per-reader frame counters, returned when the thread exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderStats {
    pub forwarded: u64,
    pub not_ipv4: u64,
    pub no_route: u64,
    /// Route hit, but the peer's writer loop was gone.
    pub dead_route: u64,
}

pub struct InterfaceReader {
    device: Arc<dyn TunnelDevice>,
    tables: Arc<Tables>,
    shutdown: ShutdownListener,
    buffer_size: usize,
}

impl InterfaceReader {
    pub fn new(
        device: Arc<dyn TunnelDevice>,
        tables: Arc<Tables>,
        shutdown: ShutdownListener,
        buffer_size: usize,
    ) -> Self {
        Self {
            device,
            tables,
            shutdown,
            buffer_size,
        }
    }

    /// Run the reader on a dedicated thread named after the device.
    pub fn spawn(self) -> io::Result<JoinHandle<ReaderStats>> {
        std::thread::Builder::new()
            .name(format!("reader-{}", self.device.name()))
            .spawn(move || self.run())
    }

    /// Read until shutdown or until the device is closed.
    pub fn run(self) -> ReaderStats {
        let name = self.device.name().to_string();
        let mut stats = ReaderStats::default();
        let mut buf = vec![0u8; self.buffer_size];

        info!(device = %name, "Interface reader started");

        while !self.shutdown.is_triggered() {
            let len = match self.device.recv(&mut buf) {
                Ok(RecvResult::Frame(len)) => len,
                Ok(RecvResult::WouldBlock) => continue,
                Ok(RecvResult::Done) => break,
                Err(e) => {
                    error!(device = %name, error = %e, "Interface read failed");
                    break;
                }
            };
            self.forward(&name, &buf[..len], &mut stats);
        }

        info!(device = %name, ?stats, "Interface reader stopped");
        stats
    }

    fn forward(&self, name: &str, frame: &[u8], stats: &mut ReaderStats) {
        let Some(header) = packet::classify(frame) else {
            debug!(device = name, len = frame.len(), "Not an IPv4 frame, dropping");
            stats.not_ipv4 += 1;
            return;
        };

        let Some(route) = self.tables.routes.get(&header.dst) else {
            debug!(device = name, %header, "No route, dropping frame");
            stats.no_route += 1;
            return;
        };

        debug!(device = name, %header, len = frame.len(), "Forwarding frame");
        if route.blocking_send(frame.to_vec()).is_err() {
            trace!(device = name, dst = %header.dst, "Route channel closed, dropping frame");
            stats.dead_route += 1;
            return;
        }
        stats.forwarded += 1;
    }
}
