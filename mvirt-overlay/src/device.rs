//! Tunnel device abstraction
//!
//! The data plane never creates interfaces itself. A `TunnelDriver`
//! creates, configures and tears down devices, and each `TunnelDevice`
//! moves raw IP frames:
//! - `LinuxTunDriver` (see `tun`): kernel TUN devices
//! - `MemoryDriver` (see `test_util`): in-process devices for tests

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Result of a receive operation
#[derive(Debug, PartialEq, Eq)]
pub enum RecvResult {
    /// A frame of the given length was written into the buffer
    Frame(usize),
    /// Nothing arrived within the device's poll interval
    WouldBlock,
    /// Device closed, no more frames will arrive
    Done,
}

/// A local virtual interface carrying raw IPv4 frames.
///
/// Devices are shared between a reader thread and any number of
/// inbound stream loops, so every method takes `&self`.
pub trait TunnelDevice: Send + Sync {
    /// Interface name as seen by the host.
    fn name(&self) -> &str;

    /// Receive one frame.
    ///
    /// Blocks for at most a short poll interval so the caller can observe
    /// cancellation between calls.
    fn recv(&self, buf: &mut [u8]) -> io::Result<RecvResult>;

    /// Write one frame, returning the number of bytes written.
    ///
    /// `io::ErrorKind::WouldBlock` means the device had no room for the
    /// frame. Callers drop the frame and carry on.
    fn send(&self, frame: &[u8]) -> io::Result<usize>;

    /// Close the device. Pending and future `recv` calls return `Done`.
    fn close(&self);
}

/// Creates and manages tunnel devices.
pub trait TunnelDriver: Send + Sync {
    fn create(&self, name: &str) -> io::Result<Arc<dyn TunnelDevice>>;

    /// Assign an address and bring the interface up.
    fn configure(
        &self,
        device: &dyn TunnelDevice,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> io::Result<()>;

    /// Bring the interface down and release it.
    fn teardown(&self, device: &dyn TunnelDevice) -> io::Result<()>;
}
