//! Linux TUN devices for locally owned virtual addresses
//!
//! Each device is a Layer 3 TUN interface (raw IP packets, no Ethernet
//! header, no packet information prefix). Addresses and link state are
//! set with socket ioctls.

use crate::device::{RecvResult, TunnelDevice, TunnelDriver};
use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// TUN device flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// How long `recv` waits for readability before returning `WouldBlock`.
const POLL_INTERVAL_MS: u16 = 100;

/// How long `send` waits for room in a full device queue.
const SEND_WAIT_MS: u16 = 5;

/// ifreq structure for TUN device creation and interface flags
#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

/// ifreq structure for address and netmask ioctls
#[repr(C)]
struct IfReqAddr {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_addr: libc::sockaddr_in,
    _pad: [u8; 8],
}

/// Check that `name` fits into `ifr_name` with its NUL terminator.
pub fn validate_name(name: &str) -> io::Result<()> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid TUN device name: {name:?}"),
        ));
    }
    Ok(())
}

fn ifr_name(name: &str) -> io::Result<[libc::c_char; libc::IFNAMSIZ]> {
    validate_name(name)?;
    let mut buf = [0; libc::IFNAMSIZ];
    for (i, &b) in name.as_bytes().iter().enumerate() {
        buf[i] = b as libc::c_char;
    }
    Ok(buf)
}

/// A kernel TUN interface.
///
/// The fd is non-blocking; `recv` polls with a short timeout so reader
/// threads can observe shutdown between frames.
pub struct TunDevice {
    name: String,
    file: File,
    closed: AtomicBool,
}

impl TunDevice {
    /// Create a Layer 3 TUN device with the given name.
    pub fn create(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let ifr = IfReqFlags {
            ifr_name: ifr_name(name)?,
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(name, "TUN device created");

        Ok(Self {
            name: name.to_string(),
            file,
            closed: AtomicBool::new(false),
        })
    }

}

impl TunnelDevice for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<RecvResult> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(RecvResult::Done);
        }

        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) | Err(Errno::EINTR) => return Ok(RecvResult::WouldBlock),
            Ok(_) => {}
            Err(e) => return Err(io::Error::from(e)),
        }

        match (&self.file).read(buf) {
            Ok(0) => Ok(RecvResult::Done),
            Ok(n) => Ok(RecvResult::Frame(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvResult::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        match (&self.file).write(frame) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Queue full: wait briefly for room, then retry once
                let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLOUT)];
                match poll(&mut fds, PollTimeout::from(SEND_WAIT_MS)) {
                    Ok(n) if n > 0 => (&self.file).write(frame),
                    Ok(_) | Err(Errno::EINTR) => Err(e),
                    Err(errno) => Err(io::Error::from(errno)),
                }
            }
            res => res,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        debug!(name = %self.name, "TUN device closed");
    }
}

/// RAII guard for socket fd
struct SockGuard(RawFd);

impl SockGuard {
    fn inet() -> io::Result<Self> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(sock))
    }
}

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn set_link_up(name: &str, up: bool) -> io::Result<()> {
    let sock = SockGuard::inet()?;

    let mut ifr = IfReqFlags {
        ifr_name: ifr_name(name)?,
        ifr_flags: 0,
        _pad: [0; 22],
    };

    let ret = unsafe { libc::ioctl(sock.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    if up {
        ifr.ifr_flags |= libc::IFF_UP as libc::c_short;
    } else {
        ifr.ifr_flags &= !(libc::IFF_UP as libc::c_short);
    }

    let ret = unsafe { libc::ioctl(sock.0, libc::SIOCSIFFLAGS as _, &ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_addr(name: &str, request: libc::c_ulong, addr: Ipv4Addr) -> io::Result<()> {
    let sock = SockGuard::inet()?;

    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.octets()),
    };

    let ifr = IfReqAddr {
        ifr_name: ifr_name(name)?,
        ifr_addr: sin,
        _pad: [0; 8],
    };

    let ret = unsafe { libc::ioctl(sock.0, request as _, &ifr) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Driver for kernel TUN devices. Requires CAP_NET_ADMIN.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxTunDriver;

impl TunnelDriver for LinuxTunDriver {
    fn create(&self, name: &str) -> io::Result<Arc<dyn TunnelDevice>> {
        Ok(Arc::new(TunDevice::create(name)?))
    }

    fn configure(
        &self,
        device: &dyn TunnelDevice,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> io::Result<()> {
        let name = device.name();
        set_addr(name, libc::SIOCSIFADDR as libc::c_ulong, address)?;
        set_addr(name, libc::SIOCSIFNETMASK as libc::c_ulong, netmask)?;
        set_link_up(name, true)?;
        info!(name, %address, %netmask, "Interface configured");
        Ok(())
    }

    fn teardown(&self, device: &dyn TunnelDevice) -> io::Result<()> {
        device.close();
        // The interface itself disappears when the last fd is dropped
        set_link_up(device.name(), false)?;
        info!(name = %device.name(), "Interface down");
        Ok(())
    }
}
