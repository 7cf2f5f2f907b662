//! In-memory tunnel devices
//!
//! `MemoryDevice` stands in for a TUN interface: tests inject frames the
//! "kernel" would deliver and inspect frames the data plane wrote.

use crate::Frame;
use crate::device::{RecvResult, TunnelDevice, TunnelDriver};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long `recv` waits for an injected frame.
const RECV_POLL: Duration = Duration::from_millis(10);

pub struct MemoryDevice {
    name: String,
    inject_tx: Sender<Frame>,
    inject_rx: Mutex<Receiver<Frame>>,
    written: Mutex<Vec<Frame>>,
    address: Mutex<Option<(Ipv4Addr, Ipv4Addr)>>,
    closed: AtomicBool,
    torn_down: AtomicBool,
    fail_writes: AtomicBool,
    saturated: AtomicBool,
}

impl MemoryDevice {
    pub fn new(name: impl Into<String>) -> Self {
        let (inject_tx, inject_rx) = mpsc::channel();
        Self {
            name: name.into(),
            inject_tx,
            inject_rx: Mutex::new(inject_rx),
            written: Mutex::new(Vec::new()),
            address: Mutex::new(None),
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            saturated: AtomicBool::new(false),
        }
    }

    /// Queue a frame to be returned by `recv`.
    pub fn inject(&self, frame: Frame) {
        let _ = self.inject_tx.send(frame);
    }

    /// Frames the data plane has written so far.
    pub fn written(&self) -> Vec<Frame> {
        self.written.lock().unwrap().clone()
    }

    /// Wait until at least `count` frames were written, or `timeout` passes.
    pub async fn wait_for_written(&self, count: usize, timeout: Duration) -> Vec<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let written = self.written();
            if written.len() >= count || tokio::time::Instant::now() >= deadline {
                return written;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Make every subsequent `send` fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// While set, `send` reports a full queue (`WouldBlock`).
    pub fn saturate_writes(&self, saturated: bool) {
        self.saturated.store(saturated, Ordering::SeqCst);
    }

    pub fn address(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        *self.address.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl TunnelDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<RecvResult> {
        if self.is_closed() {
            return Ok(RecvResult::Done);
        }
        let rx = self.inject_rx.lock().unwrap();
        match rx.recv_timeout(RECV_POLL) {
            Ok(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(RecvResult::Frame(len))
            }
            Err(RecvTimeoutError::Timeout) => Ok(RecvResult::WouldBlock),
            Err(RecvTimeoutError::Disconnected) => Ok(RecvResult::Done),
        }
    }

    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("device write failed"));
        }
        if self.saturated.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.written.lock().unwrap().push(frame.to_vec());
        Ok(frame.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Driver handing out `MemoryDevice`s.
#[derive(Default)]
pub struct MemoryDriver {
    devices: Mutex<HashMap<String, Arc<MemoryDevice>>>,
    fail_create: Mutex<HashSet<String>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `create` fail for the named device.
    pub fn fail_create(&self, name: impl Into<String>) {
        self.fail_create.lock().unwrap().insert(name.into());
    }

    pub fn device(&self, name: &str) -> Option<Arc<MemoryDevice>> {
        self.devices.lock().unwrap().get(name).cloned()
    }

    fn lookup(&self, device: &dyn TunnelDevice) -> io::Result<Arc<MemoryDevice>> {
        self.device(device.name())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown device"))
    }
}

impl TunnelDriver for MemoryDriver {
    fn create(&self, name: &str) -> io::Result<Arc<dyn TunnelDevice>> {
        if self.fail_create.lock().unwrap().contains(name) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "device creation refused",
            ));
        }
        let device = Arc::new(MemoryDevice::new(name));
        self.devices
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&device));
        Ok(device)
    }

    fn configure(
        &self,
        device: &dyn TunnelDevice,
        address: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> io::Result<()> {
        let device = self.lookup(device)?;
        *device.address.lock().unwrap() = Some((address, netmask));
        Ok(())
    }

    fn teardown(&self, device: &dyn TunnelDevice) -> io::Result<()> {
        let device = self.lookup(device)?;
        device.close();
        device.torn_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}
