//! Interface writer: delivers inbound frames to local tunnel devices.

use crate::packet;
use crate::tables::Tables;
use std::io;
use std::net::Ipv4Addr;
use tracing::{debug, trace};

/// Outcome of delivering one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the device owning the destination address.
    Delivered { device: String, bytes: usize },
    /// Not a well-formed IPv4 datagram. No lookup was made.
    NotIpv4,
    /// No local endpoint owns the destination.
    NoEndpoint(Ipv4Addr),
    /// The owning device had no room. The frame was dropped.
    DeviceBusy(String),
}

/// Write `frame` to the local device registered for its destination.
///
/// Drops are reported through `Delivery`; only a failed device write is
/// an error. A full device queue is a drop, not a failure.
pub fn deliver(tables: &Tables, frame: &[u8]) -> io::Result<Delivery> {
    let Some(header) = packet::classify(frame) else {
        debug!(len = frame.len(), "Dropping inbound non-IPv4 frame");
        return Ok(Delivery::NotIpv4);
    };

    let Some(device) = tables.endpoints.get(&header.dst) else {
        debug!(%header, "No local endpoint, dropping inbound frame");
        return Ok(Delivery::NoEndpoint(header.dst));
    };

    let bytes = match device.send(frame) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            trace!(%header, device = device.name(), "Device queue full, dropping inbound frame");
            return Ok(Delivery::DeviceBusy(device.name().to_string()));
        }
        Err(e) => return Err(e),
    };
    debug!(%header, device = device.name(), bytes, "Delivered inbound frame");

    Ok(Delivery::Delivered {
        device: device.name().to_string(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TunnelDevice;
    use crate::test_util::MemoryDevice;
    use crate::test_util::packets::{ipv4_udp, ipv6_stub};
    use std::sync::Arc;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 1);

    fn tables_with_devices() -> (Tables, Arc<MemoryDevice>, Arc<MemoryDevice>) {
        let tables = Tables::new();
        let a = Arc::new(MemoryDevice::new("mptest-1"));
        let b = Arc::new(MemoryDevice::new("mptest-2"));
        tables.endpoints.add(A, a.clone() as Arc<dyn TunnelDevice>);
        tables.endpoints.add(B, b.clone() as Arc<dyn TunnelDevice>);
        (tables, a, b)
    }

    #[test]
    fn test_delivers_to_owner_only() {
        let (tables, a, b) = tables_with_devices();
        let frame = ipv4_udp(REMOTE, B, 4000, 53, b"query");

        let delivery = deliver(&tables, &frame).unwrap();

        assert_eq!(
            delivery,
            Delivery::Delivered {
                device: "mptest-2".to_string(),
                bytes: frame.len(),
            }
        );
        assert_eq!(b.written(), vec![frame]);
        assert!(a.written().is_empty());
    }

    #[test]
    fn test_endpoint_miss_is_not_an_error() {
        let (tables, a, b) = tables_with_devices();
        let dst = Ipv4Addr::new(10, 0, 0, 9);
        let frame = ipv4_udp(REMOTE, dst, 4000, 53, b"lost");

        assert_eq!(deliver(&tables, &frame).unwrap(), Delivery::NoEndpoint(dst));
        assert!(a.written().is_empty());
        assert!(b.written().is_empty());
    }

    #[test]
    fn test_non_ipv4_dropped() {
        let (tables, a, b) = tables_with_devices();

        assert_eq!(deliver(&tables, &ipv6_stub()).unwrap(), Delivery::NotIpv4);
        assert_eq!(deliver(&tables, &[]).unwrap(), Delivery::NotIpv4);
        // Version nibble 4 but truncated header
        assert_eq!(deliver(&tables, &[0x45, 0, 0]).unwrap(), Delivery::NotIpv4);
        assert!(a.written().is_empty());
        assert!(b.written().is_empty());
    }

    #[test]
    fn test_full_device_queue_drops_frame() {
        let (tables, a, _) = tables_with_devices();
        a.saturate_writes(true);

        let frame = ipv4_udp(REMOTE, A, 4000, 53, b"x");
        assert_eq!(
            deliver(&tables, &frame).unwrap(),
            Delivery::DeviceBusy("mptest-1".to_string())
        );
        assert!(a.written().is_empty());

        a.saturate_writes(false);
        assert!(matches!(
            deliver(&tables, &frame).unwrap(),
            Delivery::Delivered { .. }
        ));
        assert_eq!(a.written(), vec![frame]);
    }

    #[test]
    fn test_device_write_failure_propagates() {
        let (tables, a, _) = tables_with_devices();
        a.fail_writes();

        let frame = ipv4_udp(REMOTE, A, 4000, 53, b"x");
        assert!(deliver(&tables, &frame).is_err());
    }
}
