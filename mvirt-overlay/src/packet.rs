//! IPv4 frame classification using smoltcp
//!
//! Only the fields the data plane routes on are extracted: addresses,
//! protocol and (for unfragmented TCP/UDP) ports. Nothing is reassembled
//! and IPv6 is reported as not routable.

use smoltcp::wire::{IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};
use std::fmt;
use std::net::Ipv4Addr;

/// Header fields of a well-formed IPv4 frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: IpProtocol,
    /// Transport ports, present for the first fragment of TCP/UDP.
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// Total length from the IP header.
    pub total_len: usize,
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.src_port, self.dst_port) {
            (Some(sp), Some(dp)) => write!(f, "{}:{} -> {}:{}", self.src, sp, self.dst, dp),
            _ => write!(f, "{} -> {}", self.src, self.dst),
        }
    }
}

/// Quick version-nibble check, no length validation.
pub fn is_ipv4(frame: &[u8]) -> bool {
    frame.first().is_some_and(|b| b >> 4 == 4)
}

/// Parse the header of an IPv4 frame.
///
/// Returns `None` for anything that is not a well-formed IPv4 datagram:
/// other IP versions, truncated headers, or a total length exceeding
/// the buffer.
pub fn classify(frame: &[u8]) -> Option<FrameHeader> {
    if !is_ipv4(frame) {
        return None;
    }
    let packet = Ipv4Packet::new_checked(frame).ok()?;

    let protocol = packet.next_header();
    let (src_port, dst_port) = if packet.frag_offset() == 0 {
        transport_ports(protocol, packet.payload())
    } else {
        (None, None)
    };

    Some(FrameHeader {
        src: Ipv4Addr::from(packet.src_addr()),
        dst: Ipv4Addr::from(packet.dst_addr()),
        protocol,
        src_port,
        dst_port,
        total_len: usize::from(packet.total_len()),
    })
}

fn transport_ports(protocol: IpProtocol, payload: &[u8]) -> (Option<u16>, Option<u16>) {
    match protocol {
        IpProtocol::Udp => match UdpPacket::new_checked(payload) {
            Ok(udp) => (Some(udp.src_port()), Some(udp.dst_port())),
            Err(_) => (None, None),
        },
        IpProtocol::Tcp => match TcpPacket::new_checked(payload) {
            Ok(tcp) => (Some(tcp.src_port()), Some(tcp.dst_port())),
            Err(_) => (None, None),
        },
        _ => (None, None),
    }
}
