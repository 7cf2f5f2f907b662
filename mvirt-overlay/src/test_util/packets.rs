//! Hand-assembled IPv4 frames for tests.

use std::net::Ipv4Addr;

const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Build an IPv4/UDP datagram with a valid header checksum.
pub fn ipv4_udp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut udp = Vec::with_capacity(UDP_HEADER_LEN + payload.len());
    udp.extend_from_slice(&src_port.to_be_bytes());
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
    // Checksum 0 = not computed, valid for UDP over IPv4
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);

    ipv4(src, dst, 17, &udp)
}

/// Build an IPv4 ICMP echo request.
pub fn ipv4_icmp(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let mut icmp = vec![8, 0, 0, 0, 0, 1, 0, 1];
    let csum = checksum(&icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());

    ipv4(src, dst, 1, &icmp)
}

/// A minimal IPv6 header (version 6), for non-IPv4 drop paths.
pub fn ipv6_stub() -> Vec<u8> {
    let mut frame = vec![0u8; 40];
    frame[0] = 0x60;
    frame[6] = 59; // no next header
    frame[7] = 64;
    frame
}

/// Build a UDP frame tagged with a sequence number in its payload.
pub fn numbered(src: Ipv4Addr, dst: Ipv4Addr, seq: u32) -> Vec<u8> {
    ipv4_udp(src, dst, 4000, 4000, &seq.to_be_bytes())
}

/// Read back the sequence number written by [`numbered`].
pub fn sequence_of(frame: &[u8]) -> Option<u32> {
    let start = IPV4_HEADER_LEN + UDP_HEADER_LEN;
    let bytes: [u8; 4] = frame.get(start..start + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total_len = (IPV4_HEADER_LEN + payload.len()) as u16;

    let mut frame = Vec::with_capacity(total_len as usize);
    frame.push(0x45); // version 4, IHL 5
    frame.push(0);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0x12, 0x34]); // identification
    frame.extend_from_slice(&[0x40, 0x00]); // don't fragment
    frame.push(64);
    frame.push(protocol);
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&dst.octets());

    let csum = checksum(&frame[..IPV4_HEADER_LEN]);
    frame[10..12].copy_from_slice(&csum.to_be_bytes());

    frame.extend_from_slice(payload);
    frame
}

fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
