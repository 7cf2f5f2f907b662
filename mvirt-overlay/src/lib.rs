pub mod config;
pub mod connection;
pub mod device;
pub mod inbound;
pub mod node;
pub mod packet;
pub mod reader;
pub mod shutdown;
pub mod tables;
pub mod test_util;
pub mod transport;
pub mod tun;
pub mod writer;

/// A raw IPv4 datagram as read from or written to a tunnel device.
pub type Frame = Vec<u8>;
