//! In-memory stand-ins for tunnel devices and the peer transport,
//! plus builders for test packets.

pub mod device;
pub mod packets;
pub mod transport;

pub use device::{MemoryDevice, MemoryDriver};
pub use transport::{DialOutcome, MemoryNetwork, MemoryTransport};
