//! Concurrent lookup tables shared by the data plane.
//!
//! Three tables bind virtual addresses to what the forwarding loops need:
//! - `AddressTable`: virtual address -> real peer address (static)
//! - `RouteTable`: virtual address -> outbound channel of a peer session
//! - `EndpointTable`: virtual address -> local tunnel device
//!
//! All three are the same `ConcurrentTable` underneath. Lookups return
//! `Option`, a miss is an ordinary routing outcome and never an error.

use crate::Frame;
use crate::device::TunnelDevice;
use std::collections::HashMap;
use std::hash::Hash;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

/// Sending half of a peer's outbound frame queue.
pub type RouteSender = mpsc::Sender<Frame>;

/// Virtual address -> real peer address. Loaded once from configuration.
pub type AddressTable = ConcurrentTable<Ipv4Addr, SocketAddr>;

/// Virtual address -> outbound channel of an established peer session.
pub type RouteTable = ConcurrentTable<Ipv4Addr, RouteSender>;

/// Virtual address -> locally owned tunnel device.
pub type EndpointTable = ConcurrentTable<Ipv4Addr, Arc<dyn TunnelDevice>>;

/// Read-mostly map guarded by a `RwLock`.
///
/// Values are cloned out of the critical section so no caller ever holds
/// the lock across I/O. A poisoned lock is recovered: entries are plain
/// values and a panic mid-insert cannot leave one half-written.
pub struct ConcurrentTable<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> ConcurrentTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite an entry. Returns the previous value, if any.
    pub fn add(&self, key: K, value: V) -> Option<V> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value)
    }

    /// Look up an entry. `None` is a routable miss.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Remove an entry only if `predicate` holds for its current value.
    ///
    /// Check and removal happen under one write lock.
    pub fn remove_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(predicate) {
            entries.remove(key)
        } else {
            None
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of all entries.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove and return all entries.
    pub fn drain(&self) -> Vec<(K, V)> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }
}

impl<K, V> Default for ConcurrentTable<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrentTable<Ipv4Addr, RouteSender> {
    /// Remove the route for `vaddr` only if it still points at `sender`'s
    /// channel, so a writer loop never evicts a route registered by a
    /// newer session for the same peer.
    pub fn remove_channel(&self, vaddr: Ipv4Addr, sender: &RouteSender) -> bool {
        self.remove_if(&vaddr, |current| current.same_channel(sender))
            .is_some()
    }
}

/// The shared routing state handed to every data plane component.
///
/// Owned by the node and passed around as `Arc<Tables>`.
#[derive(Default)]
pub struct Tables {
    pub addresses: AddressTable,
    pub routes: RouteTable,
    pub endpoints: EndpointTable,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create tables with a pre-loaded address table.
    pub fn with_addresses(addresses: impl IntoIterator<Item = (Ipv4Addr, SocketAddr)>) -> Self {
        let tables = Self::new();
        for (vaddr, raddr) in addresses {
            tables.addresses.add(vaddr, raddr);
        }
        tables
    }
}
