// src/slab.rs
use crate::client::WebClient;

/// Bounded pool of client slots with O(1) allocate/free. Slot indexes are
/// the epoll tokens, so they must stay stable for a connection's lifetime.
pub struct ClientSlab {
    entries: Vec<Option<WebClient>>,
    free_list: Vec<usize>,
    active: usize,
}

impl ClientSlab {
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        // Lowest index is reused first.
        let free_list = (0..capacity).rev().collect();
        Self {
            entries,
            free_list,
            active: 0,
        }
    }

    /// Returns the slot index, or None when the slab is at capacity
    /// (backpressure: the caller drops the connection).
    pub fn allocate(&mut self, client: WebClient) -> Option<usize> {
        let idx = self.free_list.pop()?;
        debug_assert!(self.entries[idx].is_none());
        self.entries[idx] = Some(client);
        self.active += 1;
        Some(idx)
    }

    /// Remove and return the slot; dropping it closes its descriptors.
    pub fn free(&mut self, index: usize) -> Option<WebClient> {
        let slot = self.entries.get_mut(index)?.take()?;
        self.free_list.push(index);
        self.active -= 1;
        Some(slot)
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&WebClient> {
        self.entries.get(index)?.as_ref()
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut WebClient> {
        self.entries.get_mut(index)?.as_mut()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.active
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics;
    use crate::transport::{Transport, TransportStatus};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    struct NullTransport;

    impl Transport for NullTransport {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<TransportStatus> {
            Ok(TransportStatus::WantRead)
        }
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<TransportStatus> {
            Ok(TransportStatus::WantWrite)
        }
    }

    fn client() -> WebClient {
        WebClient::new(
            Box::new(NullTransport),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 12345),
            &Config::default(),
            metrics::client_memory(),
        )
    }

    #[test]
    fn allocate_free_reuse_lowest_index() {
        let mut slab = ClientSlab::new(4);
        assert_eq!(slab.len(), 0);
        assert_eq!(slab.capacity(), 4);

        let a = slab.allocate(client()).unwrap();
        let b = slab.allocate(client()).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(slab.len(), 2);

        assert!(slab.free(a).is_some());
        assert_eq!(slab.len(), 1);

        // Freed index goes back to the head of the free list.
        let c = slab.allocate(client()).unwrap();
        assert_eq!(c, 0);
    }

    #[test]
    fn capacity_backpressure() {
        let mut slab = ClientSlab::new(1);
        slab.allocate(client()).unwrap();
        assert!(slab.allocate(client()).is_none());
    }

    #[test]
    fn double_free_is_none() {
        let mut slab = ClientSlab::new(2);
        let idx = slab.allocate(client()).unwrap();
        assert!(slab.free(idx).is_some());
        assert!(slab.free(idx).is_none());
    }
}
