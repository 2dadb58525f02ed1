//! Loopback port allocation
//!
//! Ports come from the OS by binding `127.0.0.1:0`. The listener is kept open
//! while the caller records the number, so a second allocation in the same
//! run cannot be handed the same port. Every issued number is remembered for
//! the allocator's lifetime: once released the port is free at the OS level
//! again, and a later bind may get it back.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{FixtureError, FixtureResult};

const MAX_REPROBES: usize = 16;

/// Hands out distinct loopback ports for one orchestration run
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    issued: Arc<Mutex<HashSet<u16>>>,
}

/// A port held open by its listener until released
#[derive(Debug)]
pub struct ReservedPort {
    port: u16,
    listener: Option<TcpListener>,
}

impl ReservedPort {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close the listener so the server can bind the port
    pub fn release(mut self) -> u16 {
        self.listener.take();
        self.port
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve one free port
    ///
    /// A bind failure is returned as is. If the OS keeps returning numbers
    /// this allocator already issued, it gives up after a bounded number of
    /// attempts.
    pub fn allocate(&self) -> FixtureResult<ReservedPort> {
        let mut rejected = Vec::new();
        for _ in 0..MAX_REPROBES {
            let listener =
                TcpListener::bind("127.0.0.1:0").map_err(|source| FixtureError::PortAllocation { source })?;
            let port = listener
                .local_addr()
                .map_err(|source| FixtureError::PortAllocation { source })?
                .port();

            if self.issued.lock().insert(port) {
                return Ok(ReservedPort {
                    port,
                    listener: Some(listener),
                });
            }

            debug!("🔁 Port {} already issued in this run, probing again", port);
            // Keep it bound so the next probe gets a different number
            rejected.push(listener);
        }
        Err(FixtureError::PortsExhausted {
            attempts: MAX_REPROBES,
        })
    }

    /// Reserve `count` ports, releasing them only once every number is known
    pub fn allocate_many(&self, count: usize) -> FixtureResult<Vec<u16>> {
        let reservations = (0..count)
            .map(|_| self.allocate())
            .collect::<FixtureResult<Vec<_>>>()?;
        Ok(reservations.into_iter().map(ReservedPort::release).collect())
    }

    /// Number of ports issued so far
    pub fn issued_count(&self) -> usize {
        self.issued.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_allocated_ports_are_pairwise_distinct() {
        let allocator = PortAllocator::new();
        let ports = allocator.allocate_many(24).unwrap();

        let unique: HashSet<_> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
        assert_eq!(allocator.issued_count(), 24);
    }

    #[test]
    fn test_released_port_can_be_bound() {
        let allocator = PortAllocator::new();
        let reserved = allocator.allocate().unwrap();
        assert_ne!(reserved.port(), 0);

        let port = reserved.release();
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_port_is_held_until_release() {
        let allocator = PortAllocator::new();
        let reserved = allocator.allocate().unwrap();

        assert!(TcpListener::bind(("127.0.0.1", reserved.port())).is_err());
        drop(reserved);
    }

    #[test]
    fn test_clones_share_issued_ports() {
        let allocator = PortAllocator::new();
        let other = allocator.clone();
        let a = allocator.allocate().unwrap().release();
        let b = other.allocate().unwrap().release();
        assert_ne!(a, b);
        assert_eq!(allocator.issued_count(), 2);
    }

    #[test]
    fn test_concurrent_allocations_never_repeat() {
        // Arrange
        let allocator = PortAllocator::new();

        // Act
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    let reserved: Vec<_> = (0..4).map(|_| allocator.allocate().unwrap()).collect();
                    reserved.into_iter().map(ReservedPort::release).collect::<Vec<_>>()
                })
            })
            .collect();
        let ports: Vec<u16> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();

        // Assert
        let unique: HashSet<_> = ports.iter().copied().collect();
        assert_eq!(ports.len(), 32);
        assert_eq!(unique.len(), 32);
        assert_eq!(allocator.issued_count(), 32);
    }
}
