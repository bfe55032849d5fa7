//! Transaction id allocation.
//!
//! Both peers can initiate calls on a single connection, so each side owns a
//! disjoint half of the id space: the side that dialed the connection
//! allocates odd ids starting at 1, the side that accepted it allocates even
//! ids starting at 2, both incrementing by 2. No coordination between peers
//! is required to avoid collisions.

use std::sync::atomic::{AtomicU32, Ordering};

/// Which end of the connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection; allocates odd transaction ids.
    Initiator,
    /// Accepted the connection; allocates even transaction ids starting
    /// at 2.
    Acceptor,
}

/// Allocates transaction ids for one side of a connection.
#[derive(Debug)]
pub struct TransactionIdAllocator {
    next: AtomicU32,
}

impl TransactionIdAllocator {
    /// Create an allocator for the given [`Role`].
    #[must_use]
    pub fn new(role: Role) -> Self {
        let start = match role {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        };
        Self { next: AtomicU32::new(start) }
    }

    /// Allocate the next id for this side of the connection.
    #[must_use]
    pub fn allocate(&self) -> u32 { self.next.fetch_add(2, Ordering::Relaxed) }
}
