//! Registry of live connections.
//!
//! Entries live in a slab arena; an id index gives O(1) lookup by
//! `ConnectionId`. The registry records metadata and current owner only.
//! The `Connection` value itself travels between the reactor and the
//! workers. One mutex guards the map and is never held across I/O.

use crate::error::RegistryError;
use crate::runtime::connection::{Connection, ConnectionId, Direction};
use slab::Slab;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Which thread currently holds a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Idle in the reactor, waiting for readable bytes.
    Reactor,
    /// Being processed or flushed by a worker.
    Worker,
}

/// Snapshot of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Arena slot; stable while the connection is registered.
    pub slot: usize,
    pub peer_addr: Option<SocketAddr>,
    pub direction: Direction,
    pub owner: Owner,
}

struct Inner {
    entries: Slab<ConnectionHandle>,
    index: HashMap<ConnectionId, usize>,
}

/// Thread-safe id -> connection metadata map with a capacity limit.
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Slab::with_capacity(max_connections.min(1024)),
                index: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    /// Allocate an id not yet handed out by this registry.
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `conn`, owned by a worker until the reactor takes it.
    ///
    /// A second registration under the same id is rejected; the existing
    /// entry is left untouched.
    pub fn register(&self, conn: &Connection) -> Result<ConnectionHandle, RegistryError> {
        let mut inner = self.lock();
        if inner.index.contains_key(&conn.id()) {
            return Err(RegistryError::Duplicate(conn.id()));
        }
        if inner.entries.len() >= self.max_connections {
            return Err(RegistryError::Full(self.max_connections));
        }

        let entry = inner.entries.vacant_entry();
        let handle = ConnectionHandle {
            id: conn.id(),
            slot: entry.key(),
            peer_addr: conn.peer_addr(),
            direction: conn.direction(),
            owner: Owner::Worker,
        };
        entry.insert(handle.clone());
        inner.index.insert(conn.id(), handle.slot);
        Ok(handle)
    }

    /// Remove `id`. Returns true if it was registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut inner = self.lock();
        match inner.index.remove(&id) {
            Some(slot) => {
                inner.entries.try_remove(slot);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let inner = self.lock();
        let slot = *inner.index.get(&id)?;
        inner.entries.get(slot).cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().index.contains_key(&id)
    }

    /// Record an ownership transfer. Returns false for unknown ids.
    pub fn set_owner(&self, id: ConnectionId, owner: Owner) -> bool {
        let mut inner = self.lock();
        let Some(&slot) = inner.index.get(&id) else {
            return false;
        };
        match inner.entries.get_mut(slot) {
            Some(entry) => {
                entry.owner = owner;
                true
            }
            None => false,
        }
    }

    /// Ids of all registered connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.lock().index.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
