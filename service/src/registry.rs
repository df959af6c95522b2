//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//


//! Connection registry
//!
//! The registry is the only state shared across connections. It owns every
//! active [`Connection`] and is responsible for:
//! - Allocating connection IDs
//! - Registering and deregistering connections (with lifecycle transitions)
//! - Fan-out iteration that skips the sender and tolerates failing recipients
//!
//! Access is serialised by the underlying [`DashMap`]. A caller must not hold
//! a reference obtained from [`ConnectionRegistry::with_connection`] while
//! calling any other registry method from the same thread.

use crate::{Connection, ConnectionId, ConnectionInfo, ConnectionState, Result, ServerMetrics};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Result of a fan-out over the registry
#[derive(Debug, Clone, Default)]
pub struct FanOut {
    /// Number of recipients attempted
    pub attempted: usize,
    /// Number of successful deliveries
    pub delivered: usize,
    /// Recipients whose delivery failed, with the error message
    pub failed: Vec<(ConnectionId, String)>,
}

impl FanOut {
    /// IDs of the recipients that must be closed
    pub fn failed_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.failed.iter().map(|(id, _)| *id)
    }
}

/// Registry of active connections
pub struct ConnectionRegistry<H> {
    connections: DashMap<ConnectionId, Connection<H>>,
    next_id: AtomicU64,
    metrics: Arc<ServerMetrics>,
}

impl<H> ConnectionRegistry<H> {
    /// Create an empty registry
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Allocate the next connection ID
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a connection, marking it active
    ///
    /// # Errors
    ///
    /// Returns the connection back if its ID is already registered.
    pub fn add(&self, mut connection: Connection<H>) -> std::result::Result<(), Connection<H>> {
        match self.connections.entry(connection.id()) {
            Entry::Occupied(_) => Err(connection),
            Entry::Vacant(slot) => {
                connection.set_state(ConnectionState::Active);
                debug!(connection_id = %connection.id(), label = connection.label(), "Registered");
                slot.insert(connection);
                self.metrics.connection_opened();
                Ok(())
            }
        }
    }

    /// Deregister a connection
    ///
    /// The connection is returned in the `Closing` state so the caller can
    /// release its transport handle. Removing an ID that is not registered
    /// is a no-op returning `None`.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection<H>> {
        let (_, mut connection) = self.connections.remove(&id)?;
        connection.set_state(ConnectionState::Closing);
        self.metrics
            .connection_closed(connection.created_at().elapsed());
        debug!(connection_id = %id, "Deregistered");
        Some(connection)
    }

    /// Check whether a connection is registered
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Get the number of registered connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Get all registered connection IDs
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Get snapshots of all registered connections
    pub fn infos(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Run `f` against one registered connection
    pub fn with_connection<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection<H>) -> R,
    ) -> Option<R> {
        self.connections.get_mut(&id).map(|mut entry| f(&mut entry))
    }

    /// Apply `f` to every registered connection except `sender`
    ///
    /// A failing recipient is recorded in the returned [`FanOut`] and the
    /// iteration continues. Nothing is removed here; the caller closes the
    /// failed recipients once the fan-out has finished.
    pub fn for_each_except<F>(&self, sender: ConnectionId, mut f: F) -> FanOut
    where
        F: FnMut(&mut Connection<H>) -> Result<()>,
    {
        let mut fan_out = FanOut::default();
        for mut entry in self.connections.iter_mut() {
            if *entry.key() == sender {
                continue;
            }
            fan_out.attempted += 1;
            match f(entry.value_mut()) {
                Ok(()) => fan_out.delivered += 1,
                Err(e) => {
                    trace!(connection_id = %entry.key(), error = %e, "Recipient failed");
                    fan_out.failed.push((*entry.key(), e.to_string()));
                }
            }
        }
        fan_out
    }

    /// Deregister every connection, returning them for release
    pub fn drain(&self) -> Vec<Connection<H>> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }
}

impl<H> std::fmt::Debug for ConnectionRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}
