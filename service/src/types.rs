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


//! Core types shared by both dispatch strategies

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Unique identifier for a connection (monotonically increasing, never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new connection ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state
///
/// A connection is `Connecting` until the registry accepts it, `Active`
/// while it is registered, `Closing` once it has been deregistered and its
/// handle is being released, and `Closed` afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted but not yet registered
    Connecting,
    /// Registered and eligible for fan-out
    Active,
    /// Deregistered, transport handle being released
    Closing,
    /// Transport handle released
    Closed,
}

impl ConnectionState {
    /// Check if the connection is in a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Display identity of a peer, `client[<remote-port>]`
pub fn peer_label(addr: SocketAddr) -> String {
    format!("client[{}]", addr.port())
}

/// Connection information snapshot
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection ID
    pub id: ConnectionId,
    /// Display label used in broadcasts
    pub label: String,
    /// Peer address
    pub peer_addr: SocketAddr,
    /// Current state
    pub state: ConnectionState,
    /// When the connection was accepted
    pub created_at: Instant,
}

/// Server snapshot for non-blocking debug information
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    /// Number of registered connections
    pub active_connections: usize,
    /// Total connections since server start
    pub total_connections: u64,
    /// Server bind address
    pub bind_address: SocketAddr,
    /// Dispatch strategy in use
    pub strategy: crate::DispatchStrategy,
    /// Server uptime
    pub uptime: Duration,
}

impl fmt::Display for ServerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RelayServer {{ strategy: {}, active: {}, total: {}, addr: {}, uptime: {:?} }}",
            self.strategy,
            self.active_connections,
            self.total_connections,
            self.bind_address,
            self.uptime
        )
    }
}
