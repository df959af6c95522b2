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


//! Per-client connection state
//!
//! A [`Connection`] pairs the client's identity (id, peer address, display
//! label, lifecycle state) with a strategy-specific transport handle. The
//! readiness dispatcher stores the socket itself in the handle; the
//! completion dispatcher stores the sending side of the connection's
//! outbound queue.

use crate::{ConnectionId, ConnectionInfo, ConnectionState, RelayError, Result, peer_label};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Instant;

/// Delivery seam between the broadcast router and a transport
pub trait Outbound {
    /// Hand one formatted broadcast to the transport
    ///
    /// # Errors
    ///
    /// Any error marks the recipient as failed; the router keeps fanning
    /// out to the remaining recipients and the caller closes this one.
    fn deliver(&mut self, id: ConnectionId, message: &Bytes) -> Result<()>;
}

/// Why a connection was torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent the quit sentinel
    Quit,
    /// The peer closed its end (read returned 0)
    PeerClosed,
    /// Reading from or writing to the socket failed
    Error(String),
    /// A broadcast could not be delivered to this client
    WriteFailed,
    /// Closed on request through the server handle
    Disconnected,
    /// The server is shutting down
    Shutdown,
}

impl CloseReason {
    /// Check if the teardown was caused by an I/O failure
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_) | Self::WriteFailed)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quit => write!(f, "quit"),
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Error(e) => write!(f, "error: {e}"),
            Self::WriteFailed => write!(f, "write failed"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A registered client connection
#[derive(Debug)]
pub struct Connection<H> {
    id: ConnectionId,
    peer_addr: SocketAddr,
    label: String,
    state: ConnectionState,
    created_at: Instant,
    handle: H,
}

impl<H> Connection<H> {
    /// Wrap a freshly accepted transport handle
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, handle: H) -> Self {
        Self {
            id,
            peer_addr,
            label: peer_label(peer_addr),
            state: ConnectionState::Connecting,
            created_at: Instant::now(),
            handle,
        }
    }

    /// Get the connection ID
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get the display label used in broadcasts
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Get the lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get when the connection was accepted
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Borrow the transport handle
    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// Mutably borrow the transport handle
    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    /// Consume the connection, releasing its transport handle to the caller
    pub fn into_handle(mut self) -> H {
        self.state = ConnectionState::Closed;
        self.handle
    }

    /// Get a snapshot of the connection
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            label: self.label.clone(),
            peer_addr: self.peer_addr,
            state: self.state,
            created_at: self.created_at,
        }
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }
}

impl<H: Outbound> Connection<H> {
    /// Deliver a formatted broadcast to this connection
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ConnectionClosed`] once the connection has been
    /// deregistered, or the transport's delivery error.
    pub fn deliver(&mut self, message: &Bytes) -> Result<()> {
        if self.state.is_terminal() {
            return Err(RelayError::ConnectionClosed);
        }
        self.handle.deliver(self.id, message)
    }
}
