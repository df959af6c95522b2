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


//! Error types for the chat relay

use crate::types::ConnectionId;
use std::io::ErrorKind;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    /// I/O error from an individual connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The listening socket could not be bound
    #[error("Failed to bind {address}: {source}")]
    Bind {
        /// Requested bind address
        address: SocketAddr,
        /// Underlying cause
        source: std::io::Error,
    },

    /// The listener failed to accept a connection
    #[error("Accept failed: {0}")]
    Accept(std::io::Error),

    /// Connection with the given ID was not found
    #[error("Connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// Connection has been closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// A recipient's outbound queue is full
    #[error("Outbound queue full for {0}")]
    OutboundFull(ConnectionId),

    /// A write did not drain within the configured timeout
    #[error("Write timed out")]
    WriteTimeout,

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Server is not running
    #[error("Server not running")]
    ServerNotRunning,

    /// The dispatcher thread panicked
    #[error("Dispatcher thread panicked")]
    DispatcherPanicked,
}

impl RelayError {
    /// Classify a failed `accept`
    ///
    /// A peer that aborts or resets before it is accepted, or an interrupted
    /// call, only costs that one connection and becomes [`RelayError::Io`].
    /// Anything else means the listener itself failed.
    pub fn from_accept(error: std::io::Error) -> Self {
        match error.kind() {
            ErrorKind::Interrupted | ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                RelayError::Io(error)
            }
            _ => RelayError::Accept(error),
        }
    }

    /// Check if the error terminates the server
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Bind { .. } | RelayError::Accept(_))
    }
}
