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


//! Server configuration

use crate::{RelayError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default listening port
pub const DEFAULT_PORT: u16 = 8888;

/// How the server drives connection I/O
///
/// Both strategies produce identical client-visible behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchStrategy {
    /// One thread multiplexing every socket through a readiness poll
    #[default]
    Readiness,
    /// Per-connection completion state machines on a bounded worker pool
    Completion,
}

impl fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Readiness => write!(f, "readiness"),
            Self::Completion => write!(f, "completion"),
        }
    }
}

impl FromStr for DispatchStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "readiness" | "poll" => Ok(Self::Readiness),
            "completion" | "async" => Ok(Self::Completion),
            other => Err(format!("unknown dispatch strategy '{other}'")),
        }
    }
}

/// Server configuration
///
/// Use the builder pattern methods to customize the configuration.
///
/// # Example
///
/// ```
/// use chatrelay_service::{DispatchStrategy, ServerConfig};
/// use std::time::Duration;
///
/// let config = ServerConfig::default()
///     .with_strategy(DispatchStrategy::Completion)
///     .with_worker_threads(4)
///     .with_write_timeout(Duration::from_secs(2));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: SocketAddr,

    /// Dispatch strategy
    pub strategy: DispatchStrategy,

    /// Worker pool size for the completion strategy
    pub worker_threads: usize,

    /// Bytes requested from the socket per read
    pub read_chunk_size: usize,

    /// Maximum reads drained from one connection per readiness iteration
    ///
    /// Connections cut off by this bound are revisited on the next
    /// iteration so a chatty client cannot starve the others.
    pub max_reads_per_event: usize,

    /// Maximum bytes buffered for a single unterminated line
    pub max_line_length: usize,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Outbound chunks queued per connection (completion strategy)
    pub outbound_queue_capacity: usize,

    /// Timeout for a single outbound write
    ///
    /// A recipient that cannot accept a message within this duration is
    /// treated as failed and disconnected.
    pub write_timeout: Duration,

    /// Readiness events fetched per poll
    pub poll_capacity: usize,

    /// Timeout for graceful shutdown
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            strategy: DispatchStrategy::default(),
            worker_threads: 8,
            read_chunk_size: crate::READ_CHUNK_SIZE,
            max_reads_per_event: 16,
            max_line_length: 64 * 1024,
            max_connections: 1000,
            outbound_queue_capacity: 256,
            write_timeout: Duration::from_secs(10),
            poll_capacity: 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the given bind address
    ///
    /// All other settings will use their default values.
    pub fn new(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            ..Default::default()
        }
    }

    /// Set the dispatch strategy
    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the completion worker pool size
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the per-read chunk size
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    /// Set the readiness drain bound
    pub fn with_max_reads_per_event(mut self, reads: usize) -> Self {
        self.max_reads_per_event = reads;
        self
    }

    /// Set the maximum unterminated line length
    pub fn with_max_line_length(mut self, length: usize) -> Self {
        self.max_line_length = length;
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-connection outbound queue capacity
    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    /// Set the write timeout duration
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the readiness event capacity
    pub fn with_poll_capacity(mut self, capacity: usize) -> Self {
        self.poll_capacity = capacity;
        self
    }

    /// Set the shutdown timeout duration
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("worker_threads", self.worker_threads),
            ("read_chunk_size", self.read_chunk_size),
            ("max_reads_per_event", self.max_reads_per_event),
            ("max_line_length", self.max_line_length),
            ("max_connections", self.max_connections),
            ("outbound_queue_capacity", self.outbound_queue_capacity),
            ("poll_capacity", self.poll_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RelayError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.write_timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "write_timeout must be greater than 0".to_string(),
            ));
        }

        if self.shutdown_timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "shutdown_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
