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


//! Lock-free metrics for the relay
//!
//! Every update is recorded twice: in the local atomics backing
//! [`ServerMetrics::snapshot`], and through the `metrics` facade under the
//! `chatrelay.*` keys for whatever recorder the host process installs.

use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free server metrics
#[derive(Debug)]
pub struct ServerMetrics {
    // Connection counts
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    closed_connections: AtomicU64,

    // Throughput
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    lines_received: AtomicU64,
    messages_routed: AtomicU64,
    quits: AtomicU64,

    // Errors
    connection_errors: AtomicU64,
    write_failures: AtomicU64,
    protocol_errors: AtomicU64,

    // Timing (stored as nanoseconds)
    total_connection_duration_ns: AtomicU64,

    started_at: Instant,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            closed_connections: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            lines_received: AtomicU64::new(0),
            messages_routed: AtomicU64::new(0),
            quits: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            total_connection_duration_ns: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    // Connection tracking

    /// Record a new connection being registered
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.connections.total").increment(1);
        gauge!("chatrelay.connections.active").increment(1.0);
    }

    /// Record a connection being deregistered
    pub fn connection_closed(&self, duration: Duration) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.closed_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connection_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        gauge!("chatrelay.connections.active").decrement(1.0);
    }

    /// Get the current number of active connections
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get the total number of connections since server start
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    // Throughput tracking

    /// Record bytes read from a client
    pub fn bytes_received(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
        counter!("chatrelay.bytes.received").increment(count);
    }

    /// Record a decoded line
    pub fn line_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.lines.received").increment(1);
    }

    /// Record one broadcast delivered to one recipient
    pub fn message_routed(&self, bytes: u64) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        counter!("chatrelay.messages.routed").increment(1);
        counter!("chatrelay.bytes.sent").increment(bytes);
    }

    /// Record a quit sentinel
    pub fn quit(&self) {
        self.quits.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.quits").increment(1);
    }

    // Error tracking

    /// Record a connection-level I/O error
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.errors.connection").increment(1);
    }

    /// Record a failed recipient write during fan-out
    pub fn write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.errors.write").increment(1);
    }

    /// Record a discarded oversized line
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        counter!("chatrelay.errors.protocol").increment(1);
    }

    // Snapshot

    /// Get a point-in-time view of all metrics
    ///
    /// Counters are read individually, so a snapshot taken while the server
    /// is busy may be slightly skewed between fields.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            closed_connections: self.closed_connections.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            quits: self.quits.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            avg_connection_duration: self.average_connection_duration(),
        }
    }

    /// Mean lifetime of the connections that have closed
    fn average_connection_duration(&self) -> Duration {
        let closed = self.closed_connections.load(Ordering::Relaxed);
        if closed == 0 {
            return Duration::ZERO;
        }
        let total_ns = self.total_connection_duration_ns.load(Ordering::Relaxed);
        Duration::from_nanos(total_ns / closed)
    }
}

/// A snapshot of server metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total connections since server start
    pub total_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Connections closed since server start
    pub closed_connections: u64,
    /// Total bytes read from clients
    pub bytes_received: u64,
    /// Total bytes written to clients
    pub bytes_sent: u64,
    /// Total decoded lines
    pub lines_received: u64,
    /// Total per-recipient deliveries
    pub messages_routed: u64,
    /// Total quit sentinels seen
    pub quits: u64,
    /// Total connection errors
    pub connection_errors: u64,
    /// Total failed recipient writes
    pub write_failures: u64,
    /// Total discarded oversized lines
    pub protocol_errors: u64,
    /// Server uptime
    pub uptime: Duration,
    /// Average lifetime of closed connections
    pub avg_connection_duration: Duration,
}

impl MetricsSnapshot {
    /// Calculate total error count
    pub fn total_errors(&self) -> u64 {
        self.connection_errors + self.write_failures + self.protocol_errors
    }
}
