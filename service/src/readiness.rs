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


//! Readiness-based dispatcher
//!
//! One thread owns a mio [`Poll`] containing the listener, a [`Waker`] for
//! control messages, and every accepted connection. Each iteration waits for
//! readiness, then for every ready handle:
//! - the listener accepts until it would block and registers each new socket
//! - a connection drains its available bytes (bounded by
//!   `max_reads_per_event`), frames them into lines, and routes each line
//!
//! Connections cut off by the drain bound are revisited on the next
//! iteration with a zero-timeout poll, since edge-triggered readiness will
//! not fire again for bytes that are already buffered in the kernel.
//!
//! # Known limitation
//!
//! Broadcast writes are performed inline with a write-until-drained loop on
//! the dispatch thread. A recipient whose socket buffer is full stalls every
//! other connection until its write drains or `write_timeout` expires, at
//! which point that recipient is closed.
//!
//! The stalled write runs inside the registry fan-out, so the registry
//! shard holding that recipient stays locked for the same period. Calls
//! from other threads that touch that shard, such as
//! `ServerHandle::connection_count` or `ServerHandle::disconnect`, block
//! until the write completes or times out.

use crate::{
    BroadcastRouter, CloseReason, Connection, ConnectionId, ConnectionRegistry, FanOut,
    LineFramer, Outbound, RelayError, Result, RouteDecision, ServerConfig, ServerMetrics,
};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Pause between write attempts against a full socket buffer
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(1);

fn token_for(id: ConnectionId) -> Token {
    Token(id.as_u64() as usize + 1)
}

fn id_for(token: Token) -> ConnectionId {
    ConnectionId::new((token.0 - 1) as u64)
}

/// Control messages for the dispatch thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Close one connection
    Disconnect(ConnectionId),
    /// Close every connection and the listener, then return from `run`
    Shutdown,
}

/// Cross-thread sender of [`ControlMessage`]s that wakes the poll
#[derive(Debug, Clone)]
pub struct ReadinessControl {
    sender: mpsc::Sender<ControlMessage>,
    waker: Arc<Waker>,
}

impl ReadinessControl {
    /// Queue a control message and wake the dispatcher
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ServerNotRunning`] once the dispatcher is gone.
    pub fn send(&self, message: ControlMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| RelayError::ServerNotRunning)?;
        self.waker.wake()?;
        Ok(())
    }
}

/// Transport handle of a readiness-driven connection
#[derive(Debug)]
pub struct ReadyHandle {
    stream: TcpStream,
    framer: LineFramer,
    write_timeout: Duration,
}

impl ReadyHandle {
    fn new(stream: TcpStream, framer: LineFramer, write_timeout: Duration) -> Self {
        Self {
            stream,
            framer,
            write_timeout,
        }
    }
}

impl Outbound for ReadyHandle {
    fn deliver(&mut self, _id: ConnectionId, message: &Bytes) -> Result<()> {
        write_until_drained(&mut self.stream, message, self.write_timeout)
    }
}

/// Write all of `buf` to a non-blocking socket, retrying while it would block
fn write_until_drained<W: Write>(stream: &mut W, mut buf: &[u8], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero).into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(RelayError::WriteTimeout);
                }
                std::thread::sleep(WRITE_RETRY_INTERVAL);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// How a drain pass over one connection ended
#[derive(Debug)]
enum DrainEnd {
    /// Socket has no more data for now
    WouldBlock,
    /// Drain bound reached with data possibly remaining
    Bounded,
    /// Connection is finished
    Closed(CloseReason),
}

#[derive(Debug)]
struct Drained {
    label: String,
    lines: Vec<String>,
    discarded: u64,
    end: DrainEnd,
}

/// Single-threaded readiness dispatcher
pub struct ReadinessDispatcher {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry<ReadyHandle>>,
    router: BroadcastRouter,
    metrics: Arc<ServerMetrics>,
    config: ServerConfig,
    waker: Arc<Waker>,
    control_tx: mpsc::Sender<ControlMessage>,
    control_rx: mpsc::Receiver<ControlMessage>,
    pending: Vec<ConnectionId>,
    read_buf: Vec<u8>,
}

impl ReadinessDispatcher {
    /// Bind the listener and prepare the poll
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Bind`] if the address cannot be bound, or an I/O
    /// error if the poll cannot be created.
    pub fn bind(config: ServerConfig, metrics: Arc<ServerMetrics>) -> Result<Self> {
        let mut listener =
            TcpListener::bind(config.bind_address).map_err(|source| RelayError::Bind {
                address: config.bind_address,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (control_tx, control_rx) = mpsc::channel();

        info!(%local_addr, "Readiness dispatcher bound");

        Ok(Self {
            poll,
            listener,
            local_addr,
            registry: Arc::new(ConnectionRegistry::new(metrics.clone())),
            router: BroadcastRouter::new(metrics.clone()),
            metrics,
            read_buf: vec![0; config.read_chunk_size],
            config,
            waker,
            control_tx,
            control_rx,
            pending: Vec::new(),
        })
    }

    /// Get the bound listener address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the connection registry
    pub fn registry(&self) -> Arc<ConnectionRegistry<ReadyHandle>> {
        self.registry.clone()
    }

    /// Get a control channel usable from other threads
    pub fn control(&self) -> ReadinessControl {
        ReadinessControl {
            sender: self.control_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Run the dispatch loop on the current thread
    ///
    /// Returns after a [`ControlMessage::Shutdown`], or with an error when the
    /// listener fails. Every connection and the listener are released on
    /// both paths.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Accept`] on listener failure, or an I/O error if
    /// the poll itself fails.
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.config.poll_capacity);
        let result = self.event_loop(&mut events);

        self.close_all();
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "Failed to deregister listener");
        }
        info!(local_addr = %self.local_addr, "Readiness dispatcher stopped");

        result
    }

    fn event_loop(&mut self, events: &mut Events) -> Result<()> {
        loop {
            let timeout = if self.pending.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            if let Err(e) = self.poll.poll(events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            let revisit = std::mem::take(&mut self.pending);
            let mut serviced = HashSet::new();

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready()?,
                    WAKER => {}
                    token => {
                        let id = id_for(token);
                        if serviced.insert(id) {
                            self.connection_ready(id);
                        }
                    }
                }
            }

            for id in revisit {
                if serviced.insert(id) {
                    self.connection_ready(id);
                }
            }

            if !self.process_control() {
                return Ok(());
            }
        }
    }

    /// Apply queued control messages; returns false on shutdown
    fn process_control(&mut self) -> bool {
        let messages: Vec<_> = self.control_rx.try_iter().collect();
        for message in messages {
            match message {
                ControlMessage::Disconnect(id) => self.close(id, CloseReason::Disconnected),
                ControlMessage::Shutdown => {
                    info!("Shutdown requested");
                    return false;
                }
            }
        }
        true
    }

    fn accept_ready(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.register(stream, peer_addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    let error = RelayError::from_accept(e);
                    if error.is_fatal() {
                        error!(%error, local_addr = %self.local_addr, "Listener failed");
                        self.metrics.connection_error();
                        return Err(error);
                    }
                    warn!(%error, "Transient accept error");
                }
            }
        }
    }

    fn register(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) {
        if self.registry.len() >= self.config.max_connections {
            warn!(
                %peer_addr,
                limit = self.config.max_connections,
                "Connection limit reached, rejecting"
            );
            self.metrics.connection_error();
            return;
        }

        let id = self.registry.next_id();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token_for(id), Interest::READABLE)
        {
            warn!(%peer_addr, error = %e, "Failed to register connection");
            self.metrics.connection_error();
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let framer = LineFramer::with_max_line_length(self.config.max_line_length);
        let handle = ReadyHandle::new(stream, framer, self.config.write_timeout);
        let connection = Connection::new(id, peer_addr, handle);
        let label = connection.label().to_string();

        if let Err(mut rejected) = self.registry.add(connection) {
            let _ = self
                .poll
                .registry()
                .deregister(&mut rejected.handle_mut().stream);
            return;
        }
        info!(connection_id = %id, %peer_addr, %label, "Client connected");
    }

    #[instrument(skip_all, fields(connection_id = %id))]
    fn connection_ready(&mut self, id: ConnectionId) {
        let Some(drained) = self.drain(id) else {
            // Closed earlier in this iteration
            return;
        };
        for _ in 0..drained.discarded {
            self.metrics.protocol_error();
        }

        for line in drained.lines {
            match self.router.dispatch(&*self.registry, id, &drained.label, line) {
                RouteDecision::Routed(fan_out) => self.close_failed(&fan_out),
                RouteDecision::Quit => {
                    self.close(id, CloseReason::Quit);
                    return;
                }
                RouteDecision::Ignored => {}
            }
        }

        match drained.end {
            DrainEnd::WouldBlock => {}
            DrainEnd::Bounded => self.pending.push(id),
            DrainEnd::Closed(reason) => self.close(id, reason),
        }
    }

    /// Read up to `max_reads_per_event` chunks from one connection
    fn drain(&mut self, id: ConnectionId) -> Option<Drained> {
        let max_reads = self.config.max_reads_per_event;
        let read_buf = &mut self.read_buf;
        let metrics = &self.metrics;

        self.registry.with_connection(id, |connection| {
            let label = connection.label().to_string();
            let handle = connection.handle_mut();
            let mut lines = Vec::new();
            let mut end = DrainEnd::Bounded;

            for _ in 0..max_reads {
                match handle.stream.read(read_buf) {
                    Ok(0) => {
                        end = DrainEnd::Closed(CloseReason::PeerClosed);
                        break;
                    }
                    Ok(n) => {
                        metrics.bytes_received(n as u64);
                        lines.extend(handle.framer.feed(&read_buf[..n]));
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        end = DrainEnd::WouldBlock;
                        break;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        end = DrainEnd::Closed(CloseReason::Error(e.to_string()));
                        break;
                    }
                }
            }

            Drained {
                label,
                lines,
                discarded: handle.framer.take_discarded(),
                end,
            }
        })
    }

    fn close_failed(&mut self, fan_out: &FanOut) {
        for id in fan_out.failed_ids() {
            self.close(id, CloseReason::WriteFailed);
        }
    }

    /// Deregister, then release the socket
    fn close(&mut self, id: ConnectionId, reason: CloseReason) {
        let Some(connection) = self.registry.remove(id) else {
            return;
        };
        let label = connection.label().to_string();
        let mut handle = connection.into_handle();
        if let Err(e) = self.poll.registry().deregister(&mut handle.stream) {
            debug!(connection_id = %id, error = %e, "Failed to deregister connection");
        }
        if reason.is_error() {
            self.metrics.connection_error();
        }
        info!(connection_id = %id, %label, %reason, "Client disconnected");
    }

    fn close_all(&mut self) {
        for connection in self.registry.drain() {
            let id = connection.id();
            let mut handle = connection.into_handle();
            let _ = self.poll.registry().deregister(&mut handle.stream);
            info!(connection_id = %id, reason = %CloseReason::Shutdown, "Client disconnected");
        }
        self.pending.clear();
    }
}

impl std::fmt::Debug for ReadinessDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessDispatcher")
            .field("local_addr", &self.local_addr)
            .field("connection_count", &self.registry.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Writer that accepts a few bytes at a time and sometimes would block
    struct Trickle {
        written: Vec<u8>,
        calls: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(3);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Writer whose buffer never drains
    struct Stuck;

    impl Write for Stuck {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(ErrorKind::WouldBlock.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_token_mapping() {
        let id = ConnectionId::new(1);
        assert_eq!(token_for(id), Token(2));
        assert_eq!(id_for(token_for(id)), id);
        assert_ne!(token_for(id), LISTENER);
        assert_ne!(token_for(id), WAKER);
    }

    #[test]
    fn test_write_until_drained_handles_partial_writes() {
        let mut writer = Trickle {
            written: Vec::new(),
            calls: 0,
        };
        write_until_drained(&mut writer, b"client[1]: hello\n", Duration::from_secs(1)).unwrap();
        assert_eq!(writer.written, b"client[1]: hello\n");
    }

    #[test]
    fn test_write_until_drained_times_out() {
        let err = write_until_drained(&mut Stuck, b"x", Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, RelayError::WriteTimeout));
    }

    #[test]
    fn test_write_zero_is_an_error() {
        let mut full = Cursor::new([0u8; 0]);
        let err = write_until_drained(&mut full, b"x", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RelayError::Io(ref e) if e.kind() == ErrorKind::WriteZero));
    }

    #[test]
    fn test_bind_reports_address() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let dispatcher = ReadinessDispatcher::bind(config, Arc::new(ServerMetrics::new())).unwrap();

        assert_ne!(dispatcher.local_addr().port(), 0);
        assert!(dispatcher.registry().is_empty());
    }

    #[test]
    fn test_shutdown_control_stops_run() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let dispatcher = ReadinessDispatcher::bind(config, Arc::new(ServerMetrics::new())).unwrap();
        let control = dispatcher.control();

        let thread = std::thread::spawn(move || dispatcher.run());
        control.send(ControlMessage::Shutdown).unwrap();

        thread.join().unwrap().unwrap();
        assert!(matches!(
            control.send(ControlMessage::Shutdown),
            Err(RelayError::ServerNotRunning)
        ));
    }
}
