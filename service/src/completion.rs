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


//! Completion-based dispatcher
//!
//! Runs on a multi-threaded tokio runtime. The accept loop spawns one
//! [`ConnectionTask`] per client and immediately goes back to accepting.
//! Each task is an explicit state machine:
//!
//! ```text
//! AwaitingRead ──read n──▶ Decoding(n) ──▶ AwaitingRead
//!      │                                       ▲
//!      └──queued chunk──▶ AwaitingWrite(chunk) ─┘ (queue drained)
//!
//! any state ──eof/error/quit/cancel──▶ Closing(reason)
//! ```
//!
//! Broadcasts never write to a recipient's socket directly. They are pushed
//! onto the recipient's bounded outbound queue and written by the
//! recipient's own task, so chunks leave in enqueue order and a chunk is
//! only dropped from the queue once it is fully written.

use crate::{
    BroadcastRouter, CloseReason, Connection, ConnectionId, ConnectionRegistry, FanOut,
    LineFramer, Outbound, RelayError, Result, RouteDecision, ServerConfig, ServerMetrics,
};
use bytes::Bytes;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Transport handle of a completion-driven connection
#[derive(Debug, Clone)]
pub struct QueueHandle {
    sender: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl QueueHandle {
    /// Stop the connection's task
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Outbound for QueueHandle {
    fn deliver(&mut self, id: ConnectionId, message: &Bytes) -> Result<()> {
        self.sender
            .try_send(message.clone())
            .map_err(|e| match e {
                TrySendError::Full(_) => RelayError::OutboundFull(id),
                TrySendError::Closed(_) => RelayError::ConnectionClosed,
            })
    }
}

/// State shared by the accept loop, every connection task, and controls
#[derive(Debug)]
struct Shared {
    registry: Arc<ConnectionRegistry<QueueHandle>>,
    router: BroadcastRouter,
    metrics: Arc<ServerMetrics>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl Shared {
    /// Deregister a connection and stop its task
    ///
    /// Safe to call for a connection whose task is mid-flight on another
    /// worker, or that has already been released.
    fn release(&self, id: ConnectionId, reason: &CloseReason) -> bool {
        let Some(connection) = self.registry.remove(id) else {
            return false;
        };
        connection.handle().cancel();
        if reason.is_error() {
            self.metrics.connection_error();
        }
        info!(connection_id = %id, label = connection.label(), %reason, "Client disconnected");
        true
    }

    fn release_failed(&self, fan_out: &FanOut) {
        for id in fan_out.failed_ids() {
            self.release(id, &CloseReason::WriteFailed);
        }
    }
}

/// Cloneable control for a running [`CompletionDispatcher`]
#[derive(Debug, Clone)]
pub struct CompletionControl {
    shared: Arc<Shared>,
}

impl CompletionControl {
    /// Close one connection
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ConnectionNotFound`] if `id` is not registered.
    pub fn disconnect(&self, id: ConnectionId) -> Result<()> {
        if self.shared.release(id, &CloseReason::Disconnected) {
            Ok(())
        } else {
            Err(RelayError::ConnectionNotFound(id))
        }
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Check whether shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

/// Accept loop plus per-connection tasks on a tokio runtime
#[derive(Debug)]
pub struct CompletionDispatcher {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    tracker: TaskTracker,
}

impl CompletionDispatcher {
    /// Bind the listener
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Bind`] if the address cannot be bound.
    pub async fn bind(config: ServerConfig, metrics: Arc<ServerMetrics>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_address)
            .await
            .map_err(|source| RelayError::Bind {
                address: config.bind_address,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(%local_addr, "Completion dispatcher bound");

        let shared = Arc::new(Shared {
            registry: Arc::new(ConnectionRegistry::new(metrics.clone())),
            router: BroadcastRouter::new(metrics.clone()),
            metrics,
            config,
            shutdown: CancellationToken::new(),
        });

        Ok(Self {
            listener,
            local_addr,
            shared,
            tracker: TaskTracker::new(),
        })
    }

    /// Get the bound listener address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the connection registry
    pub fn registry(&self) -> Arc<ConnectionRegistry<QueueHandle>> {
        self.shared.registry.clone()
    }

    /// Get a control usable from any thread
    pub fn control(&self) -> CompletionControl {
        CompletionControl {
            shared: self.shared.clone(),
        }
    }

    /// Accept connections until shutdown or listener failure
    ///
    /// On return the listener is closed, every connection has been released,
    /// and connection tasks have finished or `shutdown_timeout` has passed.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Accept`] when the listener fails.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            local_addr,
            shared,
            tracker,
        } = self;

        let result = accept_loop(&listener, &shared, &tracker).await;
        drop(listener);

        shared.shutdown.cancel();
        for connection in shared.registry.drain() {
            connection.handle().cancel();
            info!(
                connection_id = %connection.id(),
                reason = %CloseReason::Shutdown,
                "Client disconnected"
            );
        }

        tracker.close();
        if timeout(shared.config.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = tracker.len(),
                "Connection tasks did not finish before shutdown timeout"
            );
        }
        info!(%local_addr, "Completion dispatcher stopped");

        result
    }
}

async fn accept_loop(
    listener: &TcpListener,
    shared: &Arc<Shared>,
    tracker: &TaskTracker,
) -> Result<()> {
    loop {
        select! {
            biased;

            _ = shared.shutdown.cancelled() => {
                info!("Shutdown requested");
                return Ok(());
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => spawn_connection(shared, tracker, stream, peer_addr),
                Err(e) => {
                    let error = RelayError::from_accept(e);
                    if error.is_fatal() {
                        error!(%error, "Listener failed");
                        shared.metrics.connection_error();
                        return Err(error);
                    }
                    warn!(%error, "Transient accept error");
                }
            },
        }
    }
}

fn spawn_connection(
    shared: &Arc<Shared>,
    tracker: &TaskTracker,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let config = &shared.config;
    if shared.registry.len() >= config.max_connections {
        warn!(
            %peer_addr,
            limit = config.max_connections,
            "Connection limit reached, rejecting"
        );
        shared.metrics.connection_error();
        return;
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer_addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let id = shared.registry.next_id();
    let (sender, outbound) = mpsc::channel(config.outbound_queue_capacity);
    let cancel = shared.shutdown.child_token();
    let connection = Connection::new(
        id,
        peer_addr,
        QueueHandle {
            sender,
            cancel: cancel.clone(),
        },
    );
    let label = connection.label().to_string();
    if shared.registry.add(connection).is_err() {
        return;
    }
    info!(connection_id = %id, %peer_addr, %label, "Client connected");

    let task = ConnectionTask {
        id,
        label,
        stream,
        framer: LineFramer::with_max_line_length(config.max_line_length),
        read_buf: vec![0; config.read_chunk_size],
        outbound,
        cancel,
        shared: shared.clone(),
        writes_in_turn: 0,
        prefer_read: false,
    };
    tracker.spawn(task.run().instrument(info_span!("connection", connection_id = %id)));
}

/// Queued chunks written back to back before the socket is read again
const MAX_WRITES_PER_TURN: usize = 16;

/// Where a connection task is in its read/decode/write cycle
#[derive(Debug)]
enum TaskState {
    /// Waiting for socket data, a queued chunk, or cancellation
    AwaitingRead,
    /// `n` fresh bytes sit at the front of the read buffer
    Decoding(usize),
    /// Writing one queued chunk
    AwaitingWrite(Bytes),
    /// Finished
    Closing(CloseReason),
}

/// Drives one connection from accept to release
struct ConnectionTask {
    id: ConnectionId,
    label: String,
    stream: TcpStream,
    framer: LineFramer,
    read_buf: Vec<u8>,
    outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    /// Chunks written since the socket was last read
    writes_in_turn: usize,
    /// Check the socket for input before the outbound queue on the next read
    prefer_read: bool,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut state = TaskState::AwaitingRead;
        let reason = loop {
            state = match state {
                TaskState::AwaitingRead => self.await_read().await,
                TaskState::Decoding(n) => self.decode(n),
                TaskState::AwaitingWrite(chunk) => self.write(chunk).await,
                TaskState::Closing(reason) => break reason,
            };
        };
        self.close(reason).await;
    }

    fn cancelled_reason(&self) -> CloseReason {
        if self.shared.shutdown.is_cancelled() {
            CloseReason::Shutdown
        } else {
            CloseReason::Disconnected
        }
    }

    async fn await_read(&mut self) -> TaskState {
        if std::mem::take(&mut self.prefer_read) {
            match self.stream.try_read(&mut self.read_buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                read => return self.on_read(read),
            }
        }

        select! {
            biased;

            _ = self.cancel.cancelled() => TaskState::Closing(self.cancelled_reason()),

            chunk = self.outbound.recv() => match chunk {
                Some(chunk) => TaskState::AwaitingWrite(chunk),
                None => TaskState::Closing(CloseReason::Disconnected),
            },

            read = self.stream.read(&mut self.read_buf) => self.on_read(read),
        }
    }

    fn on_read(&mut self, read: std::io::Result<usize>) -> TaskState {
        self.writes_in_turn = 0;
        match read {
            Ok(0) => TaskState::Closing(CloseReason::PeerClosed),
            Ok(n) => {
                self.shared.metrics.bytes_received(n as u64);
                TaskState::Decoding(n)
            }
            Err(e) => TaskState::Closing(CloseReason::Error(e.to_string())),
        }
    }

    fn decode(&mut self, n: usize) -> TaskState {
        let lines: Vec<String> = self.framer.feed(&self.read_buf[..n]).collect();
        for _ in 0..self.framer.take_discarded() {
            self.shared.metrics.protocol_error();
        }

        let shared = &self.shared;
        for line in lines {
            match shared
                .router
                .dispatch(&*shared.registry, self.id, &self.label, line)
            {
                RouteDecision::Routed(fan_out) => shared.release_failed(&fan_out),
                RouteDecision::Quit => return TaskState::Closing(CloseReason::Quit),
                RouteDecision::Ignored => {}
            }
        }
        TaskState::AwaitingRead
    }

    async fn write(&mut self, chunk: Bytes) -> TaskState {
        let write_timeout = self.shared.config.write_timeout;
        select! {
            biased;

            _ = self.cancel.cancelled() => TaskState::Closing(self.cancelled_reason()),

            written = timeout(write_timeout, self.stream.write_all(&chunk)) => match written {
                Ok(Ok(())) => self.after_write(),
                Ok(Err(e)) => TaskState::Closing(CloseReason::Error(e.to_string())),
                Err(_) => {
                    self.shared.metrics.write_failure();
                    TaskState::Closing(CloseReason::WriteFailed)
                }
            },
        }
    }

    /// Continue with the next queued chunk until the write burst is used up
    fn after_write(&mut self) -> TaskState {
        self.writes_in_turn += 1;
        if self.writes_in_turn >= MAX_WRITES_PER_TURN {
            self.writes_in_turn = 0;
            self.prefer_read = true;
            return TaskState::AwaitingRead;
        }
        match self.outbound.try_recv() {
            Ok(next) => TaskState::AwaitingWrite(next),
            Err(_) => TaskState::AwaitingRead,
        }
    }

    /// Deregister first, then shut the socket
    async fn close(mut self, reason: CloseReason) {
        self.shared.release(self.id, &reason);
        self.outbound.close();
        if let Err(e) = self.stream.shutdown().await {
            debug!(connection_id = %self.id, error = %e, "Socket shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (QueueHandle, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            QueueHandle {
                sender,
                cancel: CancellationToken::new(),
            },
            receiver,
        )
    }

    #[test]
    fn test_queue_handle_preserves_order() {
        let id = ConnectionId::new(1);
        let (mut handle, mut receiver) = handle(4);

        handle.deliver(id, &Bytes::from_static(b"one\n")).unwrap();
        handle.deliver(id, &Bytes::from_static(b"two\n")).unwrap();

        assert_eq!(receiver.try_recv().unwrap(), Bytes::from_static(b"one\n"));
        assert_eq!(receiver.try_recv().unwrap(), Bytes::from_static(b"two\n"));
    }

    #[test]
    fn test_queue_handle_full_is_failure() {
        let id = ConnectionId::new(7);
        let (mut handle, _receiver) = handle(1);

        handle.deliver(id, &Bytes::from_static(b"one\n")).unwrap();
        let err = handle.deliver(id, &Bytes::from_static(b"two\n")).unwrap_err();
        assert!(matches!(err, RelayError::OutboundFull(failed) if failed == id));
    }

    #[test]
    fn test_queue_handle_closed_is_failure() {
        let (mut handle, receiver) = handle(1);
        drop(receiver);

        let err = handle
            .deliver(ConnectionId::new(1), &Bytes::from_static(b"x\n"))
            .unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed));
    }

    /// Task for one accepted loopback connection, plus the client side
    async fn task_pair(
        dispatcher: &CompletionDispatcher,
    ) -> (ConnectionTask, mpsc::Sender<Bytes>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (sender, outbound) = mpsc::channel(64);

        let task = ConnectionTask {
            id: ConnectionId::new(1),
            label: "client[1]".to_string(),
            stream,
            framer: LineFramer::new(),
            read_buf: vec![0; crate::READ_CHUNK_SIZE],
            outbound,
            cancel: CancellationToken::new(),
            shared: dispatcher.shared.clone(),
            writes_in_turn: 0,
            prefer_read: false,
        };
        (task, sender, client)
    }

    #[tokio::test]
    async fn test_write_burst_yields_to_reads() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let dispatcher = CompletionDispatcher::bind(config, Arc::new(ServerMetrics::new()))
            .await
            .unwrap();
        let (mut task, sender, mut client) = task_pair(&dispatcher).await;

        for _ in 0..MAX_WRITES_PER_TURN + 4 {
            sender.try_send(Bytes::from_static(b"x: y\n")).unwrap();
        }
        client.write_all(b"hi\n").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        for _ in 1..MAX_WRITES_PER_TURN {
            assert!(matches!(task.after_write(), TaskState::AwaitingWrite(_)));
        }
        assert!(matches!(task.after_write(), TaskState::AwaitingRead));

        // Chunks are still queued, but pending input is read first
        assert!(matches!(task.await_read().await, TaskState::Decoding(3)));
        assert!(matches!(task.await_read().await, TaskState::AwaitingWrite(_)));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_connection() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let dispatcher = CompletionDispatcher::bind(config, Arc::new(ServerMetrics::new()))
            .await
            .unwrap();
        let control = dispatcher.control();

        let err = control.disconnect(ConnectionId::new(42)).unwrap_err();
        assert!(matches!(err, RelayError::ConnectionNotFound(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let dispatcher = CompletionDispatcher::bind(config, Arc::new(ServerMetrics::new()))
            .await
            .unwrap();
        let control = dispatcher.control();
        let local_addr = dispatcher.local_addr();

        let run = tokio::spawn(dispatcher.run());
        control.shutdown();

        run.await.unwrap().unwrap();
        assert!(control.is_shutdown());
        assert!(TcpStream::connect(local_addr).await.is_err());
    }
}
