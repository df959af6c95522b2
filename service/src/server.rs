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


//! Relay server facade
//!
//! [`RelayServer`] binds a listener with the configured
//! [`DispatchStrategy`] and drives it to completion on the calling thread
//! ([`RelayServer::run`]) or on a dedicated dispatch thread
//! ([`RelayServer::spawn`]). A cloneable [`ServerHandle`] controls it from
//! anywhere.

use crate::{
    CompletionControl, CompletionDispatcher, ConnectionId, ConnectionInfo, ConnectionRegistry,
    ControlMessage, DispatchStrategy, QueueHandle, ReadinessControl, ReadinessDispatcher,
    ReadyHandle, RelayError, Result, ServerConfig, ServerMetrics, ServerSnapshot,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::runtime::Runtime;
use tracing::info;

/// Chat relay server
///
/// # Example
///
/// ```no_run
/// use chatrelay_service::{DispatchStrategy, RelayServer, ServerConfig};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServerConfig::default().with_strategy(DispatchStrategy::Completion);
///     let server = RelayServer::bind(config)?;
///     let running = server.spawn()?;
///
///     // ... later
///     running.shutdown()?;
///     Ok(())
/// }
/// ```
///
/// The completion strategy owns its tokio runtime, so `bind` and `run` must
/// not be called from inside another runtime.
pub struct RelayServer {
    dispatcher: Dispatcher,
    handle: ServerHandle,
    config: ServerConfig,
}

enum Dispatcher {
    Readiness(ReadinessDispatcher),
    Completion {
        runtime: Runtime,
        dispatcher: CompletionDispatcher,
    },
}

impl RelayServer {
    /// Validate `config` and bind its listener
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] for an invalid configuration,
    /// [`RelayError::Bind`] if the address cannot be bound, or an I/O error
    /// if the poll or runtime cannot be created.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(ServerMetrics::new());

        let (dispatcher, control, local_addr) = match config.strategy {
            DispatchStrategy::Readiness => {
                let dispatcher = ReadinessDispatcher::bind(config.clone(), metrics.clone())?;
                let control = Control::Readiness {
                    control: dispatcher.control(),
                    registry: dispatcher.registry(),
                };
                let local_addr = dispatcher.local_addr();
                (Dispatcher::Readiness(dispatcher), control, local_addr)
            }
            DispatchStrategy::Completion => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(config.worker_threads)
                    .thread_name("chatrelay-worker")
                    .enable_all()
                    .build()?;
                let dispatcher =
                    runtime.block_on(CompletionDispatcher::bind(config.clone(), metrics.clone()))?;
                let control = Control::Completion {
                    control: dispatcher.control(),
                    registry: dispatcher.registry(),
                };
                let local_addr = dispatcher.local_addr();
                (
                    Dispatcher::Completion {
                        runtime,
                        dispatcher,
                    },
                    control,
                    local_addr,
                )
            }
        };

        let handle = ServerHandle {
            control,
            metrics,
            local_addr,
            strategy: config.strategy,
            started_at: Instant::now(),
        };

        Ok(Self {
            dispatcher,
            handle,
            config,
        })
    }

    /// Get the bound listener address
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    /// Get a handle for controlling the server
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve until shutdown on the calling thread
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Accept`] if the listener fails.
    pub fn run(self) -> Result<()> {
        info!(
            local_addr = %self.handle.local_addr,
            strategy = %self.config.strategy,
            "Relay server running"
        );
        match self.dispatcher {
            Dispatcher::Readiness(dispatcher) => dispatcher.run(),
            Dispatcher::Completion {
                runtime,
                dispatcher,
            } => {
                let result = runtime.block_on(dispatcher.run());
                runtime.shutdown_timeout(self.config.shutdown_timeout);
                result
            }
        }
    }

    /// Serve on a dedicated dispatch thread
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn(self) -> Result<RunningServer> {
        let handle = self.handle();
        let thread = std::thread::Builder::new()
            .name("chatrelay-dispatch".to_string())
            .spawn(move || self.run())?;
        Ok(RunningServer { handle, thread })
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("local_addr", &self.handle.local_addr)
            .field("strategy", &self.config.strategy)
            .finish()
    }
}

#[derive(Debug, Clone)]
enum Control {
    Readiness {
        control: ReadinessControl,
        registry: Arc<ConnectionRegistry<ReadyHandle>>,
    },
    Completion {
        control: CompletionControl,
        registry: Arc<ConnectionRegistry<QueueHandle>>,
    },
}

/// Cloneable control and inspection handle for a [`RelayServer`]
#[derive(Debug, Clone)]
pub struct ServerHandle {
    control: Control,
    metrics: Arc<ServerMetrics>,
    local_addr: SocketAddr,
    strategy: DispatchStrategy,
    started_at: Instant,
}

impl ServerHandle {
    /// Stop accepting, close every connection, and end the dispatcher
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ServerNotRunning`] if the server already stopped.
    pub fn shutdown(&self) -> Result<()> {
        match &self.control {
            Control::Readiness { control, .. } => control.send(ControlMessage::Shutdown),
            Control::Completion { control, .. } => {
                if control.is_shutdown() {
                    return Err(RelayError::ServerNotRunning);
                }
                control.shutdown();
                Ok(())
            }
        }
    }

    /// Close one connection
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ConnectionNotFound`] if `id` is not registered.
    pub fn disconnect(&self, id: ConnectionId) -> Result<()> {
        match &self.control {
            Control::Readiness { control, registry } => {
                if !registry.contains(id) {
                    return Err(RelayError::ConnectionNotFound(id));
                }
                control.send(ControlMessage::Disconnect(id))
            }
            Control::Completion { control, .. } => control.disconnect(id),
        }
    }

    /// Get the number of registered connections
    pub fn connection_count(&self) -> usize {
        match &self.control {
            Control::Readiness { registry, .. } => registry.len(),
            Control::Completion { registry, .. } => registry.len(),
        }
    }

    /// Get information about every registered connection
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        match &self.control {
            Control::Readiness { registry, .. } => registry.infos(),
            Control::Completion { registry, .. } => registry.infos(),
        }
    }

    /// Get a server snapshot
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            active_connections: self.connection_count(),
            total_connections: self.metrics.total_connections(),
            bind_address: self.local_addr,
            strategy: self.strategy,
            uptime: self.started_at.elapsed(),
        }
    }

    /// Get the server metrics
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Get the bound listener address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// A [`RelayServer`] running on its dispatch thread
#[derive(Debug)]
pub struct RunningServer {
    handle: ServerHandle,
    thread: JoinHandle<Result<()>>,
}

impl RunningServer {
    /// Get a handle for controlling the server
    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    /// Get the bound listener address
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    /// Check whether the dispatch thread has exited
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the dispatch thread to exit
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's error, or [`RelayError::DispatcherPanicked`].
    pub fn join(self) -> Result<()> {
        self.thread
            .join()
            .map_err(|_| RelayError::DispatcherPanicked)?
    }

    /// Request shutdown and wait for the dispatch thread to exit
    ///
    /// # Errors
    ///
    /// Returns the dispatcher's error, or [`RelayError::DispatcherPanicked`].
    pub fn shutdown(self) -> Result<()> {
        if let Err(e) = self.handle.shutdown() {
            tracing::debug!(error = %e, "Dispatcher already stopped");
        }
        self.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: DispatchStrategy) -> ServerConfig {
        ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .with_strategy(strategy)
            .with_worker_threads(2)
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let err = RelayServer::bind(config(DispatchStrategy::Readiness).with_max_connections(0))
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidConfig(_)));
    }

    #[test]
    fn test_bind_reports_address_in_use() {
        let first = RelayServer::bind(config(DispatchStrategy::Readiness)).unwrap();
        let taken = ServerConfig::new(first.local_addr());

        let err = RelayServer::bind(taken).unwrap_err();
        assert!(matches!(err, RelayError::Bind { address, .. } if address == first.local_addr()));
    }

    #[test]
    fn test_spawn_and_shutdown_both_strategies() {
        for strategy in [DispatchStrategy::Readiness, DispatchStrategy::Completion] {
            let server = RelayServer::bind(config(strategy)).unwrap();
            let running = server.spawn().unwrap();
            let handle = running.handle().clone();

            let snapshot = handle.snapshot();
            assert_eq!(snapshot.strategy, strategy);
            assert_eq!(snapshot.active_connections, 0);
            assert_eq!(snapshot.bind_address, running.local_addr());

            running.shutdown().unwrap();
            assert!(matches!(handle.shutdown(), Err(RelayError::ServerNotRunning)));
        }
    }

    #[test]
    fn test_disconnect_unknown_connection() {
        for strategy in [DispatchStrategy::Readiness, DispatchStrategy::Completion] {
            let server = RelayServer::bind(config(strategy)).unwrap();
            let handle = server.handle();

            let err = handle.disconnect(ConnectionId::new(99)).unwrap_err();
            assert!(matches!(err, RelayError::ConnectionNotFound(_)));
        }
    }
}
