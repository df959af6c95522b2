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


//! Chat Relay Service
//!
//! A multi-client line relay: every newline-terminated line a client sends
//! is re-broadcast as `"<label>: <line>"` to every other connected client,
//! where the label is `client[<remote-port>]`. A client leaves by sending
//! the `\quit` sentinel, which is never broadcast.
//!
//! Two dispatch strategies share the same framer, registry and router:
//!
//! - [`ReadinessDispatcher`]: one thread multiplexing every socket over a
//!   mio poll
//! - [`CompletionDispatcher`]: a tokio worker pool with one
//!   [`Outbound`]-queue-backed task per connection
//!
//! # Architecture
//!
//! ```text
//! RelayServer
//!     ↓
//! ReadinessDispatcher | CompletionDispatcher
//!     ↓                        ↓
//! LineFramer → BroadcastRouter → ConnectionRegistry → Outbound
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chatrelay_service::{RelayServer, ServerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RelayServer::bind(ServerConfig::default())?;
//!     server.run()?;
//!     Ok(())
//! }
//! ```

mod completion;
mod config;
mod connection;
mod error;
mod framer;
mod metrics;
mod quit;
mod readiness;
mod registry;
mod router;
mod server;
mod types;

pub use completion::{CompletionControl, CompletionDispatcher, QueueHandle};
pub use config::{DEFAULT_PORT, DispatchStrategy, ServerConfig};
pub use connection::{CloseReason, Connection, Outbound};
pub use error::{RelayError, Result};
pub use framer::{DEFAULT_MAX_LINE_LENGTH, LineFramer, Lines, READ_CHUNK_SIZE};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use quit::{LineAction, QUIT_SENTINEL, classify, is_quit};
pub use readiness::{ControlMessage, ReadinessControl, ReadinessDispatcher, ReadyHandle};
pub use registry::{ConnectionRegistry, FanOut};
pub use router::{BroadcastRouter, RouteDecision, format_broadcast};
pub use server::{RelayServer, RunningServer, ServerHandle};
pub use types::{ConnectionId, ConnectionInfo, ConnectionState, ServerSnapshot, peer_label};
