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


//! Broadcast router
//!
//! Turns one decoded line from one client into a delivery to every other
//! registered client. The wire format is `<label>: <line>\n`; there is no
//! other framing and no acknowledgement.

use crate::quit::{LineAction, classify};
use crate::{ConnectionId, ConnectionRegistry, FanOut, Outbound, ServerMetrics};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of handing one line to the router
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// The line was broadcast
    Routed(FanOut),
    /// The line was the quit sentinel; the sender must be closed
    Quit,
    /// The line was empty and dropped
    Ignored,
}

/// Format a broadcast as it appears on the wire
pub fn format_broadcast(label: &str, line: &str) -> Bytes {
    Bytes::from(format!("{label}: {line}\n"))
}

/// Fans decoded lines out across a [`ConnectionRegistry`]
#[derive(Debug, Clone)]
pub struct BroadcastRouter {
    metrics: Arc<ServerMetrics>,
}

impl BroadcastRouter {
    /// Create a router reporting into `metrics`
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self { metrics }
    }

    /// Classify a decoded line and route it if it is a message
    ///
    /// The quit sentinel is swallowed here, before any fan-out.
    pub fn dispatch<H: Outbound>(
        &self,
        registry: &ConnectionRegistry<H>,
        sender: ConnectionId,
        sender_label: &str,
        line: String,
    ) -> RouteDecision {
        self.metrics.line_received();
        match classify(line) {
            LineAction::Forward(line) => {
                RouteDecision::Routed(self.route(registry, sender, sender_label, &line))
            }
            LineAction::Quit => {
                self.metrics.quit();
                RouteDecision::Quit
            }
            LineAction::Ignore => RouteDecision::Ignored,
        }
    }

    /// Deliver `"<sender_label>: <line>"` to every connection except `sender`
    pub fn route<H: Outbound>(
        &self,
        registry: &ConnectionRegistry<H>,
        sender: ConnectionId,
        sender_label: &str,
        line: &str,
    ) -> FanOut {
        let message = format_broadcast(sender_label, line);
        let bytes = message.len() as u64;

        let fan_out = registry.for_each_except(sender, |recipient| {
            recipient.deliver(&message)?;
            self.metrics.message_routed(bytes);
            Ok(())
        });

        for (id, error) in &fan_out.failed {
            self.metrics.write_failure();
            warn!(connection_id = %id, %error, "Broadcast delivery failed");
        }
        debug!(
            connection_id = %sender,
            recipients = fan_out.attempted,
            delivered = fan_out.delivered,
            "Routed line"
        );
        fan_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Connection;
    use crate::connection::testing::RecordingHandle;
    use std::net::SocketAddr;

    struct Fixture {
        registry: ConnectionRegistry<RecordingHandle>,
        router: BroadcastRouter,
        metrics: Arc<ServerMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let metrics = Arc::new(ServerMetrics::new());
            Self {
                registry: ConnectionRegistry::new(metrics.clone()),
                router: BroadcastRouter::new(metrics.clone()),
                metrics,
            }
        }

        fn connect(&self, port: u16, handle: RecordingHandle) -> ConnectionId {
            let id = self.registry.next_id();
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            self.registry.add(Connection::new(id, addr, handle)).unwrap();
            id
        }

        fn sent(&self, id: ConnectionId) -> Vec<Bytes> {
            self.registry
                .with_connection(id, |c| c.handle().sent.clone())
                .unwrap_or_default()
        }
    }

    #[test]
    fn test_format_broadcast() {
        assert_eq!(
            format_broadcast("client[1234]", "hello"),
            Bytes::from_static(b"client[1234]: hello\n")
        );
    }

    #[test]
    fn test_route_reaches_everyone_but_sender() {
        let fx = Fixture::new();
        let a = fx.connect(1001, RecordingHandle::default());
        let b = fx.connect(1002, RecordingHandle::default());
        let c = fx.connect(1003, RecordingHandle::default());

        let decision = fx
            .router
            .dispatch(&fx.registry, a, "client[1001]", "L".to_string());

        assert!(matches!(decision, RouteDecision::Routed(ref f) if f.delivered == 2));
        assert!(fx.sent(a).is_empty());
        for id in [b, c] {
            assert_eq!(fx.sent(id), vec![Bytes::from_static(b"client[1001]: L\n")]);
        }
        assert_eq!(fx.metrics.snapshot().messages_routed, 2);
    }

    #[test]
    fn test_quit_is_swallowed() {
        let fx = Fixture::new();
        let a = fx.connect(1001, RecordingHandle::default());
        let b = fx.connect(1002, RecordingHandle::default());

        let decision = fx
            .router
            .dispatch(&fx.registry, a, "client[1001]", "\\quit".to_string());

        assert!(matches!(decision, RouteDecision::Quit));
        assert!(fx.sent(b).is_empty());
        assert_eq!(fx.metrics.snapshot().quits, 1);
    }

    #[test]
    fn test_empty_line_is_ignored() {
        let fx = Fixture::new();
        let a = fx.connect(1001, RecordingHandle::default());
        let b = fx.connect(1002, RecordingHandle::default());

        let decision = fx
            .router
            .dispatch(&fx.registry, a, "client[1001]", String::new());

        assert!(matches!(decision, RouteDecision::Ignored));
        assert!(fx.sent(b).is_empty());
    }

    #[test]
    fn test_failed_recipient_does_not_abort_fan_out() {
        let fx = Fixture::new();
        let a = fx.connect(1001, RecordingHandle::default());
        let broken = fx.connect(1002, RecordingHandle::failing());
        let c = fx.connect(1003, RecordingHandle::default());

        let fan_out = fx.router.route(&fx.registry, a, "client[1001]", "still here");

        assert_eq!(fan_out.failed_ids().collect::<Vec<_>>(), vec![broken]);
        assert_eq!(fx.sent(c).len(), 1);
        assert_eq!(fx.metrics.snapshot().write_failures, 1);
    }

    #[test]
    fn test_lone_sender_routes_to_nobody() {
        let fx = Fixture::new();
        let a = fx.connect(1001, RecordingHandle::default());

        let fan_out = fx.router.route(&fx.registry, a, "client[1001]", "echo?");
        assert_eq!(fan_out.attempted, 0);
        assert!(fan_out.failed.is_empty());
    }
}
