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


//! Chat relay server binary
//!
//! ```bash
//! chatrelay-server --port 8888 --strategy completion --workers 8
//! ```
//!
//! Log verbosity is taken from `RUST_LOG` (default `info`).

use chatrelay_service::{DEFAULT_PORT, DispatchStrategy, RelayServer, ServerConfig};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Multi-client newline chat relay
#[derive(Parser, Debug)]
#[command(name = "chatrelay-server", version, about)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    bind: IpAddr,
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Dispatch strategy (`readiness` or `completion`)
    #[arg(short, long, default_value_t = DispatchStrategy::Readiness)]
    strategy: DispatchStrategy,
    /// Worker threads for the completion strategy
    #[arg(short, long, default_value_t = 8)]
    workers: usize,
    /// Connections beyond this are refused
    #[arg(long, default_value_t = 1000)]
    max_connections: usize,
}

impl Cli {
    fn config(&self) -> ServerConfig {
        ServerConfig::new(SocketAddr::new(self.bind, self.port))
            .with_strategy(self.strategy)
            .with_worker_threads(self.workers)
            .with_max_connections(self.max_connections)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let server = RelayServer::bind(cli.config())?;
    info!(
        local_addr = %server.local_addr(),
        strategy = %cli.strategy,
        "Chat relay listening, press Ctrl+C to stop"
    );
    let running = server.spawn()?;

    // Wait for Ctrl+C, or for the dispatcher to stop on its own
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    signals.block_on(async {
        let mut check = tokio::time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!(error = %e, "Failed to listen for Ctrl+C");
                    }
                    info!("Shutting down");
                    break;
                }
                _ = check.tick() => {
                    if running.is_finished() {
                        break;
                    }
                }
            }
        }
    });

    let metrics = running.handle().metrics();
    running.shutdown()?;
    let snapshot = metrics.snapshot();
    info!(
        total_connections = snapshot.total_connections,
        messages_routed = snapshot.messages_routed,
        errors = snapshot.total_errors(),
        avg_connection_duration = ?snapshot.avg_connection_duration,
        "Chat relay stopped"
    );
    Ok(())
}
