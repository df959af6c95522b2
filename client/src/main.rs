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


//! Interactive chat relay client
//!
//! Lines typed on stdin are sent to the relay; relayed messages are printed
//! to stdout. Typing `\quit` or closing stdin leaves the chat.

use chatrelay_client::{ChatClient, ClientConfig};
use chatrelay_service::{DEFAULT_PORT, is_quit};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Chat relay client
#[derive(Parser, Debug)]
#[command(name = "chatrelay-client", version, about)]
struct Cli {
    /// Relay host
    #[arg(long, default_value = "localhost")]
    host: String,
    /// Relay port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut client = ChatClient::connect(&ClientConfig::new(cli.host, cli.port)).await?;
    println!(
        "Connected as client[{}], type \\quit to leave",
        client.local_addr().port()
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            input = stdin.next_line() => match input? {
                Some(line) if !is_quit(line.trim_end()) => match client.send_line(&line).await {
                    Ok(()) => {}
                    Err(e) if e.is_disconnect() => {
                        println!("Disconnected");
                        break;
                    }
                    Err(e) => return Err(e.into()),
                },
                _ => {
                    client.quit().await?;
                    break;
                }
            },
            message = client.next_message() => match message? {
                Some(message) => println!("{message}"),
                None => {
                    info!("Relay closed the connection");
                    println!("Disconnected");
                    break;
                }
            },
        }
    }
    Ok(())
}
