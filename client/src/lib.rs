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


//! # Chat Relay Client
//!
//! Connects to a chat relay, sends lines of text, and receives the lines
//! other clients send as `"client[<port>]: <text>"`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use chatrelay_client::{ChatClient, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = ChatClient::connect(&ClientConfig::new("localhost", 8888)).await?;
//!     client.send_line("hello everyone").await?;
//!
//!     while let Some(message) = client.next_message().await? {
//!         println!("{message}");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod error;

pub use client::ChatClient;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
