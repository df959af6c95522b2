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


//! Line-oriented chat client

use crate::{ClientConfig, ClientError, Result};
use chatrelay_service::{LineFramer, QUIT_SENTINEL};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// A connection to a chat relay
#[derive(Debug)]
pub struct ChatClient {
    framed: Framed<TcpStream, LineFramer>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl ChatClient {
    /// Connect using `config`
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionTimeout`] if the connection does not
    /// complete within `connect_timeout`, or an I/O error.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(config.address()))
            .await
            .map_err(|_| ClientError::ConnectionTimeout)??;
        Self::from_stream(stream, config.max_line_length)
    }

    /// Connect to `addr` with default settings
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the connection fails.
    pub async fn connect_addr(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream, ClientConfig::default().max_line_length)
    }

    fn from_stream(stream: TcpStream, max_line_length: usize) -> Result<Self> {
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        info!(%local_addr, %peer_addr, "Connected to chat relay");

        Ok(Self {
            framed: Framed::new(stream, LineFramer::with_max_line_length(max_line_length)),
            local_addr,
            peer_addr,
        })
    }

    /// Get the local address, whose port names this client on the relay
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the relay address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send one line of text
    ///
    /// Empty text is not sent.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub async fn send_line(&mut self, text: &str) -> Result<()> {
        let text = text.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(());
        }
        self.framed.send(text.to_string()).await?;
        Ok(())
    }

    /// Wait for the next relayed message
    ///
    /// Returns `None` once the relay closes the connection.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the read fails.
    pub async fn next_message(&mut self) -> Result<Option<String>> {
        match self.framed.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => Err(e.into()),
            None => {
                debug!(peer_addr = %self.peer_addr, "Relay closed the connection");
                Ok(None)
            }
        }
    }

    /// Send the quit sentinel and close the connection
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sentinel cannot be sent.
    pub async fn quit(mut self) -> Result<()> {
        self.framed.send(QUIT_SENTINEL.to_string()).await?;
        self.framed.close().await?;
        info!(peer_addr = %self.peer_addr, "Left chat relay");
        Ok(())
    }
}
