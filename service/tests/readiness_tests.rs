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


//! Loopback tests for the readiness dispatcher

use chatrelay_service::{
    ConnectionRegistry, ControlMessage, ReadinessControl, ReadinessDispatcher, ReadyHandle,
    Result, ServerConfig, ServerMetrics,
};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use socket2::SockRef;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry<ReadyHandle>>,
    metrics: Arc<ServerMetrics>,
    control: ReadinessControl,
    thread: Option<JoinHandle<Result<()>>>,
}

impl TestServer {
    fn start() -> Self {
        Self::with_config(ServerConfig::new("127.0.0.1:0".parse().unwrap()))
    }

    fn with_config(config: ServerConfig) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        let dispatcher = ReadinessDispatcher::bind(config, metrics.clone()).unwrap();
        let addr = dispatcher.local_addr();
        let registry = dispatcher.registry();
        let control = dispatcher.control();
        let thread = std::thread::spawn(move || dispatcher.run());

        Self {
            addr,
            registry,
            metrics,
            control,
            thread: Some(thread),
        }
    }

    /// Connect and wait until the dispatcher has registered the client
    fn connect(&self) -> Client {
        let expected = self.registry.len() + 1;
        let client = Client::connect(self.addr);
        self.wait_for_count(expected);
        client
    }

    fn wait_for_count(&self, count: usize) {
        wait_for(|| self.registry.len() == count);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.control.send(ControlMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        Self {
            writer: stream.try_clone().unwrap(),
            reader: BufReader::new(stream),
        }
    }

    fn label(&self) -> String {
        format!("client[{}]", self.writer.local_addr().unwrap().port())
    }

    fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
        self.writer.flush().unwrap();
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line
    }

    /// Assert nothing arrives within a short window
    fn expect_silence(&mut self) {
        self.reader
            .get_ref()
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 64];
        match self.reader.read(&mut buf) {
            Err(e) => assert!(matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)),
            Ok(n) => panic!("unexpected {n} bytes: {:?}", String::from_utf8_lossy(&buf[..n])),
        }
        self.reader.get_ref().set_read_timeout(Some(TIMEOUT)).unwrap();
    }

    /// Close with a reset instead of an orderly shutdown
    fn reset(self) {
        SockRef::from(&self.writer)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
    }

    /// Assert the server closed this connection
    fn expect_eof(&mut self) {
        let mut buf = [0u8; 64];
        match self.reader.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => panic!("unexpected {n} bytes before close"),
            Err(e) => assert_eq!(e.kind(), ErrorKind::ConnectionReset),
        }
    }
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_broadcast_excludes_sender() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();
    let mut c = server.connect();

    a.send(b"hello\n");

    let expected = format!("{}: hello\n", a.label());
    assert_eq!(b.read_line(), expected);
    assert_eq!(c.read_line(), expected);
    a.expect_silence();
}

#[test]
fn test_lines_keep_per_sender_order() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();

    a.send(b"one\ntwo\nthree\n");

    let label = a.label();
    assert_eq!(b.read_line(), format!("{label}: one\n"));
    assert_eq!(b.read_line(), format!("{label}: two\n"));
    assert_eq!(b.read_line(), format!("{label}: three\n"));
}

#[test]
fn test_quit_is_not_broadcast_and_closes() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();

    a.send(b"\\quit\n");

    a.expect_eof();
    server.wait_for_count(1);
    b.expect_silence();
    assert_eq!(server.metrics.snapshot().quits, 1);
}

#[test]
fn test_line_split_across_writes() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();

    a.send(b"hel");
    std::thread::sleep(Duration::from_millis(50));
    a.send(b"lo\r\n");

    assert_eq!(b.read_line(), format!("{}: hello\n", a.label()));
}

#[test]
fn test_empty_line_is_ignored() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();

    a.send(b"\n\r\nafter\n");

    assert_eq!(b.read_line(), format!("{}: after\n", a.label()));
}

#[test]
fn test_peer_close_is_removed_and_relay_continues() {
    let server = TestServer::start();
    let a = server.connect();
    let mut b = server.connect();
    let mut c = server.connect();

    drop(a);
    server.wait_for_count(2);

    b.send(b"still here\n");
    assert_eq!(c.read_line(), format!("{}: still here\n", b.label()));
}

#[test]
fn test_peer_reset_is_removed_and_relay_continues() {
    let server = TestServer::start();
    let a = server.connect();
    let mut b = server.connect();
    let mut c = server.connect();

    a.reset();
    server.wait_for_count(2);

    b.send(b"after reset\n");
    assert_eq!(c.read_line(), format!("{}: after reset\n", b.label()));
}

#[test]
fn test_slow_consumer_is_dropped() {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_write_timeout(Duration::from_millis(200));
    let server = TestServer::with_config(config);
    let mut sender = server.connect();
    let _stalled = server.connect();
    let mut reader = server.connect();

    let done = format!("{}: done\n", sender.label());
    let drain = std::thread::spawn(move || {
        let mut received = 0;
        loop {
            let line = reader.read_line();
            if line == done {
                return received;
            }
            assert!(line.ends_with("y\n"), "unexpected line: {line:?}");
            received += 1;
        }
    });

    // The stalled client never reads; the loop gives up on it after the write timeout
    let line = format!("{}\n", "y".repeat(16 * 1024));
    let deadline = Instant::now() + TIMEOUT;
    let mut sent = 0;
    while server.registry.len() == 3 {
        assert!(Instant::now() < deadline, "stalled client was never dropped");
        sender.send(line.as_bytes());
        sent += 1;
    }
    sender.send(b"done\n");

    assert_eq!(drain.join().unwrap(), sent);
    assert_eq!(server.registry.len(), 2);
    assert!(server.metrics.snapshot().write_failures >= 1);
}

#[test]
fn test_registry_size_after_quits() {
    let server = TestServer::start();
    let mut clients: Vec<_> = (0..5).map(|_| server.connect()).collect();

    for client in clients.iter_mut().take(2) {
        client.send(b"\\quit\n");
    }
    server.wait_for_count(3);

    let metrics = server.metrics.snapshot();
    assert_eq!(metrics.total_connections, 5);
    assert_eq!(metrics.active_connections, 3);
}

#[test]
fn test_disconnect_through_control() {
    let server = TestServer::start();
    let mut a = server.connect();
    let _b = server.connect();

    let target = server.registry.ids().into_iter().min().unwrap();
    server
        .control
        .send(ControlMessage::Disconnect(target))
        .unwrap();

    server.wait_for_count(1);
    assert!(!server.registry.contains(target));
    a.expect_eof();
}

#[test]
fn test_drain_bound_revisits_connection() {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_read_chunk_size(4)
        .with_max_reads_per_event(1);
    let server = TestServer::with_config(config);
    let mut a = server.connect();
    let mut b = server.connect();

    let long = "x".repeat(200);
    a.send(format!("{long}\nshort\n").as_bytes());

    let label = a.label();
    assert_eq!(b.read_line(), format!("{label}: {long}\n"));
    assert_eq!(b.read_line(), format!("{label}: short\n"));
}

#[test]
fn test_connection_limit_refuses_extra_clients() {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap()).with_max_connections(1);
    let server = TestServer::with_config(config);
    let _a = server.connect();

    let mut rejected = Client::connect(server.addr);
    rejected.expect_eof();
    assert_eq!(server.registry.len(), 1);
}

#[test]
fn test_shutdown_closes_clients() {
    let mut server = TestServer::start();
    let mut a = server.connect();

    server.control.send(ControlMessage::Shutdown).unwrap();
    server.thread.take().unwrap().join().unwrap().unwrap();

    a.expect_eof();
    assert!(server.registry.is_empty());
}
