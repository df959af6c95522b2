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


//! Benchmarks for line framing and broadcast fan-out

use bytes::Bytes;
use chatrelay_service::{
    BroadcastRouter, Connection, ConnectionId, ConnectionRegistry, LineFramer, Outbound,
    READ_CHUNK_SIZE, Result, ServerMetrics,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

// Outbound that only counts bytes
#[derive(Default)]
struct CountingSink {
    bytes: usize,
}

impl Outbound for CountingSink {
    fn deliver(&mut self, _id: ConnectionId, message: &Bytes) -> Result<()> {
        self.bytes += message.len();
        Ok(())
    }
}

fn chat_traffic(lines: usize) -> Vec<u8> {
    let mut traffic = Vec::new();
    for i in 0..lines {
        traffic.extend_from_slice(format!("message number {i} from the bench client\r\n").as_bytes());
    }
    traffic
}

// Benchmark framing throughput at the dispatcher read size
fn bench_framer_chunks(c: &mut Criterion) {
    let traffic = chat_traffic(10_000);

    let mut group = c.benchmark_group("framer");
    group.throughput(Throughput::Bytes(traffic.len() as u64));

    for chunk_size in [16, 256, READ_CHUNK_SIZE, 8192] {
        group.bench_with_input(
            BenchmarkId::new("feed", chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let mut framer = LineFramer::new();
                    let mut count = 0;
                    for chunk in traffic.chunks(chunk_size) {
                        count += framer.feed(black_box(chunk)).count();
                    }
                    black_box(count)
                });
            },
        );
    }

    group.finish();
}

// Benchmark routing one line with varying connection counts
fn bench_broadcast_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_scaling");

    for conn_count in [10, 50, 100, 500] {
        let metrics = Arc::new(ServerMetrics::new());
        let registry = ConnectionRegistry::new(metrics.clone());
        let router = BroadcastRouter::new(metrics);
        for port in 0..conn_count {
            let id = registry.next_id();
            let addr = format!("127.0.0.1:{}", 10_000 + port).parse().unwrap();
            let _ = registry.add(Connection::new(id, addr, CountingSink::default()));
        }
        let sender = ConnectionId::new(1);

        group.throughput(Throughput::Elements(conn_count as u64 - 1));
        group.bench_with_input(
            BenchmarkId::new("route", conn_count),
            &conn_count,
            |b, _| {
                b.iter(|| {
                    let fan_out = router.route(&registry, sender, "client[10000]", "hello");
                    black_box(fan_out)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_framer_chunks, bench_broadcast_scaling);
criterion_main!(benches);
