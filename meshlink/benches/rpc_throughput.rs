//! RPC round-trip latency and fan-out throughput benchmarks.
//!
//! Measures: single round-trip latency for a local (no-socket) RPC, and
//! the cost of fanning an RPC out to N peers over loopback TCP.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meshlink::{Label, Node, NodeConfig, Value};
use std::time::Duration;

const FANOUT_PEERS: &[usize] = &[1, 2, 4];
const WARMUP_ROUNDS: usize = 50;

/// A single RPC served entirely by the local handler — no socket in the
/// loop, isolating the RPC client/future-graph overhead from TCP.
fn local_rpc_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("rpc/local_round_trip");
    group.measurement_time(Duration::from_secs(5));

    let rt = compio::runtime::Runtime::new().unwrap();
    let node = rt.block_on(async {
        let node = Node::new("127.0.0.1:0".parse().unwrap(), vec![], NodeConfig::default());
        node.accept_rpc(
            Label::Int(1),
            Label::Text("echo".into()),
            0,
            0,
            |_from, _rid, args, _kw| Ok(args.into_iter().next().unwrap_or(Value::Null)),
            true,
        );
        node
    });

    for _ in 0..WARMUP_ROUNDS {
        rt.block_on(
            node.rpc(Label::Int(1), Label::Text("echo".into()), 0, vec![Value::Int(1)], vec![], None),
        )
        .unwrap();
    }

    group.bench_function("single_peer_local", |b| {
        b.iter(|| {
            rt.block_on(async {
                let result = node
                    .rpc(Label::Int(1), Label::Text("echo".into()), 0, vec![Value::Int(1)], vec![], None)
                    .await
                    .unwrap();
                black_box(result);
            });
        });
    });

    group.finish();
}

/// Fan an RPC out to N established peers over loopback TCP and wait for
/// every response.
fn fan_out_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("rpc/fan_out");
    let rt = compio::runtime::Runtime::new().unwrap();

    for &peers in FANOUT_PEERS {
        let (requester, _peer_nodes) = rt.block_on(async { build_mesh(peers).await });

        group.throughput(Throughput::Elements(peers as u64));
        group.bench_with_input(BenchmarkId::new("peers", peers), &peers, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let results = requester
                        .rpc(
                            Label::Int(1),
                            Label::Text("echo".into()),
                            0,
                            vec![Value::Int(1)],
                            vec![],
                            Some(Duration::from_secs(5)),
                        )
                        .await
                        .unwrap();
                    black_box(results);
                });
            });
        });
    }

    group.finish();
}

/// Builds `peer_count` echo-serving nodes plus a requester dialing all of
/// them. Returns both the requester and the peer handles — the caller
/// must keep the peers alive for as long as the benchmark runs.
async fn build_mesh(peer_count: usize) -> (Node, Vec<Node>) {
    let requester_addr: std::net::SocketAddr =
        format!("127.0.0.1:{}", portpicker::pick_unused_port().unwrap())
            .parse()
            .unwrap();

    let mut peer_addrs = Vec::with_capacity(peer_count);
    let mut peer_nodes = Vec::with_capacity(peer_count);
    for _ in 0..peer_count {
        let addr: std::net::SocketAddr =
            format!("127.0.0.1:{}", portpicker::pick_unused_port().unwrap())
                .parse()
                .unwrap();
        let node = Node::new(addr, vec![], NodeConfig::default());
        node.accept_rpc(
            Label::Int(1),
            Label::Text("echo".into()),
            0,
            0,
            |_from, _rid, args, _kw| Ok(args.into_iter().next().unwrap_or(Value::Null)),
            true,
        );
        node.start().await.unwrap();
        peer_addrs.push(addr);
        peer_nodes.push(node);
    }

    let requester = Node::new(requester_addr, peer_addrs, NodeConfig::default());
    requester.start().await.unwrap();
    requester
        .wait_on_connections(None, Some(Duration::from_secs(5)))
        .await;

    (requester, peer_nodes)
}

criterion_group!(benches, local_rpc_round_trip, fan_out_throughput);
criterion_main!(benches);
