//! End-to-end scenarios over loopback TCP (spec.md §8), exercising two
//! real [`Node`]s rather than mocking the dispatcher/peer layer.

use meshlink::{AnyFuture, Label, Node, NodeConfig, RpcError, RpcOutcome, Value};
use std::net::SocketAddr;
use std::time::Duration;

fn loopback(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

async fn connected_pair() -> (Node, Node, SocketAddr, SocketAddr) {
    let a_port = portpicker::pick_unused_port().expect("no ports available");
    let b_port = portpicker::pick_unused_port().expect("no ports available");
    let a_addr = loopback(a_port);
    let b_addr = loopback(b_port);

    let node_a = Node::new(a_addr, vec![], NodeConfig::default());
    let node_b = Node::new(b_addr, vec![a_addr], NodeConfig::default());

    node_a.start().await.expect("node a failed to bind");
    node_b.start().await.expect("node b failed to bind");

    let timed_out = node_b
        .wait_on_connections(None, Some(Duration::from_secs(5)))
        .await;
    assert!(!timed_out, "node b never established its static peer");

    (node_a, node_b, a_addr, b_addr)
}

#[compio::test]
async fn echo_fan_in_returns_each_message_exactly_once() {
    let (node_a, node_b, ..) = connected_pair().await;

    node_a.accept_rpc(
        Label::Int(1),
        Label::Text("echo".into()),
        0,
        0,
        |_from, _rid, args, _kw| Ok(args.into_iter().next().unwrap_or(Value::Null)),
        true,
    );

    let messages = ["two", "three", "four", "five"];
    let mut pending: Vec<AnyFuture> = Vec::new();
    for m in messages {
        let rpc = node_b
            .send_rpc(
                Label::Int(1),
                Label::Text("echo".into()),
                0,
                vec![Value::Text(m.into())],
                vec![],
            )
            .expect("echo rpc should be routable");
        pending.push(AnyFuture::Rpc(rpc));
    }

    let mut seen = Vec::new();
    for _ in 0..messages.len() {
        let done = node_b
            .wait_any_rpc(&pending, Some(Duration::from_secs(5)))
            .await
            .expect("one of the pending rpcs should complete");
        let AnyFuture::Rpc(rpc) = &done else {
            panic!("expected an Rpc, not a Dependent");
        };
        let results = rpc.results().expect("completed rpc has results");
        match &results[0] {
            RpcOutcome::Ok(Value::Text(text)) => seen.push(text.clone()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        pending.retain(|f| match (f, &done) {
            (AnyFuture::Rpc(a), AnyFuture::Rpc(b)) => a.counter() != b.counter(),
            _ => true,
        });
    }

    seen.sort();
    let mut expected: Vec<String> = messages.iter().map(|s| (*s).to_string()).collect();
    expected.sort();
    assert_eq!(seen, expected);
}

#[compio::test]
async fn unroutable_request_raises_without_sending_a_frame() {
    let (_node_a, node_b, ..) = connected_pair().await;

    let err = node_b
        .send_rpc(Label::Int(9), Label::Text("x".into()), 0, vec![], vec![])
        .unwrap_err();
    assert!(matches!(err, RpcError::Unroutable));
}

#[compio::test]
async fn lost_connection_completes_with_a_partial_result_and_a_lost_entry() {
    let (node_a, node_b, ..) = connected_pair().await;

    node_a.accept_rpc(
        Label::Int(1),
        Label::Text("echo".into()),
        0,
        0,
        |_from, _rid, args, _kw| Ok(args.into_iter().next().unwrap_or(Value::Null)),
        true,
    );

    // One target is node_a (remote), the other is node_b's own local
    // handler for the same predicate — a fan-out of two without a third
    // node, so closing node_a's side leaves exactly one LostConnection.
    node_b.accept_rpc(
        Label::Int(1),
        Label::Text("echo".into()),
        0,
        0,
        |_from, _rid, args, _kw| Ok(args.into_iter().next().unwrap_or(Value::Null)),
        true,
    );

    node_a.shutdown();

    let rpc = node_b
        .send_rpc(
            Label::Int(1),
            Label::Text("echo".into()),
            0,
            vec![Value::Text("hi".into())],
            vec![],
        )
        .expect("should be routable to node_a and the local handler");

    let completed = node_b
        .client()
        .wait(&[rpc], Some(Duration::from_secs(5)))
        .await
        .expect("rpc should complete once the lost peer's target clears");
    let results = completed.results().expect("wait resolved without completion");

    assert_eq!(results.len(), 2);
    assert!(results.iter().any(|r| matches!(r, RpcOutcome::Ok(_))));
    assert!(results.iter().any(|r| matches!(r, RpcOutcome::LostConnection(_))));
}

#[compio::test]
async fn timeout_without_cancel_then_a_later_wait_sees_the_eventual_result() {
    let (node_a, node_b, ..) = connected_pair().await;

    node_a.accept_rpc(
        Label::Int(1),
        Label::Text("slow".into()),
        0,
        0,
        |_from, _rid, args, _kw| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        },
        true,
    );

    let rpc = node_b
        .send_rpc(Label::Int(1), Label::Text("slow".into()), 0, vec![Value::Int(42)], vec![])
        .unwrap();

    let early = node_b.client().wait(&[rpc.clone()], Some(Duration::from_millis(50))).await;
    assert!(matches!(early, Err(RpcError::WaitTimeout)));

    let later = node_b.client().wait(&[rpc], Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(later.results().unwrap(), vec![RpcOutcome::Ok(Value::Int(42))]);
}

#[compio::test]
async fn dependent_chain_sums_after_both_parents_complete() {
    use meshlink::core::future::{CallbackOutput, Completion};

    let (node_a, node_b, ..) = connected_pair().await;

    node_a.accept_rpc(
        Label::Int(1),
        Label::Text("double".into()),
        0,
        0,
        |_from, _rid, args, _kw| match args.into_iter().next() {
            Some(Value::Int(n)) => Ok(Value::Int(n * 2)),
            _ => Ok(Value::Int(0)),
        },
        true,
    );

    let a = node_b
        .send_rpc(Label::Int(1), Label::Text("double".into()), 0, vec![Value::Int(3)], vec![])
        .unwrap();

    let node_b_for_dep = node_b.clone();
    let b = a.after(node_b.client(), vec![], move |results| {
        let Completion::Rpc(outcomes) = &results[0] else {
            return CallbackOutput::Value(Value::Null);
        };
        let RpcOutcome::Ok(Value::Int(n)) = &outcomes[0] else {
            return CallbackOutput::Value(Value::Null);
        };
        let rpc = node_b_for_dep
            .send_rpc(Label::Int(1), Label::Text("double".into()), 0, vec![Value::Int(*n)], vec![])
            .expect("nested rpc should be routable");
        CallbackOutput::Pending(rpc)
    });

    let c = b.after(node_b.client(), vec![], |results| {
        let Completion::Rpc(outcomes) = &results[0] else {
            return CallbackOutput::Value(Value::Null);
        };
        let sum: i64 = outcomes
            .iter()
            .filter_map(|o| match o {
                RpcOutcome::Ok(Value::Int(n)) => Some(*n),
                _ => None,
            })
            .sum();
        CallbackOutput::Value(Value::Int(sum))
    });

    let result = c.wait(node_b.client(), Some(Duration::from_secs(5))).await.unwrap();
    match result {
        Completion::Value(Value::Int(n)) => assert_eq!(n, 12),
        other => panic!("unexpected completion: {other:?}"),
    }
}

#[compio::test]
async fn handler_overlap_is_rejected_then_a_disjoint_predicate_is_accepted() {
    let (node_a, _node_b, ..) = connected_pair().await;

    let first = node_a.accept_rpc(
        Label::Int(1),
        Label::Text("m".into()),
        0xF0,
        0x10,
        |_from, _rid, _args, _kw| Ok(Value::Null),
        true,
    );
    assert!(first);

    let overlapping = node_a.accept_rpc(
        Label::Int(1),
        Label::Text("m".into()),
        0xF0,
        0x10,
        |_from, _rid, _args, _kw| Ok(Value::Null),
        true,
    );
    assert!(!overlapping);

    let disjoint = node_a.accept_rpc(
        Label::Int(1),
        Label::Text("m".into()),
        0xFF,
        0x11,
        |_from, _rid, _args, _kw| Ok(Value::Null),
        true,
    );
    assert!(disjoint);
}
