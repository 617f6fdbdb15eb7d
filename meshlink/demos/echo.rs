//! Two-node echo fan-in demo (spec.md §8 scenario 1, after
//! `original_source/examples/echo/client.py`): one node registers an
//! echo RPC handler, the other fires four concurrent RPCs at it and
//! prints each response as it arrives via `wait_any_rpc`.

use meshlink::{AnyFuture, Label, Node, NodeConfig, RpcOutcome, Value};
use std::time::Duration;

#[compio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    meshlink::init_tracing();

    let service_addr = "127.0.0.1:9000".parse()?;
    let client_addr = "127.0.0.1:9001".parse()?;

    let service = Node::new(service_addr, vec![], NodeConfig::default());
    service.accept_rpc(
        Label::Int(1),
        Label::Text("echo".into()),
        0,
        0,
        |_from, _routing_id, args, _kwargs| Ok(args.into_iter().next().unwrap_or(Value::Null)),
        true,
    );
    service.start().await?;

    let client = Node::new(client_addr, vec![service_addr], NodeConfig::default());
    client.start().await?;
    let timed_out = client
        .wait_on_connections(None, Some(Duration::from_secs(3)))
        .await;
    if timed_out {
        return Err("connection timeout".into());
    }

    let first = client
        .rpc(
            Label::Int(1),
            Label::Text("echo".into()),
            0,
            vec![Value::text("one")],
            vec![],
            None,
        )
        .await?;
    println!("{first:?}");

    let mut pending: Vec<AnyFuture> = Vec::new();
    for msg in ["two", "three", "four", "five"] {
        let rpc = client.send_rpc(
            Label::Int(1),
            Label::Text("echo".into()),
            0,
            vec![Value::text(msg)],
            vec![],
        )?;
        pending.push(AnyFuture::Rpc(rpc));
    }

    while !pending.is_empty() {
        let done = client.wait_any_rpc(&pending, None).await?;
        let AnyFuture::Rpc(rpc) = &done else {
            unreachable!("only Rpc futures were enqueued")
        };
        if let Some(results) = rpc.results() {
            if let Some(RpcOutcome::Ok(value)) = results.first() {
                println!("{value:?}");
            }
        }
        pending.retain(|f| match (f, &done) {
            (AnyFuture::Rpc(a), AnyFuture::Rpc(b)) => a.counter() != b.counter(),
            _ => true,
        });
    }

    client.shutdown();
    service.shutdown();
    Ok(())
}
