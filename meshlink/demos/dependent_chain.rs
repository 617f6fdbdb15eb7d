//! Dependent-chain demo (spec.md §8 scenario 5): `a.after(...)` returns a
//! pending RPC, `b.after(...)` sums the results, demonstrating the
//! transfer rule and multi-stage dataflow composition over the wire.

use meshlink::core::future::{CallbackOutput, Completion};
use meshlink::{Label, Node, NodeConfig, RpcOutcome, Value};
use std::time::Duration;

#[compio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    meshlink::init_tracing();

    let doubler_addr = "127.0.0.1:9100".parse()?;
    let caller_addr = "127.0.0.1:9101".parse()?;

    let doubler = Node::new(doubler_addr, vec![], NodeConfig::default());
    doubler.accept_rpc(
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
    doubler.start().await?;

    let caller = Node::new(caller_addr, vec![doubler_addr], NodeConfig::default());
    caller.start().await?;
    if caller
        .wait_on_connections(None, Some(Duration::from_secs(3)))
        .await
    {
        return Err("connection timeout".into());
    }

    let a = caller.send_rpc(Label::Int(1), Label::Text("double".into()), 0, vec![Value::Int(3)], vec![])?;

    let caller_for_b = caller.clone();
    let b = a.after(caller.client(), vec![], move |results| {
        let Completion::Rpc(outcomes) = &results[0] else {
            return CallbackOutput::Value(Value::Null);
        };
        let RpcOutcome::Ok(Value::Int(n)) = &outcomes[0] else {
            return CallbackOutput::Value(Value::Null);
        };
        let rpc = caller_for_b
            .send_rpc(Label::Int(1), Label::Text("double".into()), 0, vec![Value::Int(*n)], vec![])
            .expect("nested rpc should be routable");
        CallbackOutput::Pending(rpc)
    });

    let c = b.after(caller.client(), vec![], |results| {
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

    let result = c.wait(caller.client(), Some(Duration::from_secs(5))).await?;
    println!("3 doubled twice, via a dependent chain: {result:?}");

    caller.shutdown();
    doubler.shutdown();
    Ok(())
}
