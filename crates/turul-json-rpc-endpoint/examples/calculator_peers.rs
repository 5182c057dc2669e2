//! Two JSON-RPC endpoints talking to each other in-process.
//!
//! The "server" side answers `add`, `divide` and a deliberately slow `slow_sum`;
//! the "client" side calls them, shows an application error passing through
//! untouched, and abandons the slow call with `wait_or_cancel`.
//!
//! Run with `RUST_LOG=debug cargo run --example calculator_peers` to see the
//! endpoint's own log output.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::info;
use turul_json_rpc_endpoint::prelude::*;

#[derive(Debug, Deserialize)]
struct Operands {
    a: f64,
    b: f64,
}

/// Shared server state: counts completed operations
#[derive(Default)]
struct Calculator {
    operations: std::sync::atomic::AtomicU64,
}

impl Calculator {
    fn record(&self) -> u64 {
        self.operations
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1
    }
}

fn operands(params: Option<RequestParams>) -> Result<Operands, HandlerError> {
    let params = params.ok_or_else(|| HandlerError::invalid_params("expected {a, b}"))?;
    Ok(params.parse()?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (server_io, client_io) = ChannelTransport::connected(32);

    let server = Endpoint::<Calculator>::builder()
        .parallelism(4)
        .on_request("add", |calc: Arc<Calculator>, params| async move {
            let Operands { a, b } = operands(params)?;
            Ok::<_, HandlerError>(json!({ "result": a + b, "operation": calc.record() }))
        })
        .on_request("divide", |calc: Arc<Calculator>, params| async move {
            let Operands { a, b } = operands(params)?;
            if b == 0.0 {
                return Err(HandlerError::rpc(
                    1001,
                    "Division by zero",
                    Some(json!({ "a": a })),
                ));
            }
            Ok::<_, HandlerError>(json!({ "result": a / b, "operation": calc.record() }))
        })
        .on_request("slow_sum", |_calc, params| async move {
            let Operands { a, b } = operands(params)?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, HandlerError>(json!({ "result": a + b }))
        })
        .build(server_io.inbound, server_io.outbound);

    let client = Endpoint::<()>::builder()
        .on_notification("log", |_ctx, params| async move {
            info!("server says: {:?}", params.map(|p| p.into_value()));
            Ok::<_, HandlerError>(())
        })
        .build(client_io.inbound, client_io.outbound);

    let server_done = server.start(Calculator::default())?;
    let client_done = client.start(())?;

    let sum = client.send_request("add", json!({ "a": 2, "b": 3 })).await?;
    println!("add(2, 3) -> {:?}", sum.await);

    let quotient = client.send_request("divide", json!({ "a": 1, "b": 0 })).await?;
    match quotient.await {
        RequestOutcome::Error(error) => println!("divide(1, 0) -> error {}", error),
        other => println!("divide(1, 0) -> {:?}", other),
    }

    let slow = client.send_request("slow_sum", json!({ "a": 1, "b": 1 })).await?;
    let outcome = slow
        .wait_or_cancel(Duration::from_millis(200), RequestOutcome::Cancelled)
        .await;
    println!("slow_sum gave up -> {:?}", outcome);

    server
        .send_notification("log", json!({ "message": "shutting down" }))
        .await?;

    println!("client: {:?}", client.shutdown().await);
    println!("server: {:?}", server.shutdown().await);
    server_done.wait().await;
    client_done.wait().await;
    Ok(())
}
