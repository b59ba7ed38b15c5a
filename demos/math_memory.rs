//! Math service on the in-process broker.
//!
//! Run with: cargo run --example math_memory
//!
//! Set `RUST_LOG=mom_push=debug` to watch the call lifecycle.

use std::time::Duration;

use mom_push::{Result, RpcConfig, RpcService};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct MathRequest {
    a: i32,
    b: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogEvent {
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = RpcConfig::memory("math")
        .with_routes_json(r#"{ "math.add": { "timeToLive": 5000 }, "slow.op": { "timeToLive": 50 } }"#)?;

    let service = RpcService::connect(config).await?;

    service
        .add_worker("math.add", |req: MathRequest| async move {
            Ok::<_, String>(req.a + req.b)
        })
        .await?;

    service
        .add_worker("math.div", |req: MathRequest| async move {
            if req.b == 0 {
                Err("div_by_zero".to_string())
            } else {
                Ok(req.a / req.b)
            }
        })
        .await?;

    service
        .add_worker("log.event", |event: LogEvent| async move {
            println!("log.event: {}", event.message);
            Ok::<_, String>(())
        })
        .await?;

    let sum: i32 = service
        .client("math.add")
        .call(&MathRequest { a: 20, b: 3 })
        .await?;
    println!("20 + 3 = {sum}");

    match service
        .client("math.div")
        .call::<_, i32>(&MathRequest { a: 1, b: 0 })
        .await
    {
        Ok(quotient) => println!("1 / 0 = {quotient}?"),
        Err(err) => println!("1 / 0 failed: {err}"),
    }

    // Nobody serves slow.op, so this runs into its 50ms time-to-live.
    match service
        .client("slow.op")
        .call::<_, i32>(&MathRequest { a: 0, b: 0 })
        .await
    {
        Ok(value) => println!("slow.op = {value}"),
        Err(err) => println!("slow.op: {err}"),
    }

    service
        .client("log.event")
        .send(&LogEvent {
            message: "demo finished".into(),
        })
        .await;

    // Give the log worker a moment before shutting down.
    tokio::time::sleep(Duration::from_millis(50)).await;

    service.close().await
}
