//! Example: a shard manager against an in-process echo gateway
//!
//! The demo spawns a tiny gateway on localhost that says Hello, answers
//! Identify with READY, acknowledges heartbeats and echoes every presence
//! update back as a `PRESENCE_UPDATE` dispatch. Two shards connect to it.
//!
//! Run with: cargo run --example echo_gateway

use futures_util::{SinkExt, StreamExt};
use gateway_shard_manager::{
    ErrorKind, GatewayClient, GatewayConfig, GatewayHandler, GatewayInfo, OpCode,
    ShardDescriptor, ShardManager, ShardingMode,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use tracing_subscriber::filter::EnvFilter;

/// Logs every dispatch it receives
struct EchoHandler;

impl GatewayHandler for EchoHandler {
    async fn dispatch(&self, shard: Option<ShardDescriptor>, event: &str, data: Value) {
        let shard = shard.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
        info!("[SHARD-{}] {} {}", shard, event, data);
    }

    fn on_error(&self, shard: Option<ShardDescriptor>, kind: ErrorKind, message: &str) {
        warn!("{:?} {:?}: {}", shard, kind, message);
    }
}

/// Points every shard at the local gateway
struct LocalClient {
    url: String,
}

impl GatewayClient for LocalClient {
    async fn fetch_gateway_info(&self) -> gateway_shard_manager::Result<GatewayInfo> {
        Ok(GatewayInfo {
            url: self.url.clone(),
            shards: 2,
            max_concurrency: 1,
        })
    }
}

async fn serve(stream: TcpStream, url: String) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    let mut seq = 0u64;
    let frame = |op: u8, d: Value, s: Option<u64>, t: Option<&str>| {
        Message::Text(json!({ "op": op, "d": d, "s": s, "t": t }).to_string())
    };

    ws.send(frame(10, json!({ "heartbeat_interval": 5_000 }), None, None))
        .await?;

    while let Some(message) = ws.next().await {
        let payload: Value = match message? {
            Message::Text(text) => serde_json::from_str(&text)?,
            Message::Close(_) => break,
            _ => continue,
        };
        match payload["op"].as_u64() {
            Some(1) => ws.send(frame(11, Value::Null, None, None)).await?,
            Some(2) => {
                seq += 1;
                let ready = json!({
                    "v": 10,
                    "session_id": format!("echo-{}", payload["d"]["shard"][0]),
                    "resume_gateway_url": url,
                    "shard": payload["d"]["shard"],
                });
                ws.send(frame(0, ready, Some(seq), Some("READY"))).await?;
            }
            Some(3) => {
                seq += 1;
                ws.send(frame(0, payload["d"].clone(), Some(seq), Some("PRESENCE_UPDATE")))
                    .await?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing; RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    let server_url = url.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let url = server_url.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(stream, url).await {
                    warn!("Echo gateway connection failed: {}", e);
                }
            });
        }
    });

    let config = GatewayConfig::builder("demo-token")
        .intents(513)
        .sharding(ShardingMode::Auto)
        .identify_delay(Duration::from_millis(500))
        .build()?;

    let manager = ShardManager::new(config, EchoHandler, LocalClient { url });
    manager.start().await?;

    info!("Manager started with {} shards", manager.shard_count());

    // Give both shards time to identify.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let presence = json!({ "status": "idle", "afk": false, "since": null, "activities": [] });
    let sent = manager.broadcast(OpCode::PresenceUpdate, presence).await?;
    info!("Presence update sent to {} shards", sent);

    tokio::time::sleep(Duration::from_secs(1)).await;
    info!("Metrics: {:?}", manager.metrics().snapshot());

    manager.stop().await?;
    info!("Manager stopped");

    Ok(())
}
