//! End-to-end tests against a loopback websocket server playing the gateway.

use flate2::{Compress, FlushCompress};
use futures_util::{SinkExt, StreamExt};
use gateway_shard_manager::{
    etf, Compression, ConnectionConfig, Encoding, Error, ErrorKind, GatewayClient, GatewayConfig,
    GatewayHandler, GatewayInfo, OpCode, ShardDescriptor, ShardManager, ShardRange, ShardingMode,
};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const STEP: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

#[derive(Debug)]
enum Signal {
    Dispatch(Option<ShardDescriptor>, String, Value),
    Close(u16),
    Error(ErrorKind),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Signal>,
}

impl GatewayHandler for Recorder {
    async fn dispatch(&self, shard: Option<ShardDescriptor>, event: &str, data: Value) {
        let _ = self.tx.send(Signal::Dispatch(shard, event.to_string(), data));
    }

    fn on_error(&self, _shard: Option<ShardDescriptor>, kind: ErrorKind, _message: &str) {
        let _ = self.tx.send(Signal::Error(kind));
    }

    fn on_close(&self, _shard: Option<ShardDescriptor>, code: u16, _reason: &str) {
        let _ = self.tx.send(Signal::Close(code));
    }
}

struct Host {
    url: String,
    shards: u32,
    max_concurrency: u32,
}

impl GatewayClient for Host {
    async fn fetch_gateway_info(&self) -> gateway_shard_manager::Result<GatewayInfo> {
        Ok(GatewayInfo {
            url: self.url.clone(),
            shards: self.shards,
            max_concurrency: self.max_concurrency,
        })
    }
}

/// What the server saw next on a socket
#[derive(Debug)]
enum Frame {
    Payload(Value),
    Close(Option<u16>),
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = timeout(STEP, listener.accept())
        .await
        .expect("client never connected")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn next_frame(ws: &mut ServerSocket) -> Frame {
    loop {
        let message = timeout(STEP, ws.next()).await.expect("client went quiet");
        match message {
            Some(Ok(Message::Text(text))) => return Frame::Payload(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Binary(data))) => return Frame::Payload(etf::decode(&data).unwrap()),
            Some(Ok(Message::Close(frame))) => return Frame::Close(frame.map(|f| u16::from(f.code))),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return Frame::Close(None),
        }
    }
}

async fn next_payload(ws: &mut ServerSocket) -> Value {
    match next_frame(ws).await {
        Frame::Payload(value) => value,
        Frame::Close(code) => panic!("expected a payload, socket closed with {:?}", code),
    }
}

async fn send(ws: &mut ServerSocket, op: u8, d: Value, s: Option<u64>, t: Option<&str>) {
    let payload = json!({ "op": op, "d": d, "s": s, "t": t });
    ws.send(Message::Text(payload.to_string())).await.unwrap();
}

async fn hello(ws: &mut ServerSocket, interval_ms: u64) {
    send(ws, 10, json!({ "heartbeat_interval": interval_ms }), None, None).await;
}

async fn ready(ws: &mut ServerSocket, session_id: &str, resume_url: &str, seq: u64) {
    send(
        ws,
        0,
        json!({ "v": 10, "session_id": session_id, "resume_gateway_url": resume_url }),
        Some(seq),
        Some("READY"),
    )
    .await;
}

async fn close_with(ws: &mut ServerSocket, code: u16) {
    let _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        }))
        .await;
}

async fn next_dispatch(rx: &mut mpsc::UnboundedReceiver<Signal>) -> (Option<ShardDescriptor>, String, Value) {
    loop {
        match timeout(STEP, rx.recv()).await.expect("no dispatch").unwrap() {
            Signal::Dispatch(shard, event, data) => return (shard, event, data),
            _ => continue,
        }
    }
}

async fn next_close(rx: &mut mpsc::UnboundedReceiver<Signal>) -> u16 {
    loop {
        match timeout(STEP, rx.recv()).await.expect("no close").unwrap() {
            Signal::Close(code) => return code,
            _ => continue,
        }
    }
}

fn config(sharding: ShardingMode) -> GatewayConfig {
    GatewayConfig::builder("test-token")
        .intents(513)
        .sharding(sharding)
        .identify_delay(Duration::from_millis(300))
        .connection(ConnectionConfig {
            reconnect_delay: Duration::from_millis(100),
            invalid_session_delay_min: Duration::from_millis(10),
            invalid_session_delay_max: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(2),
            ..ConnectionConfig::default()
        })
        .build()
        .unwrap()
}

fn single_shard() -> ShardingMode {
    ShardingMode::Manual {
        total: 1,
        range: ShardRange::All,
    }
}

#[tokio::test]
async fn test_identify_dispatch_close_and_resume() {
    let (listener, url) = listen().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = ShardManager::new(
        config(single_shard()),
        Recorder { tx },
        Host {
            url: url.clone(),
            shards: 1,
            max_concurrency: 1,
        },
    );
    manager.start().await.unwrap();

    let mut ws = accept(&listener).await;
    hello(&mut ws, 60_000).await;
    let identify = next_payload(&mut ws).await;
    assert_eq!(identify["op"], json!(2));
    assert_eq!(identify["d"]["token"], json!("test-token"));
    assert_eq!(identify["d"]["intents"], json!(513));
    assert_eq!(identify["d"]["shard"], json!([0, 1]));

    // READY announces a different host for resuming.
    let (resume_listener, resume_url) = listen().await;
    ready(&mut ws, "sess-1", &resume_url, 1).await;
    send(&mut ws, 0, json!({ "content": "hi" }), Some(2), Some("MESSAGE_CREATE")).await;

    let (shard, event, _) = next_dispatch(&mut rx).await;
    assert_eq!(shard, Some(ShardDescriptor::new(0, 1)));
    assert_eq!(event, "READY");
    let (_, event, data) = next_dispatch(&mut rx).await;
    assert_eq!(event, "MESSAGE_CREATE");
    assert_eq!(data["content"], json!("hi"));

    // A recoverable close: one reconnect to the resume host, and the session
    // is resumed.
    close_with(&mut ws, 4000).await;
    drop(ws);
    assert_eq!(next_close(&mut rx).await, 4000);

    let mut ws = accept(&resume_listener).await;
    hello(&mut ws, 60_000).await;
    let resume = next_payload(&mut ws).await;
    assert_eq!(resume["op"], json!(6));
    assert_eq!(
        resume["d"],
        json!({ "token": "test-token", "session_id": "sess-1", "seq": 2 })
    );
    send(&mut ws, 0, Value::Null, Some(3), Some("RESUMED")).await;
    let (_, event, _) = next_dispatch(&mut rx).await;
    assert_eq!(event, "RESUMED");

    let metrics = manager.metrics();
    assert_eq!(metrics.identifies(), 1);
    assert_eq!(metrics.resumes(), 1);
    assert_eq!(metrics.reconnections(), 1);

    // Shutdown closes with a normal code.
    manager.stop().await.unwrap();
    match next_frame(&mut ws).await {
        Frame::Close(code) => assert_eq!(code, Some(1000)),
        Frame::Payload(p) => panic!("unexpected payload {}", p),
    }
    assert_eq!(next_close(&mut rx).await, 1000);
    assert!(!manager.is_running());

    // The base host was only dialled once.
    assert!(timeout(Duration::from_millis(200), listener.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn test_missed_heartbeat_ack_resumes() {
    let (listener, url) = listen().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = ShardManager::new(
        config(single_shard()),
        Recorder { tx },
        Host {
            url: url.clone(),
            shards: 1,
            max_concurrency: 1,
        },
    );
    manager.start().await.unwrap();

    let mut ws = accept(&listener).await;
    hello(&mut ws, 200).await;
    assert_eq!(next_payload(&mut ws).await["op"], json!(2));
    ready(&mut ws, "sess-hb", &url, 7).await;

    // The first beat is jittered and may go out before READY lands.
    let beat = next_payload(&mut ws).await;
    assert_eq!(beat["op"], json!(1));
    assert!(beat["d"] == json!(7) || beat["d"].is_null(), "{}", beat);

    // The next deadline closes the socket instead of beating again.
    match next_frame(&mut ws).await {
        Frame::Close(code) => assert_eq!(code, Some(4000)),
        Frame::Payload(p) => panic!("expected close, got {}", p),
    }
    drop(ws);
    assert_eq!(next_close(&mut rx).await, 4000);

    let mut ws = accept(&listener).await;
    hello(&mut ws, 60_000).await;
    let resume = next_payload(&mut ws).await;
    assert_eq!(resume["op"], json!(6));
    assert_eq!(resume["d"]["session_id"], json!("sess-hb"));
    assert_eq!(resume["d"]["seq"], json!(7));

    assert_eq!(manager.metrics().heartbeats_missed(), 1);
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_ack_records_latency() {
    let (listener, url) = listen().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let manager = ShardManager::new(
        config(single_shard()),
        Recorder { tx },
        Host {
            url: url.clone(),
            shards: 1,
            max_concurrency: 1,
        },
    );
    manager.start().await.unwrap();

    let mut ws = accept(&listener).await;
    hello(&mut ws, 100).await;
    assert_eq!(next_payload(&mut ws).await["op"], json!(2));

    // Server-requested beat goes out immediately, before the schedule.
    send(&mut ws, 1, Value::Null, None, None).await;
    let beat = next_payload(&mut ws).await;
    assert_eq!(beat["op"], json!(1));
    send(&mut ws, 11, Value::Null, None, None).await;

    // Keep acking scheduled beats.
    for _ in 0..3 {
        assert_eq!(next_payload(&mut ws).await["op"], json!(1));
        send(&mut ws, 11, Value::Null, None, None).await;
    }

    let metrics = manager.metrics();
    for _ in 0..100 {
        if metrics.heartbeats_acked() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(metrics.heartbeats_acked() >= 4);
    assert_eq!(metrics.heartbeats_missed(), 0);
    assert!(manager.latency(0).is_some());
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_session_resumable_resumes() {
    let (listener, url) = listen().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let manager = ShardManager::new(
        config(single_shard()),
        Recorder { tx },
        Host {
            url: url.clone(),
            shards: 1,
            max_concurrency: 1,
        },
    );
    manager.start().await.unwrap();

    let mut ws = accept(&listener).await;
    hello(&mut ws, 60_000).await;
    assert_eq!(next_payload(&mut ws).await["op"], json!(2));
    ready(&mut ws, "sess-inv", &url, 4).await;
    send(&mut ws, 9, json!(true), None, None).await;

    match next_frame(&mut ws).await {
        Frame::Close(code) => assert_eq!(code, Some(4000)),
        Frame::Payload(p) => panic!("expected close, got {}", p),
    }
    drop(ws);

    let mut ws = accept(&listener).await;
    hello(&mut ws, 60_000).await;
    let resume = next_payload(&mut ws).await;
    assert_eq!(resume["op"], json!(6));
    assert_eq!(resume["d"]["seq"], json!(4));

    // Not resumable this time: a fresh identify follows.
    send(&mut ws, 9, json!(false), None, None).await;
    match next_frame(&mut ws).await {
        Frame::Close(code) => assert_eq!(code, Some(1000)),
        Frame::Payload(p) => panic!("expected close, got {}", p),
    }
    drop(ws);

    let mut ws = accept(&listener).await;
    hello(&mut ws, 60_000).await;
    assert_eq!(next_payload(&mut ws).await["op"], json!(2));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_fatal_close_stops_shard() {
    let (listener, url) = listen().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = ShardManager::new(
        config(single_shard()),
        Recorder { tx },
        Host {
            url,
            shards: 1,
            max_concurrency: 1,
        },
    );
    manager.start().await.unwrap();

    let mut ws = accept(&listener).await;
    hello(&mut ws, 60_000).await;
    assert_eq!(next_payload(&mut ws).await["op"], json!(2));
    close_with(&mut ws, 4004).await;

    let mut saw_close = false;
    let mut saw_fatal = false;
    while !(saw_close && saw_fatal) {
        match timeout(STEP, rx.recv()).await.expect("no signal").unwrap() {
            Signal::Close(code) => {
                assert_eq!(code, 4004);
                saw_close = true;
            }
            Signal::Error(ErrorKind::FatalClose) => saw_fatal = true,
            _ => {}
        }
    }

    // No reconnect, not even after several reconnect delays.
    assert!(timeout(Duration::from_millis(500), listener.accept())
        .await
        .is_err());
    assert_eq!(manager.metrics().fatal_closes(), 1);
    assert_eq!(manager.shard_count(), 0);
    assert!(manager.status(0).is_none());
    assert!(matches!(
        manager.send(0, OpCode::PresenceUpdate, json!({})).await,
        Err(Error::UnknownShard(0))
    ));
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_identify_buckets_respect_delay() {
    let (listener, url) = listen().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let manager = ShardManager::new(
        config(ShardingMode::Auto),
        Recorder { tx },
        Host {
            url: url.clone(),
            shards: 4,
            max_concurrency: 2,
        },
    );

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(u64, Instant)>();
    let server = tokio::spawn(async move {
        loop {
            let mut ws = accept(&listener).await;
            let seen_tx = seen_tx.clone();
            let url = url.clone();
            tokio::spawn(async move {
                hello(&mut ws, 60_000).await;
                let identify = next_payload(&mut ws).await;
                let shard_id = identify["d"]["shard"][0].as_u64().unwrap();
                let _ = seen_tx.send((shard_id, Instant::now()));
                ready(&mut ws, &format!("sess-{}", shard_id), &url, 1).await;
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    manager.start().await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 4 {
        seen.push(timeout(STEP, seen_rx.recv()).await.unwrap().unwrap());
    }
    let at = |id: u64| seen.iter().find(|(shard, _)| *shard == id).unwrap().1;

    // Buckets {0, 2} and {1, 3} run side by side.
    let order: Vec<u64> = seen.iter().map(|(id, _)| *id).collect();
    assert!(order[..2].contains(&0) && order[..2].contains(&1), "{:?}", order);
    assert!(at(2).duration_since(at(0)) >= Duration::from_millis(250));
    assert!(at(3).duration_since(at(1)) >= Duration::from_millis(250));

    assert_eq!(manager.shard_ids(), vec![0, 1, 2, 3]);
    manager.stop().await.unwrap();
    server.abort();
}

/// Compress each message with a sync flush on one shared context.
fn zlib_frames(compressor: &mut Compress, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 64);
    let mut offset = 0;
    loop {
        out.reserve(256);
        let before = compressor.total_in();
        compressor
            .compress_vec(&message[offset..], &mut out, FlushCompress::Sync)
            .unwrap();
        offset += (compressor.total_in() - before) as usize;
        if offset >= message.len() && out.ends_with(&[0, 0, 0xFF, 0xFF]) {
            return out;
        }
    }
}

#[tokio::test]
async fn test_etf_over_zlib_stream() {
    let (listener, url) = listen().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = GatewayConfig::builder("test-token")
        .encoding(Encoding::Etf)
        .compression(Compression::ZlibStream)
        .sharding(ShardingMode::Disabled)
        .gateway_url(url.clone())
        .build()
        .unwrap();
    let manager = ShardManager::new(
        config,
        Recorder { tx },
        Host {
            url: url.clone(),
            shards: 1,
            max_concurrency: 1,
        },
    );
    manager.start().await.unwrap();

    let (stream, _) = timeout(STEP, listener.accept()).await.unwrap().unwrap();
    let mut request_uri = String::new();
    let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        request_uri = req.uri().to_string();
        Ok(resp)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, capture)
        .await
        .unwrap();
    assert!(request_uri.contains("encoding=etf"), "{}", request_uri);
    assert!(request_uri.contains("compress=zlib-stream"), "{}", request_uri);

    let mut compressor = Compress::new(flate2::Compression::default(), true);
    let hello = json!({ "op": 10, "d": { "heartbeat_interval": 60_000 }, "s": null, "t": null });
    let frame = zlib_frames(&mut compressor, &etf::encode(&hello).unwrap());
    // Split across two frames; only the second completes the message.
    let (head, tail) = frame.split_at(frame.len() / 2);
    ws.send(Message::Binary(head.to_vec())).await.unwrap();
    ws.send(Message::Binary(tail.to_vec())).await.unwrap();

    // Outbound payloads are binary terms, never compressed.
    let identify = next_payload(&mut ws).await;
    assert_eq!(identify["op"], json!(2));
    assert!(identify["d"].get("shard").is_none());

    let event = json!({
        "op": 0,
        "d": { "id": "175928847299117063", "count": 3, "flags": [true, false], "ratio": 0.5 },
        "s": 1,
        "t": "GUILD_CREATE"
    });
    let frame = zlib_frames(&mut compressor, &etf::encode(&event).unwrap());
    ws.send(Message::Binary(frame)).await.unwrap();

    let (shard, event_name, data) = next_dispatch(&mut rx).await;
    assert_eq!(shard, None);
    assert_eq!(event_name, "GUILD_CREATE");
    assert_eq!(data, event["d"]);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_outbound_send_reaches_socket() {
    let (listener, url) = listen().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = ShardManager::new(
        config(single_shard()),
        Recorder { tx },
        Host {
            url: url.clone(),
            shards: 1,
            max_concurrency: 1,
        },
    );
    manager.start().await.unwrap();

    let mut ws = accept(&listener).await;
    hello(&mut ws, 60_000).await;
    assert_eq!(next_payload(&mut ws).await["op"], json!(2));
    ready(&mut ws, "sess-out", &url, 1).await;

    let presence = json!({ "status": "dnd", "afk": false, "since": null, "activities": [] });
    manager
        .send(0, OpCode::PresenceUpdate, presence.clone())
        .await
        .unwrap();
    let payload = next_payload(&mut ws).await;
    assert_eq!(payload["op"], json!(3));
    assert_eq!(payload["d"], presence);

    manager.reconnect_shard(0).await.unwrap();
    match next_frame(&mut ws).await {
        Frame::Close(code) => assert_eq!(code, Some(4000)),
        Frame::Payload(p) => panic!("expected close, got {}", p),
    }
    drop(ws);
    assert_eq!(next_close(&mut rx).await, 4000);

    let mut ws = accept(&listener).await;
    hello(&mut ws, 60_000).await;
    assert_eq!(next_payload(&mut ws).await["op"], json!(6));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_frame_closes_and_resumes() {
    let (listener, url) = listen().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = ShardManager::new(
        config(single_shard()),
        Recorder { tx },
        Host {
            url: url.clone(),
            shards: 1,
            max_concurrency: 1,
        },
    );
    manager.start().await.unwrap();

    let mut ws = accept(&listener).await;
    hello(&mut ws, 60_000).await;
    assert_eq!(next_payload(&mut ws).await["op"], json!(2));
    ready(&mut ws, "sess-bad", &url, 3).await;
    let (_, event, _) = next_dispatch(&mut rx).await;
    assert_eq!(event, "READY");

    ws.send(Message::Text("{ not json".to_string())).await.unwrap();
    match next_frame(&mut ws).await {
        Frame::Close(code) => assert_eq!(code, Some(4000)),
        Frame::Payload(p) => panic!("expected close, got {}", p),
    }
    drop(ws);

    let mut saw_transport = false;
    loop {
        match timeout(STEP, rx.recv()).await.expect("no signal").unwrap() {
            Signal::Error(ErrorKind::Transport) => saw_transport = true,
            Signal::Close(code) => {
                assert_eq!(code, 4000);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_transport);

    let mut ws = accept(&listener).await;
    hello(&mut ws, 60_000).await;
    let resume = next_payload(&mut ws).await;
    assert_eq!(resume["op"], json!(6));
    assert_eq!(resume["d"]["seq"], json!(3));

    manager.stop().await.unwrap();
}
