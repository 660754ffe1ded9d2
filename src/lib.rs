//! # gateway-shard-manager
//!
//! A sharded client for real-time gateways that speak the opcode/dispatch
//! protocol (Hello, Identify, Resume, heartbeats, dispatch events).
//!
//! ## Features
//!
//! - **Wire codec** for JSON text frames and binary term-format frames, with
//!   `zlib-stream` or `zstd-stream` transport compression
//! - **Sessions** that heartbeat with jitter, detect missed acks and resume
//!   after recoverable closes
//! - **Sharding** with guild-derived ranges and identify buckets that respect
//!   the gateway's `max_concurrency`
//! - **Auto-reconnection** with exponential backoff and full jitter
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use gateway_shard_manager::{GatewayConfig, GatewayHandler, ShardManager};
//!
//! struct MyHandler;
//!
//! impl GatewayHandler for MyHandler {
//!     // ... implement `dispatch`
//! }
//!
//! let config = GatewayConfig::builder(token)
//!     .intents(513)
//!     .build()?;
//!
//! let manager = ShardManager::new(config, MyHandler, my_rest_client);
//! manager.start().await?;
//! ```

mod codec;
mod compression;
mod config;
mod connection;
mod error;
pub mod etf;
mod handler;
mod heartbeat;
mod manager;
mod metrics;
mod protocol;
mod session;
mod shard;

pub use codec::{Compression, Encoding, TransportCodec};
pub use compression::{Decompressor, ZlibStream, ZstdStream, ZLIB_SUFFIX};
pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, GatewayConfig, GatewayConfigBuilder, ShardRange,
    ShardingMode,
};
pub use error::{Error, ErrorKind, TransportError};
pub use handler::{GatewayClient, GatewayHandler, GatewayInfo};
pub use heartbeat::{HeartbeatPhase, HeartbeatScheduler};
pub use manager::ShardManager;
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{
    classify_close, close_description, ClientProperties, CloseAction, OpCode, Payload,
    ShardDescriptor,
};
pub use session::{CloseOutcome, ConnectionStatus, Session, SessionAction, SessionInfo};
pub use shard::{bucketize, guild_shard_range, shard_for_guild, ShardPlan};

/// Result type for gateway-shard-manager operations
pub type Result<T> = std::result::Result<T, Error>;
