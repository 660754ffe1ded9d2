use crate::error::ErrorKind;
use crate::protocol::ShardDescriptor;
use serde_json::Value;
use std::future::Future;

/// Sharding parameters reported by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    /// Base gateway URL
    pub url: String,
    /// Recommended total shard count
    pub shards: u32,
    /// How many shards may identify at the same time
    pub max_concurrency: u32,
}

/// Trait that users implement to receive gateway events.
///
/// The manager owns sockets, heartbeats and reconnects; the handler only sees
/// application events and lifecycle signals. Every shard calls into the same
/// handler, so implementations must be `Send + Sync`.
///
/// # Example
///
/// ```ignore
/// use gateway_shard_manager::{GatewayHandler, ShardDescriptor};
/// use serde_json::Value;
///
/// struct Logger;
///
/// impl GatewayHandler for Logger {
///     async fn dispatch(&self, shard: Option<ShardDescriptor>, event: &str, data: Value) {
///         println!("{:?} {} {}", shard, event, data);
///     }
/// }
/// ```
pub trait GatewayHandler: Send + Sync + 'static {
    /// Called for every Dispatch payload, `READY` and `RESUMED` included.
    ///
    /// Payloads of one shard are delivered in order; the shard does not read
    /// the socket again until this future completes.
    fn dispatch(
        &self,
        shard: Option<ShardDescriptor>,
        event: &str,
        data: Value,
    ) -> impl Future<Output = ()> + Send;

    /// Lifecycle debug signal
    fn on_debug(&self, _shard: Option<ShardDescriptor>, _message: &str) {}

    /// Lifecycle warning signal
    fn on_warn(&self, _shard: Option<ShardDescriptor>, _message: &str) {}

    /// Called when an error occurs.
    ///
    /// Receives the error kind for type-based decision making and the error message.
    fn on_error(&self, _shard: Option<ShardDescriptor>, _kind: ErrorKind, _message: &str) {}

    /// Called after a socket closed, before the session decides what to do next.
    fn on_close(&self, _shard: Option<ShardDescriptor>, _code: u16, _reason: &str) {}
}

/// Host services the coordinator needs to plan shards.
pub trait GatewayClient: Send + Sync + 'static {
    /// Recommended shard count, identify concurrency and gateway URL.
    fn fetch_gateway_info(&self) -> impl Future<Output = crate::Result<GatewayInfo>> + Send;

    /// Guild ids of the current user; used to derive the active shard range.
    ///
    /// Defaults to an empty list, which selects every shard.
    fn fetch_current_user_guild_ids(&self) -> impl Future<Output = crate::Result<Vec<u64>>> + Send {
        async { Ok(Vec::new()) }
    }
}
