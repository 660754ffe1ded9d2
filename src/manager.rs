use crate::config::{validate_gateway_url, GatewayConfig, ShardingMode};
use crate::connection::{Connection, ConnectionCommand};
use crate::error::Error;
use crate::handler::{GatewayClient, GatewayHandler, GatewayInfo};
use crate::metrics::Metrics;
use crate::protocol::{OpCode, Payload, ShardDescriptor};
use crate::session::ConnectionStatus;
use crate::shard::{self, ShardPlan};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Default channel buffer size
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// Runs every shard the sharding mode selects and brings them up within the
/// identify concurrency limit.
///
/// # Thread Safety
///
/// `ShardManager` is `Send + Sync` and all methods can be safely called from
/// multiple tasks concurrently. Internal state is protected by `parking_lot::RwLock`
/// which does not poison on panic.
pub struct ShardManager<H: GatewayHandler, C: GatewayClient> {
    handler: Arc<H>,
    client: Arc<C>,
    config: Arc<GatewayConfig>,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<ManagerState>>,
    /// Serializes start/stop. A tokio Mutex so it can be held across await points.
    lifecycle_lock: Mutex<()>,
}

#[derive(Default)]
struct ManagerState {
    /// Live shards keyed by shard id (0 when unsharded)
    shards: BTreeMap<u32, ShardEntry>,
    /// One identify pipeline per concurrency bucket
    pipelines: Vec<JoinHandle<()>>,
    /// Total shard count of the running plan, `None` when unsharded
    total: Option<u32>,
    is_running: bool,
    /// Bumped per spawned shard task
    next_generation: u64,
}

struct ShardEntry {
    command_tx: mpsc::Sender<ConnectionCommand>,
    task: JoinHandle<()>,
    /// Tells a replaced task's entry apart from its successor's
    generation: u64,
}

/// Everything a pipeline needs to spawn shards
struct Spawner<H: GatewayHandler> {
    handler: Arc<H>,
    config: Arc<GatewayConfig>,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<ManagerState>>,
    base_url: String,
}

impl<H: GatewayHandler> Spawner<H> {
    /// Spawn one shard task. Returns its identify signal, or `None` when the
    /// manager stopped in the meantime.
    fn spawn_shard(&self, shard: Option<ShardDescriptor>) -> Option<oneshot::Receiver<()>> {
        let shard_id = shard.map_or(0, |s| s.id);
        let mut state = self.state.write();
        if !state.is_running {
            return None;
        }

        let (command_tx, command_rx) = mpsc::channel::<ConnectionCommand>(DEFAULT_CHANNEL_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();

        match shard {
            Some(shard) => debug!("[SHARD-{}] Creating shard {}", shard_id, shard),
            None => debug!("[SHARD-{}] Creating unsharded connection", shard_id),
        }

        let connection = Connection::new(
            shard,
            self.handler.clone(),
            self.config.clone(),
            self.base_url.clone(),
            self.metrics.clone(),
            command_rx,
            ready_tx,
        );
        self.metrics
            .update_shard(shard_id, |s| s.set_status(ConnectionStatus::Disconnected));
        let generation = state.next_generation;
        state.next_generation += 1;
        let task = tokio::spawn(run_connection_with_recovery(
            shard_id,
            generation,
            connection,
            self.metrics.clone(),
            self.state.clone(),
        ));

        let entry = ShardEntry {
            command_tx,
            task,
            generation,
        };
        if let Some(old) = state.shards.insert(shard_id, entry) {
            old.task.abort();
        }
        Some(ready_rx)
    }

    /// Bring up `ids` in order, waiting the identify delay between them.
    async fn run_pipeline(self, ids: Vec<u32>, total: Option<u32>) {
        let last = ids.len().saturating_sub(1);
        for (i, id) in ids.into_iter().enumerate() {
            let descriptor = total.map(|total| ShardDescriptor::new(id, total));
            let Some(ready) = self.spawn_shard(descriptor) else {
                return;
            };
            // Err means the shard ended before using its identify slot.
            let _ = ready.await;
            if i < last {
                tokio::time::sleep(self.config.identify_delay).await;
            }
        }
    }
}

/// Run connection with panic recovery.
///
/// A shard that ends on its own (fatal close, connect attempts exhausted,
/// panic) leaves the registry.
async fn run_connection_with_recovery<H: GatewayHandler>(
    shard_id: u32,
    generation: u64,
    connection: Connection<H>,
    metrics: Arc<Metrics>,
    state: Arc<RwLock<ManagerState>>,
) {
    let outcome = AssertUnwindSafe(connection.run()).catch_unwind().await;
    if !matches!(outcome, Ok(Ok(()))) {
        let mut state = state.write();
        if state
            .shards
            .get(&shard_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            state.shards.remove(&shard_id);
        }
    }

    match outcome {
        Ok(Ok(())) => {
            debug!("[SHARD-{}] Connection task completed normally", shard_id);
        }
        Ok(Err(e)) => {
            warn!(
                "[SHARD-{}] Connection task ended with error: {}",
                shard_id, e
            );
        }
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(
                "[SHARD-{}] Connection task PANICKED: {}. Shard is now dead.",
                shard_id, panic_msg
            );
            metrics.record_error();
            metrics.update_shard(shard_id, |s| s.set_status(ConnectionStatus::Disconnected));
        }
    }
}

impl<H: GatewayHandler, C: GatewayClient> ShardManager<H, C> {
    /// Create a new shard manager
    pub fn new(config: GatewayConfig, handler: H, client: C) -> Self {
        Self {
            handler: Arc::new(handler),
            client: Arc::new(client),
            config: Arc::new(config),
            metrics: Arc::new(Metrics::new()),
            state: Arc::new(RwLock::new(ManagerState::default())),
            lifecycle_lock: Mutex::new(()),
        }
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Get a reference to the handler
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Check if the manager is currently running
    pub fn is_running(&self) -> bool {
        self.state.read().is_running
    }

    /// Start every shard the sharding mode selects.
    ///
    /// Returns once the plan is made and the identify pipelines are spawned;
    /// shards keep coming up in the background.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if called twice, the host's error if
    /// fetching gateway parameters fails, or a configuration error for an
    /// unusable gateway URL. No shard is started in any of these cases.
    pub async fn start(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if self.state.read().is_running {
            return Err(Error::AlreadyRunning);
        }

        let info = self.gateway_info().await?;
        let guild_ids = if ShardPlan::needs_guilds(&self.config.sharding) {
            Some(self.client.fetch_current_user_guild_ids().await?)
        } else {
            None
        };

        let base_url = self.config.gateway_url.clone().unwrap_or_else(|| info.url.clone());
        validate_gateway_url(&base_url)?;

        let plan = ShardPlan::resolve(&self.config.sharding, &info, guild_ids.as_deref());
        let buckets = plan.buckets();
        let total = plan.total();

        match &plan {
            ShardPlan::Unsharded => info!("Starting unsharded connection to {}", base_url),
            ShardPlan::Sharded {
                total,
                range,
                max_concurrency,
            } => info!(
                "Starting shards {}..={} of {} in {} bucket(s) (max_concurrency {})",
                range.start(),
                range.end(),
                total,
                buckets.len(),
                max_concurrency
            ),
        }

        let mut state = self.state.write();
        state.is_running = true;
        state.total = total;
        for ids in buckets {
            let spawner = Spawner {
                handler: self.handler.clone(),
                config: self.config.clone(),
                metrics: self.metrics.clone(),
                state: self.state.clone(),
                base_url: base_url.clone(),
            };
            state
                .pipelines
                .push(tokio::spawn(spawner.run_pipeline(ids, total)));
        }

        Ok(())
    }

    /// Gateway parameters; the host is only asked when the config can't answer.
    async fn gateway_info(&self) -> Result<GatewayInfo, Error> {
        match (&self.config.sharding, &self.config.gateway_url) {
            (ShardingMode::Disabled, Some(url)) => Ok(GatewayInfo {
                url: url.clone(),
                shards: 1,
                max_concurrency: 1,
            }),
            _ => {
                let info = self.client.fetch_gateway_info().await?;
                debug!(
                    "Gateway info: url={}, shards={}, max_concurrency={}",
                    info.url, info.shards, info.max_concurrency
                );
                Ok(info)
            }
        }
    }

    /// Stop all shards gracefully
    ///
    /// Aborts pending identify pipelines, closes every shard and waits for
    /// them up to the shutdown timeout. Safe to call at any time, repeatedly.
    /// After stopping, the manager can be restarted with `start()`.
    pub async fn stop(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        let (pipelines, shards) = {
            let mut state = self.state.write();
            let was_running = state.is_running;
            state.is_running = false;
            state.total = None;
            let taken = (
                std::mem::take(&mut state.pipelines),
                std::mem::take(&mut state.shards),
            );
            if was_running {
                info!("Stopping ShardManager");
            }
            taken
        };

        for pipeline in &pipelines {
            pipeline.abort();
        }

        // Send close commands outside the lock
        for (shard_id, shard) in &shards {
            if let Err(e) = shard.command_tx.send(ConnectionCommand::Close).await {
                debug!("[SHARD-{}] Close command not delivered: {}", shard_id, e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.connection.shutdown_timeout;
        for (shard_id, shard) in shards {
            let abort = shard.task.abort_handle();
            if tokio::time::timeout_at(deadline, shard.task).await.is_err() {
                warn!("[SHARD-{}] Did not stop in time, aborting", shard_id);
                abort.abort();
            }
        }

        self.metrics.clear_shards();
        debug!("ShardManager stopped");
        Ok(())
    }

    /// Drop every shard and all registry state. Same as [`stop`](Self::stop).
    pub async fn clear(&self) -> Result<(), Error> {
        self.stop().await
    }

    /// Send an outbound payload on one shard.
    ///
    /// Only presence updates, voice state updates and member requests are
    /// accepted; the session owns every other opcode.
    pub async fn send(&self, shard_id: u32, op: OpCode, data: Value) -> Result<(), Error> {
        check_outbound(op)?;
        let command_tx = {
            let state = self.state.read();
            state.shards.get(&shard_id).map(|s| s.command_tx.clone())
        };
        let tx = command_tx.ok_or(Error::UnknownShard(shard_id))?;
        tx.send(ConnectionCommand::Send(Payload::new(op, data)))
            .await
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    /// Send an outbound payload on every shard. Returns how many shards took it.
    pub async fn broadcast(&self, op: OpCode, data: Value) -> Result<usize, Error> {
        check_outbound(op)?;
        let channels: Vec<_> = {
            let state = self.state.read();
            state
                .shards
                .iter()
                .map(|(id, s)| (*id, s.command_tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (shard_id, tx) in channels {
            match tx
                .send(ConnectionCommand::Send(Payload::new(op, data.clone())))
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => debug!("[SHARD-{}] Broadcast not delivered: {}", shard_id, e),
            }
        }
        Ok(delivered)
    }

    /// Force reconnection of a specific shard; the session is resumed.
    pub async fn reconnect_shard(&self, shard_id: u32) -> Result<(), Error> {
        let command_tx = {
            let state = self.state.read();
            state.shards.get(&shard_id).map(|s| s.command_tx.clone())
        };

        let tx = command_tx.ok_or(Error::UnknownShard(shard_id))?;
        tx.send(ConnectionCommand::Reconnect)
            .await
            .map_err(|e| Error::ChannelSend(e.to_string()))
    }

    /// Get number of shards spawned so far
    pub fn shard_count(&self) -> usize {
        self.state.read().shards.len()
    }

    /// Ids of the shards spawned so far, ascending
    pub fn shard_ids(&self) -> Vec<u32> {
        self.state.read().shards.keys().copied().collect()
    }

    /// Total shard count of the running plan, `None` when unsharded or stopped
    pub fn total_shards(&self) -> Option<u32> {
        self.state.read().total
    }

    /// Shard that receives events for `guild_id`, if the running plan is sharded
    pub fn shard_for_guild(&self, guild_id: u64) -> Option<u32> {
        self.total_shards()
            .map(|total| shard::shard_for_guild(guild_id, total))
    }

    /// Session status of one shard, `None` if it was never spawned
    pub fn status(&self, shard_id: u32) -> Option<ConnectionStatus> {
        if !self.state.read().shards.contains_key(&shard_id) {
            return None;
        }
        Some(
            self.metrics
                .shard(shard_id)
                .map_or(ConnectionStatus::Disconnected, |s| s.status),
        )
    }

    /// Last heartbeat round trip of one shard
    pub fn latency(&self, shard_id: u32) -> Option<Duration> {
        self.metrics.shard(shard_id).and_then(|s| s.latency)
    }
}

fn check_outbound(op: OpCode) -> Result<(), Error> {
    match op {
        OpCode::PresenceUpdate | OpCode::VoiceStateUpdate | OpCode::RequestGuildMembers => Ok(()),
        other => Err(Error::Protocol(format!(
            "opcode {:?} cannot be sent directly",
            other
        ))),
    }
}

impl<H: GatewayHandler, C: GatewayClient> Drop for ShardManager<H, C> {
    fn drop(&mut self) {
        // Abort all tasks to prevent orphans
        let mut state = self.state.write();
        for pipeline in state.pipelines.drain(..) {
            pipeline.abort();
        }
        for (_shard_id, shard) in std::mem::take(&mut state.shards) {
            shard.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, ShardRange};
    use crate::error::ErrorKind;
    use serde_json::json;

    struct NullHandler;

    impl GatewayHandler for NullHandler {
        async fn dispatch(&self, _shard: Option<ShardDescriptor>, _event: &str, _data: Value) {}
    }

    struct StaticClient {
        info: Option<GatewayInfo>,
    }

    impl GatewayClient for StaticClient {
        async fn fetch_gateway_info(&self) -> crate::Result<GatewayInfo> {
            self.info
                .clone()
                .ok_or_else(|| Error::Host("gateway lookup failed".to_string()))
        }
    }

    /// Port with nothing listening on it.
    fn dead_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        format!("ws://127.0.0.1:{}", port)
    }

    fn manager(sharding: ShardingMode, info: Option<GatewayInfo>) -> ShardManager<NullHandler, StaticClient> {
        let config = GatewayConfig::builder("token")
            .sharding(sharding)
            .identify_delay(Duration::from_secs(60))
            .connection(ConnectionConfig {
                shutdown_timeout: Duration::from_secs(1),
                ..ConnectionConfig::default()
            })
            .build()
            .unwrap();
        ShardManager::new(config, NullHandler, StaticClient { info })
    }

    #[tokio::test]
    async fn test_host_error_propagates_and_starts_nothing() {
        let manager = manager(ShardingMode::Auto, None);
        let err = manager.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Host);
        assert!(!manager.is_running());
        assert_eq!(manager.shard_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_gateway_url_rejected() {
        let info = GatewayInfo {
            url: "https://not-a-websocket.example".to_string(),
            shards: 1,
            max_concurrency: 1,
        };
        let manager = manager(ShardingMode::Auto, Some(info));
        let err = manager.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let manager = manager(ShardingMode::Auto, None);
        manager.stop().await.unwrap();
        manager.clear().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_and_stop() {
        let info = GatewayInfo {
            url: dead_url(),
            shards: 4,
            max_concurrency: 2,
        };
        let manager = manager(ShardingMode::Auto, Some(info));
        manager.start().await.unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.total_shards(), Some(4));
        assert!(matches!(manager.start().await, Err(Error::AlreadyRunning)));

        // First shard of each bucket comes up right away; the rest wait the identify delay.
        for _ in 0..100 {
            if manager.shard_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.shard_ids(), vec![0, 1]);
        assert!(manager.status(0).is_some());
        assert!(manager.status(2).is_none());

        manager.stop().await.unwrap();
        assert!(!manager.is_running());
        assert_eq!(manager.shard_count(), 0);
        assert_eq!(manager.total_shards(), None);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_validation() {
        let url = dead_url();
        let config = GatewayConfig::builder("token")
            .sharding(ShardingMode::Disabled)
            .gateway_url(url)
            .build()
            .unwrap();
        // No gateway info: an unsharded manager with a configured URL never asks.
        let manager = ShardManager::new(config, NullHandler, StaticClient { info: None });
        manager.start().await.unwrap();
        assert_eq!(manager.total_shards(), None);
        assert_eq!(manager.shard_for_guild(1 << 22), None);

        assert!(matches!(
            manager.send(0, OpCode::Identify, json!({})).await,
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            manager.send(9, OpCode::PresenceUpdate, json!({})).await,
            Err(Error::UnknownShard(9))
        ));
        assert!(matches!(
            manager.reconnect_shard(9).await,
            Err(Error::UnknownShard(9))
        ));

        for _ in 0..100 {
            if manager.shard_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager
            .send(0, OpCode::PresenceUpdate, json!({"status": "idle"}))
            .await
            .unwrap();
        assert_eq!(
            manager
                .broadcast(OpCode::PresenceUpdate, json!({"status": "online"}))
                .await
                .unwrap(),
            1
        );

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_shard_leaves_registry() {
        let config = GatewayConfig::builder("token")
            .sharding(ShardingMode::Disabled)
            .gateway_url(dead_url())
            .connection(ConnectionConfig {
                max_connect_attempts: 1,
                ..ConnectionConfig::default()
            })
            .build()
            .unwrap();
        let manager = ShardManager::new(config, NullHandler, StaticClient { info: None });
        manager.start().await.unwrap();

        for _ in 0..200 {
            if manager.metrics().snapshot().errors_total > 0 && manager.shard_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.shard_count(), 0);
        assert!(manager.shard_ids().is_empty());
        assert!(manager.status(0).is_none());
        assert!(matches!(
            manager.send(0, OpCode::PresenceUpdate, json!({})).await,
            Err(Error::UnknownShard(0))
        ));
        assert!(manager.is_running());

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_range_and_guild_lookup() {
        let info = GatewayInfo {
            url: dead_url(),
            shards: 1,
            max_concurrency: 16,
        };
        let manager = manager(
            ShardingMode::Manual {
                total: 8,
                range: ShardRange::Explicit { first: 2, last: 4 },
            },
            Some(info),
        );
        manager.start().await.unwrap();
        assert_eq!(manager.total_shards(), Some(8));
        assert_eq!(manager.shard_for_guild(5 << 22), Some(5));

        for _ in 0..100 {
            if manager.shard_count() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.shard_ids(), vec![2, 3, 4]);
        manager.stop().await.unwrap();
    }
}
