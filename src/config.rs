use crate::codec::{Compression, Encoding};
use crate::protocol::{ClientProperties, DEFAULT_API_VERSION};
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// How many shards to run and which ids they take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ShardingMode {
    /// One connection without a shard descriptor
    Disabled,
    /// Recommended shard count; the active range is derived from the
    /// current user's guilds when the host reports any
    #[default]
    Auto,
    /// Caller-chosen total with an explicit range policy
    Manual { total: u32, range: ShardRange },
}

/// Which ids of a manual shard total are brought up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShardRange {
    /// Every id in `[0, total)`
    #[default]
    All,
    /// Exactly `[first, last]`, used verbatim
    Explicit { first: u32, last: u32 },
    /// The `[min, max]` of the shards owning the current user's guilds
    GuildDerived,
}

/// Configuration for the shard manager
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Authentication token sent in Identify and Resume
    pub token: String,
    /// Gateway intents bitfield
    pub intents: u64,
    /// Protocol version (`v` query parameter)
    pub api_version: u8,
    /// Payload encoding
    pub encoding: Encoding,
    /// Transport compression
    pub compression: Compression,
    /// Gateway URL; fetched from the host client when `None`
    pub gateway_url: Option<String>,
    /// Shard selection
    pub sharding: ShardingMode,
    /// Initial presence sent with Identify
    pub presence: Option<Value>,
    /// Client metadata sent with Identify
    pub properties: ClientProperties,
    /// Member count above which guilds are sent without offline members (50..=250)
    pub large_threshold: Option<u8>,
    /// Delay between successive identifies in the same concurrency bucket
    pub identify_delay: Duration,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for failed connection attempts
    pub backoff: BackoffConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: 0,
            api_version: DEFAULT_API_VERSION,
            encoding: Encoding::default(),
            compression: Compression::default(),
            gateway_url: None,
            sharding: ShardingMode::default(),
            presence: None,
            properties: ClientProperties::default(),
            large_threshold: None,
            identify_delay: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Create a new builder for configuration
    pub fn builder(token: impl Into<String>) -> GatewayConfigBuilder {
        GatewayConfigBuilder {
            config: GatewayConfig {
                token: token.into(),
                ..GatewayConfig::default()
            },
        }
    }
}

/// Builder for GatewayConfig
#[derive(Debug, Clone)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn intents(mut self, intents: u64) -> Self {
        self.config.intents = intents;
        self
    }

    pub fn api_version(mut self, version: u8) -> Self {
        self.config.api_version = version;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.config.encoding = encoding;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Connect here instead of asking the host client for the gateway URL
    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = Some(url.into());
        self
    }

    pub fn sharding(mut self, mode: ShardingMode) -> Self {
        self.config.sharding = mode;
        self
    }

    pub fn presence(mut self, presence: Value) -> Self {
        self.config.presence = Some(presence);
        self
    }

    pub fn properties(mut self, properties: ClientProperties) -> Self {
        self.config.properties = properties;
        self
    }

    pub fn large_threshold(mut self, threshold: u8) -> Self {
        self.config.large_threshold = Some(threshold);
        self
    }

    pub fn identify_delay(mut self, delay: Duration) -> Self {
        self.config.identify_delay = delay;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Returns an error for invalid configurations (e.g., an empty token).
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        let config = self.config;

        if config.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        if config.api_version == 0 {
            return Err(ConfigError::InvalidVersion(0));
        }

        if let Some(threshold) = config.large_threshold {
            if !(50..=250).contains(&threshold) {
                return Err(ConfigError::InvalidLargeThreshold(threshold));
            }
        }

        if let Some(ref url) = config.gateway_url {
            validate_gateway_url(url)?;
        }

        if let ShardingMode::Manual { total, range } = config.sharding {
            if total == 0 {
                return Err(ConfigError::InvalidSharding(
                    "total shard count cannot be 0".to_string(),
                ));
            }
            if let ShardRange::Explicit { first, last } = range {
                if first > last || last >= total {
                    return Err(ConfigError::InvalidSharding(format!(
                        "range [{}, {}] is not within [0, {})",
                        first, last, total
                    )));
                }
            }
        }

        // Validate backoff config
        if config.backoff.max_delay < config.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if config.backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        let connection = &config.connection;
        if connection.connect_timeout.is_zero() || connection.hello_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "connect_timeout and hello_timeout must be > 0".to_string(),
            ));
        }

        if connection.invalid_session_delay_min > connection.invalid_session_delay_max {
            return Err(ConfigError::InvalidTimeout(
                "invalid_session_delay_min must be <= invalid_session_delay_max".to_string(),
            ));
        }

        if connection.max_connect_attempts == 0 {
            return Err(ConfigError::InvalidTimeout(
                "max_connect_attempts cannot be 0".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Accepts only absolute `ws`/`wss` URLs.
pub(crate) fn validate_gateway_url(url: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        scheme => Err(ConfigError::InvalidUrl(format!(
            "{}: unsupported scheme '{}'",
            url, scheme
        ))),
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// No token configured
    #[error("A gateway token is required")]
    MissingToken,
    /// Protocol version out of range
    #[error("Invalid API version: {0}")]
    InvalidVersion(u8),
    /// Encoding name not supported
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),
    /// Compression name not supported or unavailable
    #[error("Unsupported compression: {0}")]
    UnsupportedCompression(String),
    /// Malformed gateway URL
    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(String),
    /// Inconsistent shard settings
    #[error("Invalid sharding configuration: {0}")]
    InvalidSharding(String),
    /// Large threshold outside 50..=250
    #[error("Invalid large threshold {0}: must be between 50 and 250")]
    InvalidLargeThreshold(u8),
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid timeout configuration
    #[error("Invalid timeout configuration: {0}")]
    InvalidTimeout(String),
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// How long to wait for Hello after the socket opens
    pub hello_timeout: Duration,
    /// Fixed delay before reconnecting after a recoverable close
    pub reconnect_delay: Duration,
    /// Lower bound of the randomized wait after InvalidSession
    pub invalid_session_delay_min: Duration,
    /// Upper bound of the randomized wait after InvalidSession
    pub invalid_session_delay_max: Duration,
    /// Maximum number of consecutive failed connection attempts before giving up
    pub max_connect_attempts: u32,
    /// How long `stop` waits for a shard task before aborting it
    pub shutdown_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(5),
            invalid_session_delay_min: Duration::from_secs(1),
            invalid_session_delay_max: Duration::from_secs(6),
            max_connect_attempts: 10,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Random wait in `[invalid_session_delay_min, invalid_session_delay_max]`
    pub fn invalid_session_delay(&self) -> Duration {
        let min = self.invalid_session_delay_min.as_millis() as u64;
        let max = self.invalid_session_delay_max.as_millis() as u64;
        if max <= min {
            return self.invalid_session_delay_min;
        }
        Duration::from_millis(rand::Rng::gen_range(&mut rand::thread_rng(), min..=max))
    }
}

/// Backoff configuration for failed connection attempts
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true, // Full jitter
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}
