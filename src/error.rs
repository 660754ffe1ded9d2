use crate::config::ConfigError;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be passed to handler callbacks for error-type-based decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Decompression or payload decode/encode failure
    Transport,
    /// Unrecognized opcode or malformed control payload
    Protocol,
    /// Resume preconditions not met
    Session,
    /// Remote closed with a non-recoverable close code
    FatalClose,
    /// Invalid configuration
    Configuration,
    /// Connection failed (timeout, refused, etc.)
    ConnectionFailed,
    /// Host collaborator (request client) failed
    Host,
    /// Other error
    Other,
}

/// Failures of the wire codec. Fatal to the current socket only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The streaming decompressor rejected its input
    #[error("decompression failed: {0}")]
    Decompress(String),

    /// Bytes could not be turned into a payload
    #[error("decode failed: {0}")]
    Decode(String),

    /// A payload could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Errors that can occur in gateway-shard-manager
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Codec error on the current socket
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Unrecognized or malformed protocol payload
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Resume was requested without the data needed to resume
    #[error("Session error: {0}")]
    Session(String),

    /// The remote closed the connection with a code that forbids reconnecting
    #[error("Gateway closed with fatal code {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    /// Configuration rejected before any connection attempt
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Connection failed after all retry attempts
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    ConnectionFailed {
        attempts: u32,
        last_error: String,
    },

    /// The host's request client failed
    #[error("Host request failed: {0}")]
    Host(String),

    /// `start` was called on a running manager
    #[error("ShardManager is already running")]
    AlreadyRunning,

    /// No shard with this id is registered
    #[error("Unknown shard {0}")]
    UnknownShard(u32),

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Session(_) => ErrorKind::Session,
            Error::FatalClose { .. } => ErrorKind::FatalClose,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Error::Host(_) => ErrorKind::Host,
            Error::AlreadyRunning | Error::UnknownShard(_) | Error::ChannelSend(_) => ErrorKind::Other,
        }
    }

    /// Whether this error ends the shard for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::FatalClose { .. } | Error::Configuration(_) | Error::ConnectionFailed { .. }
        )
    }
}
