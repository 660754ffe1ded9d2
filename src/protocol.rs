//! Wire-level vocabulary: the payload envelope, opcodes, control payload
//! bodies and the close-code table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Gateway protocol version sent in the connection URL
pub const DEFAULT_API_VERSION: u8 = 10;

/// Dispatch event that carries the new session id and resume URL
pub const READY_EVENT: &str = "READY";

/// Dispatch event confirming a successful resume
pub const RESUMED_EVENT: &str = "RESUMED";

/// Gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Application event; `t`/`d` carry name and body
    Dispatch = 0,
    /// Keep-alive beat, or a server request for one
    Heartbeat = 1,
    /// Start a new session
    Identify = 2,
    /// Update the client's presence
    PresenceUpdate = 3,
    /// Join, move or leave a voice channel
    VoiceStateUpdate = 4,
    /// Resume a previous session
    Resume = 6,
    /// Server asks the client to reconnect
    Reconnect = 7,
    /// Request members of a guild
    RequestGuildMembers = 8,
    /// Session is invalid; `d` is the resumable flag
    InvalidSession = 9,
    /// Handshake; carries the heartbeat interval
    Hello = 10,
    /// Acknowledges the last heartbeat
    HeartbeatAck = 11,
}

impl OpCode {
    /// Map a raw opcode, `None` for values this crate does not know.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => OpCode::Dispatch,
            1 => OpCode::Heartbeat,
            2 => OpCode::Identify,
            3 => OpCode::PresenceUpdate,
            4 => OpCode::VoiceStateUpdate,
            6 => OpCode::Resume,
            7 => OpCode::Reconnect,
            8 => OpCode::RequestGuildMembers,
            9 => OpCode::InvalidSession,
            10 => OpCode::Hello,
            11 => OpCode::HeartbeatAck,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

impl From<OpCode> for u64 {
    fn from(op: OpCode) -> Self {
        u64::from(op.as_u8())
    }
}

/// The unit of wire exchange.
///
/// Field names are fixed by the remote service. `s` and `t` are always
/// serialized, as `null` when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Raw opcode; values outside the known set decode fine and are ignored
    pub op: u64,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl Payload {
    /// Build an outbound payload; `s` and `t` are only set by the server.
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op: op.into(),
            d,
            s: None,
            t: None,
        }
    }

    /// Build an inbound dispatch payload.
    pub fn dispatch(event: impl Into<String>, sequence: u64, d: Value) -> Self {
        Self {
            op: OpCode::Dispatch.into(),
            d,
            s: Some(sequence),
            t: Some(event.into()),
        }
    }

    /// Heartbeat carrying the last sequence number seen, or null.
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(
            OpCode::Heartbeat,
            sequence.map(Value::from).unwrap_or(Value::Null),
        )
    }

    pub fn opcode(&self) -> Option<OpCode> {
        u8::try_from(self.op).ok().and_then(OpCode::from_u8)
    }
}

/// Identifies one connection's slice of the event space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardDescriptor {
    pub id: u32,
    pub total: u32,
}

impl ShardDescriptor {
    pub fn new(id: u32, total: u32) -> Self {
        Self { id, total }
    }
}

impl fmt::Display for ShardDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.total)
    }
}

impl Serialize for ShardDescriptor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.id, self.total].serialize(serializer)
    }
}

/// Body of the Hello payload
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// The subset of the READY dispatch the session itself needs
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default, alias = "resume_url")]
    pub resume_gateway_url: Option<String>,
}

/// Client metadata sent with Identify
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Body of the Identify payload
#[derive(Debug, Clone, Serialize)]
pub struct Identify<'a> {
    pub token: &'a str,
    pub properties: &'a ClientProperties,
    pub compress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<&'a Value>,
    pub intents: u64,
}

/// Body of the Resume payload
#[derive(Debug, Clone, Serialize)]
pub struct Resume<'a> {
    pub token: &'a str,
    pub session_id: &'a str,
    pub seq: u64,
}

/// What a close code allows the session to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and try to resume
    Resume,
    /// Reconnect with a brand-new session
    Reidentify,
    /// Do not reconnect
    Fatal,
}

/// Close code the client sends when it wants to keep the session resumable.
pub const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// Close code the client sends on shutdown; the server invalidates the session.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Close code used when the socket vanished without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Fixed close-code classification.
pub fn classify_close(code: u16) -> CloseAction {
    match code {
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => CloseAction::Fatal,
        4007 | 4009 => CloseAction::Reidentify,
        _ => CloseAction::Resume,
    }
}

/// Human-readable meaning of gateway close codes.
pub fn close_description(code: u16) -> &'static str {
    match code {
        1000 => "Normal closure",
        1001 => "Going away",
        1006 => "Abnormal closure",
        4000 => "Unknown error",
        4001 => "Unknown opcode",
        4002 => "Decode error",
        4003 => "Not authenticated",
        4004 => "Authentication failed",
        4005 => "Already authenticated",
        4007 => "Invalid sequence",
        4008 => "Rate limited",
        4009 => "Session timed out",
        4010 => "Invalid shard",
        4011 => "Sharding required",
        4012 => "Invalid API version",
        4013 => "Invalid intent(s)",
        4014 => "Disallowed intent(s)",
        _ => "Unknown close code",
    }
}
