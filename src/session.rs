//! Protocol state machine for one shard.
//!
//! The machine performs no I/O. The connection driver feeds it decoded
//! payloads, heartbeat deadlines and close codes, and executes the
//! [`SessionAction`]s it returns.
//!
//! ```text
//! Disconnected ──connect──> Connecting ──Hello──> Identifying ──READY───> Connected
//!      ^                                    └───> Resuming ────RESUMED─┘     │
//!      └──────────────────────── close / reconnect / teardown ───────────────┘
//! ```

use crate::config::GatewayConfig;
use crate::error::Error;
use crate::protocol::{
    classify_close, close_description, CloseAction, Hello, Identify, OpCode, Payload, Ready,
    Resume, ShardDescriptor, READY_EVENT, RESUMED_EVENT,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Connection state of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Identifying,
    Resuming,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Identifying => "identifying",
            ConnectionStatus::Resuming => "resuming",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Data needed to resume, plus the heartbeat acknowledgement flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    pub resume_url: Option<String>,
    pub sequence: Option<u64>,
    pub last_heartbeat_acked: bool,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            session_id: None,
            resume_url: None,
            sequence: None,
            last_heartbeat_acked: true,
        }
    }
}

impl SessionInfo {
    /// Resume needs all three of session id, sequence and resume URL.
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some() && self.resume_url.is_some()
    }

    /// Forget everything that would allow a resume.
    pub fn clear(&mut self) {
        self.session_id = None;
        self.resume_url = None;
        self.sequence = None;
    }

    /// Sequence numbers only move forward.
    fn observe_sequence(&mut self, sequence: u64) {
        if self.sequence.map_or(true, |current| sequence > current) {
            self.sequence = Some(sequence);
        }
    }
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Send this payload on the current socket
    Send(Payload),
    /// Send this heartbeat on the current socket
    Heartbeat(Payload),
    /// (Re)start the heartbeat schedule with this interval
    StartHeartbeat(Duration),
    /// The server acknowledged the last heartbeat
    HeartbeatAcked,
    /// The status changed
    Status(ConnectionStatus),
    /// Deliver an application event to the handler
    Dispatch { event: String, data: Value },
    /// Tear the socket down and connect again after `delay`
    Reconnect { resume: bool, delay: Duration },
    /// Lifecycle debug signal
    Debug(String),
    /// Lifecycle warning signal
    Warn(String),
}

/// What to do after the socket closed
#[derive(Debug)]
pub enum CloseOutcome {
    /// Connect again after `delay`
    Reconnect { resume: bool, delay: Duration },
    /// Stop this shard and surface the error
    Fatal(Error),
}

/// Protocol state machine of one shard
#[derive(Debug)]
pub struct Session {
    shard: Option<ShardDescriptor>,
    config: Arc<GatewayConfig>,
    info: SessionInfo,
    status: ConnectionStatus,
    heartbeat_interval: Option<Duration>,
}

impl Session {
    pub fn new(shard: Option<ShardDescriptor>, config: Arc<GatewayConfig>) -> Self {
        Self {
            shard,
            config,
            info: SessionInfo::default(),
            status: ConnectionStatus::Disconnected,
            heartbeat_interval: None,
        }
    }

    pub fn shard(&self) -> Option<ShardDescriptor> {
        self.shard
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Heartbeat interval announced by the last Hello
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    /// Begin a connection attempt.
    ///
    /// Returns the resume URL to dial when resuming is requested and one is
    /// known. A fresh attempt discards the session.
    pub fn prepare_connect(&mut self, resume_if_possible: bool) -> Option<String> {
        if !resume_if_possible {
            self.info.clear();
        }
        self.heartbeat_interval = None;
        self.status = ConnectionStatus::Connecting;
        if resume_if_possible {
            self.info.resume_url.clone()
        } else {
            None
        }
    }

    /// The socket is gone; timers must be dropped by the caller.
    pub fn mark_disconnected(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.heartbeat_interval = None;
    }

    /// Process one inbound payload.
    pub fn handle(&mut self, payload: Payload) -> Vec<SessionAction> {
        if let Some(sequence) = payload.s {
            self.info.observe_sequence(sequence);
        }

        let Some(op) = payload.opcode() else {
            return vec![SessionAction::Warn(format!(
                "Ignoring payload with unknown opcode {}",
                payload.op
            ))];
        };

        match op {
            OpCode::Hello => self.on_hello(payload.d),
            OpCode::Dispatch => self.on_dispatch(payload.t, payload.d),
            OpCode::Heartbeat => {
                let mut actions = vec![SessionAction::Debug(
                    "Server requested a heartbeat".to_string(),
                )];
                actions.push(self.beat());
                actions
            }
            OpCode::HeartbeatAck => {
                self.info.last_heartbeat_acked = true;
                vec![SessionAction::HeartbeatAcked]
            }
            OpCode::Reconnect => vec![
                SessionAction::Debug("Server requested a reconnect".to_string()),
                SessionAction::Reconnect {
                    resume: true,
                    delay: Duration::ZERO,
                },
            ],
            OpCode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                self.on_invalid_session(resumable)
            }
            OpCode::Identify
            | OpCode::Resume
            | OpCode::PresenceUpdate
            | OpCode::VoiceStateUpdate
            | OpCode::RequestGuildMembers => vec![SessionAction::Warn(format!(
                "Ignoring client-only opcode {:?} sent by the server",
                op
            ))],
        }
    }

    /// A scheduled heartbeat came due.
    ///
    /// If the previous beat was never acknowledged the connection is
    /// considered dead and a resume is requested instead of another beat.
    pub fn heartbeat_due(&mut self) -> Vec<SessionAction> {
        if !self.info.last_heartbeat_acked {
            return vec![
                SessionAction::Warn(
                    "Heartbeat was not acknowledged, reconnecting to resume".to_string(),
                ),
                SessionAction::Reconnect {
                    resume: true,
                    delay: Duration::ZERO,
                },
            ];
        }
        vec![self.beat()]
    }

    /// Classify a close code and decide the next step.
    pub fn handle_close(&mut self, code: u16, reason: &str) -> CloseOutcome {
        self.mark_disconnected();
        let delay = self.config.connection.reconnect_delay;
        match classify_close(code) {
            CloseAction::Fatal => {
                let reason = if reason.is_empty() {
                    close_description(code).to_string()
                } else {
                    reason.to_string()
                };
                self.info.clear();
                CloseOutcome::Fatal(Error::FatalClose { code, reason })
            }
            CloseAction::Reidentify => {
                self.info.clear();
                CloseOutcome::Reconnect {
                    resume: false,
                    delay,
                }
            }
            CloseAction::Resume => CloseOutcome::Reconnect {
                resume: true,
                delay,
            },
        }
    }

    fn beat(&mut self) -> SessionAction {
        self.info.last_heartbeat_acked = false;
        SessionAction::Heartbeat(Payload::heartbeat(self.info.sequence))
    }

    fn on_hello(&mut self, d: Value) -> Vec<SessionAction> {
        let hello = match serde_json::from_value::<Hello>(d) {
            Ok(hello) if hello.heartbeat_interval > 0 => hello,
            Ok(_) | Err(_) => {
                return vec![
                    SessionAction::Warn("Received Hello without a usable heartbeat interval".to_string()),
                    SessionAction::Reconnect {
                        resume: true,
                        delay: self.config.connection.reconnect_delay,
                    },
                ];
            }
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        self.heartbeat_interval = Some(interval);
        self.info.last_heartbeat_acked = true;

        let mut actions = vec![
            SessionAction::Debug(format!(
                "Hello received, heartbeat interval {}ms",
                hello.heartbeat_interval
            )),
            SessionAction::StartHeartbeat(interval),
        ];
        actions.extend(self.identify_or_resume());
        actions
    }

    fn identify_or_resume(&mut self) -> Vec<SessionAction> {
        match self.resume_payload() {
            Ok(payload) => {
                self.status = ConnectionStatus::Resuming;
                vec![
                    SessionAction::Debug(format!(
                        "Resuming session {} at sequence {}",
                        self.info.session_id.as_deref().unwrap_or_default(),
                        self.info.sequence.unwrap_or_default()
                    )),
                    SessionAction::Send(payload),
                    SessionAction::Status(ConnectionStatus::Resuming),
                ]
            }
            Err(_) => {
                self.info.clear();
                self.status = ConnectionStatus::Identifying;
                vec![
                    SessionAction::Debug(match self.shard {
                        Some(shard) => format!("Identifying as shard {}", shard),
                        None => "Identifying".to_string(),
                    }),
                    SessionAction::Send(self.identify_payload()),
                    SessionAction::Status(ConnectionStatus::Identifying),
                ]
            }
        }
    }

    /// Resume payload for the current session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Session`] when any piece of resume data is missing.
    pub fn resume_payload(&self) -> Result<Payload, Error> {
        match (&self.info.session_id, self.info.sequence, &self.info.resume_url) {
            (Some(session_id), Some(seq), Some(_)) => {
                let body = Resume {
                    token: &self.config.token,
                    session_id,
                    seq,
                };
                let d = serde_json::to_value(body).map_err(|e| Error::Session(e.to_string()))?;
                Ok(Payload::new(OpCode::Resume, d))
            }
            _ => Err(Error::Session(
                "session id, sequence and resume URL are required to resume".to_string(),
            )),
        }
    }

    /// Identify payload for a brand-new session.
    pub fn identify_payload(&self) -> Payload {
        let body = Identify {
            token: &self.config.token,
            properties: &self.config.properties,
            compress: false,
            large_threshold: self.config.large_threshold,
            shard: self.shard,
            presence: self.config.presence.as_ref(),
            intents: self.config.intents,
        };
        // Identify holds only strings, integers and an existing Value.
        let d = serde_json::to_value(body).unwrap_or(Value::Null);
        Payload::new(OpCode::Identify, d)
    }

    fn on_dispatch(&mut self, event: Option<String>, data: Value) -> Vec<SessionAction> {
        let Some(event) = event else {
            return vec![SessionAction::Warn("Dispatch payload without an event name".to_string())];
        };

        let mut actions = Vec::with_capacity(3);
        match event.as_str() {
            READY_EVENT => {
                match serde_json::from_value::<Ready>(data.clone()) {
                    Ok(ready) => {
                        actions.push(SessionAction::Debug(format!(
                            "Ready, session {}",
                            ready.session_id
                        )));
                        self.info.session_id = Some(ready.session_id);
                        self.info.resume_url = ready.resume_gateway_url;
                    }
                    Err(e) => actions.push(SessionAction::Warn(format!(
                        "READY payload is missing session data: {}",
                        e
                    ))),
                }
                self.status = ConnectionStatus::Connected;
                actions.push(SessionAction::Status(ConnectionStatus::Connected));
            }
            RESUMED_EVENT => {
                actions.push(SessionAction::Debug("Session resumed".to_string()));
                self.status = ConnectionStatus::Connected;
                actions.push(SessionAction::Status(ConnectionStatus::Connected));
            }
            _ => {}
        }
        actions.push(SessionAction::Dispatch { event, data });
        actions
    }

    fn on_invalid_session(&mut self, resumable: bool) -> Vec<SessionAction> {
        let delay = self.config.connection.invalid_session_delay();
        let mut actions = Vec::with_capacity(2);

        if resumable && self.info.can_resume() {
            actions.push(SessionAction::Debug(format!(
                "Session invalidated but resumable, resuming in {:?}",
                delay
            )));
            actions.push(SessionAction::Reconnect {
                resume: true,
                delay,
            });
            return actions;
        }

        if resumable {
            actions.push(SessionAction::Warn(
                "Session is resumable but resume data is missing, identifying instead".to_string(),
            ));
        } else {
            actions.push(SessionAction::Debug(format!(
                "Session invalidated, identifying in {:?}",
                delay
            )));
        }
        self.info.clear();
        actions.push(SessionAction::Reconnect {
            resume: false,
            delay,
        });
        actions
    }
}
