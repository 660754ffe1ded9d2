use crate::codec::TransportCodec;
use crate::config::{validate_gateway_url, ConfigError, GatewayConfig};
use crate::error::{Error, ErrorKind};
use crate::handler::GatewayHandler;
use crate::heartbeat::HeartbeatScheduler;
use crate::metrics::Metrics;
use crate::protocol::{
    OpCode, Payload, ShardDescriptor, ABNORMAL_CLOSE_CODE, NORMAL_CLOSE_CODE,
    RESUMABLE_CLOSE_CODE,
};
use crate::session::{CloseOutcome, ConnectionStatus, Session, SessionAction};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Commands that can be sent to a connection
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Send a payload on the current socket
    Send(Payload),
    /// Close with a resumable code and reconnect immediately
    Reconnect,
    /// Close the connection and stop the shard
    Close,
}

/// How one socket ended
#[derive(Debug)]
enum Exit {
    /// Shut down on request
    Stop,
    /// Connect again after `delay`
    Reconnect { resume: bool, delay: Duration },
    /// Stop the shard and surface the error
    Fatal(Error),
}

/// Drives one shard: dials sockets, runs the session state machine and
/// reconnects until stopped or a fatal close arrives.
pub struct Connection<H: GatewayHandler> {
    shard_id: u32,
    handler: Arc<H>,
    config: Arc<GatewayConfig>,
    base_url: String,
    metrics: Arc<Metrics>,
    command_rx: mpsc::Receiver<ConnectionCommand>,
    /// Fires once Identify/Resume went out, or the first attempt failed
    ready_tx: Option<oneshot::Sender<()>>,
    session: Session,
}

impl<H: GatewayHandler> Connection<H> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: Option<ShardDescriptor>,
        handler: Arc<H>,
        config: Arc<GatewayConfig>,
        base_url: String,
        metrics: Arc<Metrics>,
        command_rx: mpsc::Receiver<ConnectionCommand>,
        ready_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            shard_id: shard.map_or(0, |s| s.id),
            handler,
            session: Session::new(shard, Arc::clone(&config)),
            config,
            base_url,
            metrics,
            command_rx,
            ready_tx: Some(ready_tx),
        }
    }

    /// Run the connection loop (reconnects on failure)
    pub async fn run(mut self) -> Result<(), Error> {
        let mut resume = false;
        let mut delay = Duration::ZERO;
        let mut failed_attempts = 0u32;
        let mut is_first_connect = true;

        loop {
            if !delay.is_zero() {
                debug!(
                    "[SHARD-{}] Reconnecting in {:?} (resume: {})",
                    self.shard_id, delay, resume
                );
                if !self.wait(delay).await {
                    info!("[SHARD-{}] Stopped while waiting to reconnect", self.shard_id);
                    return Ok(());
                }
            }

            if !is_first_connect {
                self.metrics.record_reconnection();
            }
            is_first_connect = false;

            match self.connect_and_run(resume).await {
                Ok(Exit::Stop) => {
                    info!("[SHARD-{}] Connection closed gracefully", self.shard_id);
                    return Ok(());
                }
                Ok(Exit::Reconnect {
                    resume: next_resume,
                    delay: next_delay,
                }) => {
                    failed_attempts = 0;
                    resume = next_resume;
                    delay = next_delay;
                }
                Ok(Exit::Fatal(e)) => {
                    error!("[SHARD-{}] Shard stopped: {}", self.shard_id, e);
                    self.report_error(&e);
                    return Err(e);
                }
                Err(e) => {
                    // The socket never opened; the session is untouched.
                    self.metrics.record_error();
                    failed_attempts += 1;
                    self.signal_ready();
                    debug!(
                        "[SHARD-{}] Connection error: {} (attempt {})",
                        self.shard_id, e, failed_attempts
                    );
                    self.report_error(&e);

                    if failed_attempts >= self.config.connection.max_connect_attempts {
                        error!(
                            "[SHARD-{}] Max connection attempts ({}) reached",
                            self.shard_id, self.config.connection.max_connect_attempts
                        );
                        let e = Error::ConnectionFailed {
                            attempts: failed_attempts,
                            last_error: e.to_string(),
                        };
                        self.report_error(&e);
                        return Err(e);
                    }
                    delay = self.config.backoff.delay_for_attempt(failed_attempts - 1);
                }
            }
        }
    }

    /// Sleep for `delay` while still serving commands.
    ///
    /// Returns `false` when the shard was told to stop.
    async fn wait(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                cmd = self.command_rx.recv() => match cmd {
                    Some(ConnectionCommand::Send(payload)) => {
                        self.warn(&format!(
                            "Dropping op {} payload, no socket is open",
                            payload.op
                        ));
                    }
                    Some(ConnectionCommand::Reconnect) => return true,
                    Some(ConnectionCommand::Close) | None => return false,
                },
            }
        }
    }

    /// Dial one socket and run it until it ends.
    ///
    /// `Err` means the socket never opened.
    async fn connect_and_run(&mut self, resume: bool) -> Result<Exit, Error> {
        let resume_url = self.session.prepare_connect(resume);
        self.set_status(ConnectionStatus::Connecting);

        let url = match resume_url.as_deref().map(|url| gateway_url(url, &self.config)) {
            Some(Ok(url)) => url,
            Some(Err(e)) => {
                self.warn(&format!("Ignoring unusable resume URL: {}", e));
                gateway_url(&self.base_url, &self.config)?
            }
            None => gateway_url(&self.base_url, &self.config)?,
        };

        let mut codec = match TransportCodec::new(self.config.encoding, self.config.compression) {
            Ok(codec) => codec,
            Err(e) => return Ok(Exit::Fatal(e)),
        };

        debug!("[SHARD-{}] Connecting to {}", self.shard_id, url);

        let ws_stream = match timeout(self.config.connection.connect_timeout, connect_socket(&url)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
            Err(_) => {
                self.set_status(ConnectionStatus::Disconnected);
                return Err(Error::ConnectionFailed {
                    attempts: 0,
                    last_error: "Connection timeout".to_string(),
                });
            }
        };

        self.metrics.record_connection();
        info!("[SHARD-{}] Connected to {}", self.shard_id, url);

        let (mut write, mut read) = ws_stream.split();
        let mut heartbeat: Option<HeartbeatScheduler> = None;
        let hello_deadline = tokio::time::Instant::now() + self.config.connection.hello_timeout;

        let exit = loop {
            let next_beat = heartbeat.as_ref().map_or(hello_deadline, |h| h.next_beat());

            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.into_owned()))
                                .unwrap_or((ABNORMAL_CLOSE_CODE, String::new()));
                            break self.closed(code, &reason);
                        }
                        Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                            match codec.decode_message(&message) {
                                Ok(Some(payload)) => {
                                    trace!(
                                        "[SHARD-{}] Received op {} (s: {:?}, t: {:?})",
                                        self.shard_id, payload.op, payload.s, payload.t
                                    );
                                    self.metrics.record_payload_received();
                                    let sequence = payload.s;
                                    self.metrics.update_shard(self.shard_id, |s| {
                                        s.last_payload_at = Some(Instant::now());
                                        if sequence.is_some() {
                                            s.sequence = sequence.max(s.sequence);
                                        }
                                    });
                                    let actions = self.session.handle(payload);
                                    if let Some(exit) = self
                                        .apply(actions, &mut write, &codec, &mut heartbeat, false)
                                        .await
                                    {
                                        break exit;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    self.report_error(&Error::Transport(e));
                                    self.close_with(
                                        &mut write,
                                        RESUMABLE_CLOSE_CODE,
                                        "Undecodable payload",
                                    )
                                    .await;
                                    break Exit::Reconnect {
                                        resume: true,
                                        delay: self.config.connection.reconnect_delay,
                                    };
                                }
                            }
                        }
                        Some(Ok(_)) => {
                            // Pings are answered by tungstenite itself.
                        }
                        Some(Err(e)) => {
                            warn!("[SHARD-{}] WebSocket error: {}", self.shard_id, e);
                            self.report_error(&Error::WebSocket(e));
                            break self.closed(ABNORMAL_CLOSE_CODE, "");
                        }
                        None => {
                            info!("[SHARD-{}] WebSocket stream ended", self.shard_id);
                            break self.closed(ABNORMAL_CLOSE_CODE, "");
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Send(payload)) => {
                            let actions = vec![SessionAction::Send(payload)];
                            if let Some(exit) = self
                                .apply(actions, &mut write, &codec, &mut heartbeat, false)
                                .await
                            {
                                break exit;
                            }
                        }
                        Some(ConnectionCommand::Reconnect) => {
                            info!("[SHARD-{}] Received reconnect command", self.shard_id);
                            self.close_with(&mut write, RESUMABLE_CLOSE_CODE, "Reconnect requested")
                                .await;
                            break Exit::Reconnect { resume: true, delay: Duration::ZERO };
                        }
                        Some(ConnectionCommand::Close) | None => {
                            info!("[SHARD-{}] Received close command", self.shard_id);
                            self.close_with(&mut write, NORMAL_CLOSE_CODE, "Shutting down").await;
                            break Exit::Stop;
                        }
                    }
                }

                _ = sleep_until(next_beat), if heartbeat.is_some() => {
                    let actions = self.session.heartbeat_due();
                    if actions.iter().any(|a| matches!(a, SessionAction::Reconnect { .. })) {
                        self.metrics.record_heartbeat_missed();
                        if let Some(h) = heartbeat.as_mut() {
                            h.skip();
                        }
                    }
                    if let Some(exit) = self
                        .apply(actions, &mut write, &codec, &mut heartbeat, true)
                        .await
                    {
                        break exit;
                    }
                }

                _ = sleep_until(hello_deadline), if heartbeat.is_none() => {
                    self.warn(&format!(
                        "No Hello within {:?}, reconnecting",
                        self.config.connection.hello_timeout
                    ));
                    self.close_with(&mut write, RESUMABLE_CLOSE_CODE, "No Hello received")
                        .await;
                    break Exit::Reconnect {
                        resume: true,
                        delay: self.config.connection.reconnect_delay,
                    };
                }
            }
        };

        // Timers go with the loop; the socket is dropped after them.
        drop(heartbeat);
        self.session.mark_disconnected();
        self.set_status(ConnectionStatus::Disconnected);
        Ok(exit)
    }

    /// Execute session actions in order. Returns the exit when one ends the socket.
    async fn apply(
        &mut self,
        actions: Vec<SessionAction>,
        write: &mut WsSink,
        codec: &TransportCodec,
        heartbeat: &mut Option<HeartbeatScheduler>,
        scheduled: bool,
    ) -> Option<Exit> {
        for action in actions {
            match action {
                SessionAction::Send(payload) => {
                    let op = payload.opcode();
                    match send_payload(write, codec, &payload).await {
                        Ok(()) => {
                            self.metrics.record_payload_sent();
                            match op {
                                Some(OpCode::Identify) => {
                                    self.metrics.record_identify();
                                    self.signal_ready();
                                }
                                Some(OpCode::Resume) => {
                                    self.metrics.record_resume();
                                    self.signal_ready();
                                }
                                _ => {}
                            }
                        }
                        Err(e @ Error::Transport(_)) => {
                            self.report_error(&e);
                        }
                        Err(e) => return Some(self.send_failed(e)),
                    }
                }
                SessionAction::Heartbeat(payload) => {
                    if let Err(e) = send_payload(write, codec, &payload).await {
                        return Some(self.send_failed(e));
                    }
                    trace!("[SHARD-{}] Heartbeat sent (s: {:?})", self.shard_id, payload.s);
                    self.metrics.record_payload_sent();
                    self.metrics.record_heartbeat_sent();
                    if let Some(h) = heartbeat.as_mut() {
                        if scheduled {
                            h.record_sent();
                        } else {
                            h.record_requested();
                        }
                    }
                }
                SessionAction::StartHeartbeat(interval) => {
                    let scheduler = HeartbeatScheduler::new(interval);
                    debug!(
                        "[SHARD-{}] Heartbeating every {:?}, first beat in {:?}",
                        self.shard_id,
                        interval,
                        scheduler.time_until_next_beat()
                    );
                    *heartbeat = Some(scheduler);
                }
                SessionAction::HeartbeatAcked => {
                    self.metrics.record_heartbeat_acked();
                    if let Some(latency) = heartbeat.as_mut().and_then(|h| h.record_ack()) {
                        trace!("[SHARD-{}] Heartbeat acked in {:?}", self.shard_id, latency);
                        self.metrics
                            .update_shard(self.shard_id, |s| s.latency = Some(latency));
                    }
                }
                SessionAction::Status(status) => {
                    if status == ConnectionStatus::Connected {
                        info!("[SHARD-{}] Session ready", self.shard_id);
                    }
                    self.set_status(status);
                }
                SessionAction::Dispatch { event, data } => {
                    self.metrics.record_dispatch();
                    self.handler.dispatch(self.session.shard(), &event, data).await;
                }
                SessionAction::Reconnect { resume, delay } => {
                    let (code, reason) = if resume {
                        (RESUMABLE_CLOSE_CODE, "Reconnecting to resume")
                    } else {
                        (NORMAL_CLOSE_CODE, "Reconnecting with a new session")
                    };
                    self.close_with(write, code, reason).await;
                    return Some(Exit::Reconnect { resume, delay });
                }
                SessionAction::Debug(message) => {
                    debug!("[SHARD-{}] {}", self.shard_id, message);
                    self.handler.on_debug(self.session.shard(), &message);
                }
                SessionAction::Warn(message) => self.warn(&message),
            }
        }
        None
    }

    /// The remote side closed (or the socket died); let the session decide.
    fn closed(&mut self, code: u16, reason: &str) -> Exit {
        info!(
            "[SHARD-{}] Gateway closed with code {} ({})",
            self.shard_id,
            code,
            if reason.is_empty() {
                crate::protocol::close_description(code)
            } else {
                reason
            }
        );
        self.handler.on_close(self.session.shard(), code, reason);

        match self.session.handle_close(code, reason) {
            CloseOutcome::Reconnect { resume, delay } => Exit::Reconnect { resume, delay },
            CloseOutcome::Fatal(e) => {
                self.metrics.record_fatal_close();
                Exit::Fatal(e)
            }
        }
    }

    /// Close the socket from this side and tell the handler.
    async fn close_with(&mut self, write: &mut WsSink, code: u16, reason: &str) {
        debug!(
            "[SHARD-{}] Closing with code {} ({})",
            self.shard_id, code, reason
        );
        close_socket(write, code).await;
        self.handler.on_close(self.session.shard(), code, reason);
    }

    fn send_failed(&mut self, e: Error) -> Exit {
        warn!("[SHARD-{}] Failed to send payload: {}", self.shard_id, e);
        self.report_error(&e);
        self.closed(ABNORMAL_CLOSE_CODE, "")
    }

    fn signal_ready(&mut self) {
        if let Some(ready_tx) = self.ready_tx.take() {
            let _ = ready_tx.send(());
            debug!("[SHARD-{}] Signaled identify slot used", self.shard_id);
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.metrics
            .update_shard(self.shard_id, |s| s.set_status(status));
    }

    fn warn(&self, message: &str) {
        warn!("[SHARD-{}] {}", self.shard_id, message);
        self.handler.on_warn(self.session.shard(), message);
    }

    fn report_error(&self, e: &Error) {
        if e.kind() != ErrorKind::FatalClose {
            self.metrics.record_error();
        }
        self.handler
            .on_error(self.session.shard(), e.kind(), &e.to_string());
    }
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;

/// Connection URL: `base` with `v`, `encoding` and optional `compress` set.
pub(crate) fn gateway_url(base: &str, config: &GatewayConfig) -> Result<Url, ConfigError> {
    let mut url = validate_gateway_url(base)?;
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.append_pair("v", &config.api_version.to_string());
        query.append_pair("encoding", config.encoding.as_str());
        if let Some(compress) = config.compression.query_value() {
            query.append_pair("compress", compress);
        }
    }
    Ok(url)
}

async fn send_payload(
    write: &mut WsSink,
    codec: &TransportCodec,
    payload: &Payload,
) -> Result<(), Error> {
    let message = codec.encode(payload)?;
    write.send(message).await?;
    Ok(())
}

/// Best-effort close frame; the socket is dropped right after.
async fn close_socket(write: &mut WsSink, code: u16) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    };
    let _ = write.send(Message::Close(Some(frame))).await;
}

/// Open a websocket to `url`, with TLS for `wss`.
async fn connect_socket(url: &Url) -> Result<WsStream, Error> {
    let host = url.host_str().ok_or_else(|| Error::ConnectionFailed {
        attempts: 0,
        last_error: "No host in URL".to_string(),
    })?;

    let is_tls = url.scheme() == "wss";
    let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("Invalid WebSocket request: {}", e),
        })?;

    let tcp_stream = connect_direct(host, port).await?;
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new().map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("TLS error: {}", e),
        })?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

async fn connect_direct(host: &str, port: u16) -> Result<tokio::net::TcpStream, Error> {
    let bare_host = host.trim_start_matches('[').trim_end_matches(']');
    let dest_addr: SocketAddr = tokio::net::lookup_host((bare_host, port))
        .await
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("DNS lookup failed: {}", e),
        })?
        .next()
        .ok_or_else(|| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("No addresses found for {}", host),
        })?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed {
        attempts: 0,
        last_error: format!("Failed to create socket: {}", e),
    })?;

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("TCP connect to {} failed: {}", dest_addr, e),
        })
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    let _ = sock2.set_nodelay(true);

    // Keepalive catches dead peers between heartbeats
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}
