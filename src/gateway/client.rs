//! Gateway session manager.
//!
//! [`GatewayClient::connect`] spawns a worker task that owns the websocket.
//! The worker performs the Hello / Identify handshake, drives a
//! [`HeartbeatController`], tracks the session sequence, and resumes or
//! re-identifies after connection loss until the session is stopped or hits
//! a fatal error. Only the worker writes to the socket; heartbeats reach it
//! through an outbound queue.

use std::borrow::Cow;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::gateway::heartbeat::{HeartbeatController, HeartbeatExit, HeartbeatState};
use crate::gateway::proto::{
    close_action, ClientFrame, CloseAction, DispatchEvent, FrameError, IdentifyPayload,
    IdentifyProperties, ResumePayload, ServerFrame,
};
use crate::gateway::session::Session;
use crate::retry::RetryPolicy;

/// Production gateway endpoint.
pub const GATEWAY_ENDPOINT: &str = "wss://gateway.discord.gg";
pub const DEFAULT_GATEWAY_VERSION: u8 = 10;

/// Close code sent when the client drops a connection it intends to resume.
/// Anything other than 1000/1001 keeps the session resumable.
const RESUMABLE_CLOSE_CODE: u16 = 4000;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default gateway settings.
pub struct GatewayDefaults;

impl GatewayDefaults {
    pub const API_VERSION: u8 = DEFAULT_GATEWAY_VERSION;
    /// Budget for the websocket upgrade and for the Hello frame that follows.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Gateway connection settings.
#[derive(Clone, Debug)]
pub struct GatewayOptions {
    pub api_version: u8,
    /// Intent bitfield sent with identify.
    pub intents: u64,
    pub properties: IdentifyProperties,
    pub connect_timeout: Duration,
    /// Backoff between reconnects. `max_attempts` bounds consecutive failed
    /// reconnects; the default never gives up.
    pub reconnect_policy: RetryPolicy,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            api_version: GatewayDefaults::API_VERSION,
            intents: 0,
            properties: IdentifyProperties::default(),
            connect_timeout: GatewayDefaults::CONNECT_TIMEOUT,
            reconnect_policy: RetryPolicy::reconnect(),
        }
    }
}

/// Entry point for opening gateway sessions.
#[derive(Clone)]
pub struct GatewayClient {
    token: SecretString,
    options: GatewayOptions,
    endpoint_override: Option<String>,
}

impl GatewayClient {
    /// Creates a client for the production gateway with default options.
    pub fn new(token: SecretString) -> Self {
        Self::with_options(token, GatewayOptions::default())
    }

    /// Creates a client with explicit intents, properties and reconnect policy.
    pub fn with_options(token: SecretString, options: GatewayOptions) -> Self {
        Self {
            token,
            options,
            endpoint_override: None,
        }
    }

    /// Sets an explicit gateway endpoint, e.g. a local mock server.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    /// Options used for every connection this client opens.
    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Opens a gateway session.
    ///
    /// Resolves once the first `READY` dispatch arrives. Failures before that
    /// point are returned here and the worker stops. The one exception is a
    /// single invalid session right after identify, which is answered with a
    /// fresh identify. After `READY` the background worker reconnects on its
    /// own and reports progress on the status channel.
    pub async fn connect(&self) -> Result<GatewayConnection, GatewayError> {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (status_tx, status) = mpsc::unbounded_channel();
        let (session_tx, session) = watch::channel(Session::default());
        let (heartbeat_tx, heartbeat) = watch::channel(HeartbeatState::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = GatewayWorker {
            token: self.token.clone(),
            options: self.options.clone(),
            endpoint: self.endpoint().to_string(),
            events: event_tx,
            status: status_tx,
            session: session_tx,
            heartbeat: heartbeat_tx,
        };
        tokio::spawn(async move {
            worker.run(shutdown_rx, ready_tx).await;
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(GatewayConnection {
                events,
                status,
                session,
                heartbeat,
                shutdown: shutdown_tx,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(GatewayError::Protocol(
                "gateway worker stopped before ready".to_string(),
            )),
        }
    }

    fn endpoint(&self) -> &str {
        self.endpoint_override.as_deref().unwrap_or(GATEWAY_ENDPOINT)
    }
}

/// Lifecycle updates published by the gateway worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GatewayStatus {
    /// `READY` (fresh session) or `RESUMED` arrived.
    Connected { resumed: bool },
    Disconnected,
    /// A reconnect is scheduled after `delay`.
    Reconnecting { attempt: usize, delay: Duration },
    /// The worker exited; `error` is set when it stopped on a fatal error.
    Stopped { error: Option<String> },
}

/// A live gateway session.
///
/// Dropping the connection stops the session.
#[derive(Debug)]
pub struct GatewayConnection {
    events: mpsc::UnboundedReceiver<DispatchEvent>,
    status: mpsc::UnboundedReceiver<GatewayStatus>,
    session: watch::Receiver<Session>,
    heartbeat: watch::Receiver<HeartbeatState>,
    shutdown: watch::Sender<bool>,
}

impl GatewayConnection {
    /// Receives the next dispatch event, in sequence order.
    ///
    /// Returns `None` once the session has stopped and every buffered event
    /// has been consumed.
    pub async fn recv(&mut self) -> Option<DispatchEvent> {
        self.events.recv().await
    }

    /// Turns the connection into a lazy stream of dispatch events.
    pub fn into_stream(self) -> impl Stream<Item = DispatchEvent> {
        futures_util::stream::unfold(self, |mut connection| async move {
            let event = connection.recv().await?;
            Some((event, connection))
        })
    }

    /// Receives the next lifecycle update.
    pub async fn next_status(&mut self) -> Option<GatewayStatus> {
        self.status.recv().await
    }

    /// Snapshot of the resume state.
    pub fn session(&self) -> Session {
        self.session.borrow().clone()
    }

    /// Snapshot of the heartbeat controller.
    pub fn heartbeat(&self) -> HeartbeatState {
        self.heartbeat.borrow().clone()
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.borrow().latency
    }

    /// Stops the session: the heartbeat is cancelled and the socket closed.
    /// Calling it more than once has no further effect.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether `stop` was called or the worker has exited.
    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow() || self.events.is_closed()
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Errors produced by gateway transport and protocol handling.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed gateway frame: {0}")]
    Frame(#[from] FrameError),

    /// The token was rejected at upgrade (HTTP 401) or by close code 4004.
    #[error("gateway rejected the token")]
    Unauthorized,

    /// The server invalidated two fresh identifies in a row.
    #[error("session invalidated again after re-identifying")]
    InvalidSession,

    /// The server closed with a code that forbids reconnecting.
    #[error("gateway closed the connection ({code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reconnect attempts are exhausted or the session was stopped.
    #[error("gateway session stopped")]
    Stopped,
}

impl GatewayError {
    /// Whether the error ends the session instead of triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::InvalidSession | Self::Closed { .. } | Self::Stopped
        )
    }

    fn from_handshake(err: WsError) -> Self {
        match &err {
            WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                Self::Unauthorized
            }
            _ => Self::WebSocket(err),
        }
    }
}

/// Builds the connect URL for a gateway base endpoint.
///
/// Endpoints that already carry a query string are used verbatim.
pub fn gateway_url(endpoint: &str, api_version: u8) -> String {
    if endpoint.contains('?') {
        return endpoint.to_string();
    }
    let base = endpoint.trim_end_matches('/');
    format!("{base}/?v={api_version}&encoding=json")
}

enum SessionOutcome {
    Shutdown,
    Reconnect {
        reached_ready: bool,
        /// The server answered a fresh identify with an invalid session.
        invalidated: bool,
    },
}

type ReadySender = oneshot::Sender<Result<(), GatewayError>>;

struct GatewayWorker {
    token: SecretString,
    options: GatewayOptions,
    endpoint: String,
    events: mpsc::UnboundedSender<DispatchEvent>,
    status: mpsc::UnboundedSender<GatewayStatus>,
    session: watch::Sender<Session>,
    heartbeat: watch::Sender<HeartbeatState>,
}

impl GatewayWorker {
    async fn run(self, mut shutdown: watch::Receiver<bool>, ready_tx: ReadySender) {
        let mut ready_tx = Some(ready_tx);
        let mut session = Session::default();
        let mut attempt = 0usize;
        let mut invalidated = false;

        loop {
            let outcome = self
                .run_connected_session(&mut session, &mut shutdown, &mut ready_tx, invalidated)
                .await;
            session.connected = false;
            self.session.send_replace(session.clone());

            match outcome {
                Ok(SessionOutcome::Shutdown) => {
                    info!(event = "gateway_session_stopped", sequence = session.sequence);
                    self.publish(GatewayStatus::Stopped { error: None });
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(GatewayError::Stopped));
                    }
                    return;
                }
                Ok(SessionOutcome::Reconnect {
                    reached_ready,
                    invalidated: rejected,
                }) => {
                    if reached_ready {
                        attempt = 0;
                        invalidated = false;
                    }
                    if rejected {
                        invalidated = true;
                    } else if let Some(tx) = ready_tx.take() {
                        let err =
                            GatewayError::Protocol("connection lost before ready".to_string());
                        warn!(event = "gateway_initial_connect_failed", error = %err);
                        self.publish(GatewayStatus::Stopped {
                            error: Some(err.to_string()),
                        });
                        let _ = tx.send(Err(err));
                        return;
                    }
                    self.publish(GatewayStatus::Disconnected);
                }
                Err(err) => {
                    if let Some(tx) = ready_tx.take() {
                        warn!(event = "gateway_initial_connect_failed", error = %err);
                        self.publish(GatewayStatus::Stopped {
                            error: Some(err.to_string()),
                        });
                        let _ = tx.send(Err(err));
                        return;
                    }
                    if err.is_fatal() {
                        self.stop_with_error(&err);
                        return;
                    }
                    warn!(event = "gateway_connection_failed", attempt, error = %err);
                    self.publish(GatewayStatus::Disconnected);
                }
            }

            attempt += 1;
            if attempt >= self.options.reconnect_policy.max_attempts {
                self.stop_with_error(&GatewayError::Stopped);
                return;
            }
            let delay = self.options.reconnect_policy.delay_for_attempt(attempt);
            warn!(
                event = "gateway_reconnect_scheduled",
                attempt,
                delay_ms = delay.as_millis() as u64,
                resume = session.can_resume(),
            );
            self.publish(GatewayStatus::Reconnecting { attempt, delay });

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown_requested(&mut shutdown) => {
                    self.publish(GatewayStatus::Stopped { error: None });
                    return;
                }
            }
        }
    }

    async fn run_connected_session(
        &self,
        session: &mut Session,
        shutdown: &mut watch::Receiver<bool>,
        ready_tx: &mut Option<ReadySender>,
        invalidated: bool,
    ) -> Result<SessionOutcome, GatewayError> {
        let resuming = session.can_resume();
        let endpoint = match (&session.resume_url, resuming) {
            (Some(resume_url), true) => resume_url.as_str(),
            _ => self.endpoint.as_str(),
        };
        let url = gateway_url(endpoint, self.options.api_version);
        debug!(event = "gateway_connecting", url = %url, resuming);

        let opened = tokio::select! {
            opened = tokio::time::timeout(self.options.connect_timeout, open_socket(&url)) => opened,
            () = shutdown_requested(shutdown) => return Ok(SessionOutcome::Shutdown),
        };
        let (mut socket, heartbeat_interval) = opened.map_err(|_| {
            GatewayError::Protocol("timed out waiting for gateway hello".to_string())
        })??;
        if *shutdown.borrow() {
            close_socket(&mut socket, WsCloseCode::Normal).await;
            return Ok(SessionOutcome::Shutdown);
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (sequence_tx, sequence_rx) = watch::channel(session.sequence);
        let mut heartbeat = HeartbeatController::start(heartbeat_interval, move || {
            let sequence = *sequence_rx.borrow();
            outbound_tx.send(ClientFrame::Heartbeat { sequence }).is_ok()
        });
        let mut heartbeat_updates = heartbeat.subscribe();

        let handshake = self.handshake_frame(session);
        send_frame(&mut socket, &handshake).await?;
        let mut progress = Progress {
            identify_pending: !resuming,
            reached_ready: false,
            invalidated_before: invalidated,
            invalidated: false,
        };

        let outcome = loop {
            tokio::select! {
                () = shutdown_requested(shutdown) => {
                    heartbeat.stop();
                    close_socket(&mut socket, WsCloseCode::Normal).await;
                    break Ok(SessionOutcome::Shutdown);
                }
                exit = heartbeat.finished() => {
                    if exit == HeartbeatExit::Zombied {
                        warn!(event = "gateway_zombied", sequence = session.sequence);
                    }
                    close_socket(&mut socket, WsCloseCode::from(RESUMABLE_CLOSE_CODE)).await;
                    break Ok(progress.reconnect());
                }
                Some(frame) = outbound_rx.recv() => {
                    if let Err(err) = send_frame(&mut socket, &frame).await {
                        debug!(event = "gateway_send_failed", error = %err);
                        break Ok(progress.reconnect());
                    }
                }
                Ok(()) = heartbeat_updates.changed() => {
                    let snapshot = heartbeat_updates.borrow_and_update().clone();
                    self.heartbeat.send_replace(snapshot);
                }
                inbound = socket.next() => {
                    let flow = match inbound {
                        Some(Ok(Message::Text(text))) => match ServerFrame::from_text(&text) {
                            Ok(frame) => self.apply_frame(
                                frame,
                                session,
                                &heartbeat,
                                &sequence_tx,
                                &mut progress,
                                ready_tx,
                            ),
                            Err(err) => {
                                warn!(event = "gateway_frame_invalid", error = %err);
                                Ok(Flow::Reconnect)
                            }
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                Ok(Flow::Reconnect)
                            } else {
                                Ok(Flow::Continue)
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                                .unwrap_or((1005, String::new()));
                            closed_by_server(session, code, reason)
                        }
                        Some(Ok(_)) => Ok(Flow::Continue),
                        Some(Err(err)) => {
                            debug!(event = "gateway_read_failed", error = %err);
                            Ok(Flow::Reconnect)
                        }
                        None => Ok(Flow::Reconnect),
                    };

                    match flow {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Reconnect) => {
                            close_socket(&mut socket, WsCloseCode::from(RESUMABLE_CLOSE_CODE))
                                .await;
                            break Ok(progress.reconnect());
                        }
                        Ok(Flow::Shutdown) => {
                            close_socket(&mut socket, WsCloseCode::Normal).await;
                            break Ok(SessionOutcome::Shutdown);
                        }
                        Err(err) => break Err(err),
                    }
                }
            }
        };

        heartbeat.stop();
        self.heartbeat.send_replace(heartbeat.state());
        outcome
    }

    fn handshake_frame(&self, session: &Session) -> ClientFrame {
        let token = self.token.expose_secret().to_string();
        match &session.session_id {
            Some(session_id) => ClientFrame::Resume(ResumePayload {
                token,
                session_id: session_id.clone(),
                seq: session.sequence,
            }),
            None => ClientFrame::Identify(IdentifyPayload {
                token,
                intents: self.options.intents,
                properties: self.options.properties.clone(),
            }),
        }
    }

    fn apply_frame(
        &self,
        frame: ServerFrame,
        session: &mut Session,
        heartbeat: &HeartbeatController,
        sequence_tx: &watch::Sender<u64>,
        progress: &mut Progress,
        ready_tx: &mut Option<ReadySender>,
    ) -> Result<Flow, GatewayError> {
        match frame {
            ServerFrame::Dispatch(event) => {
                session.observe_sequence(event.sequence);
                sequence_tx.send_replace(session.sequence);
                debug!(
                    event = "gateway_dispatch",
                    name = %event.name,
                    sequence = event.sequence,
                );

                match event.name.as_str() {
                    "READY" => {
                        if !session.apply_ready(&event.data) {
                            warn!(event = "gateway_ready_without_session_id");
                        }
                        self.mark_connected(session, progress, ready_tx, false);
                    }
                    "RESUMED" => self.mark_connected(session, progress, ready_tx, true),
                    _ => {}
                }
                self.session.send_replace(session.clone());

                if self.events.send(event).is_err() {
                    return Ok(Flow::Shutdown);
                }
                Ok(Flow::Continue)
            }
            ServerFrame::HeartbeatAck => {
                heartbeat.ack();
                Ok(Flow::Continue)
            }
            ServerFrame::HeartbeatRequest => {
                heartbeat.request_immediate();
                Ok(Flow::Continue)
            }
            ServerFrame::Reconnect => {
                info!(event = "gateway_reconnect_requested", sequence = session.sequence);
                Ok(Flow::Reconnect)
            }
            ServerFrame::InvalidSession { resumable } => {
                if progress.identify_pending {
                    if progress.invalidated_before {
                        return Err(GatewayError::InvalidSession);
                    }
                    progress.invalidated = true;
                }
                warn!(event = "gateway_session_invalidated", resumable);
                if !resumable || progress.invalidated {
                    session.reset();
                    sequence_tx.send_replace(session.sequence);
                    self.session.send_replace(session.clone());
                }
                Ok(Flow::Reconnect)
            }
            ServerFrame::Hello { .. } => {
                debug!(event = "gateway_unexpected_hello");
                Ok(Flow::Continue)
            }
            ServerFrame::Unknown { op } => {
                debug!(event = "gateway_unknown_op", op);
                Ok(Flow::Continue)
            }
        }
    }

    fn mark_connected(
        &self,
        session: &mut Session,
        progress: &mut Progress,
        ready_tx: &mut Option<ReadySender>,
        resumed: bool,
    ) {
        session.connected = true;
        progress.identify_pending = false;
        progress.reached_ready = true;
        let session_id = session.session_id.as_deref().unwrap_or_default();
        if resumed {
            info!(event = "gateway_resumed", session_id, sequence = session.sequence);
        } else {
            info!(event = "gateway_ready", session_id, sequence = session.sequence);
        }
        self.publish(GatewayStatus::Connected { resumed });
        if let Some(tx) = ready_tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn stop_with_error(&self, err: &GatewayError) {
        error!(event = "gateway_session_failed", error = %err);
        self.publish(GatewayStatus::Stopped {
            error: Some(err.to_string()),
        });
    }

    fn publish(&self, status: GatewayStatus) {
        let _ = self.status.send(status);
    }
}

enum Flow {
    Continue,
    Reconnect,
    Shutdown,
}

struct Progress {
    /// A fresh identify was sent and neither `READY` nor `RESUMED` followed.
    identify_pending: bool,
    reached_ready: bool,
    /// The previous identify was rejected with an invalid session.
    invalidated_before: bool,
    invalidated: bool,
}

impl Progress {
    fn reconnect(&self) -> SessionOutcome {
        SessionOutcome::Reconnect {
            reached_ready: self.reached_ready,
            invalidated: self.invalidated,
        }
    }
}

fn closed_by_server(session: &mut Session, code: u16, reason: String) -> Result<Flow, GatewayError> {
    match close_action(code) {
        CloseAction::Resume => {
            debug!(event = "gateway_closed", code, reason = %reason);
            Ok(Flow::Reconnect)
        }
        CloseAction::Reidentify => {
            warn!(event = "gateway_closed_session_discarded", code, reason = %reason);
            session.reset();
            Ok(Flow::Reconnect)
        }
        CloseAction::Unauthorized => Err(GatewayError::Unauthorized),
        CloseAction::Fatal => Err(GatewayError::Closed { code, reason }),
    }
}

async fn open_socket(url: &str) -> Result<(Socket, Duration), GatewayError> {
    let (mut socket, _) = connect_async(url)
        .await
        .map_err(GatewayError::from_handshake)?;
    let interval = recv_hello(&mut socket).await?;
    Ok((socket, interval))
}

async fn recv_hello(socket: &mut Socket) -> Result<Duration, GatewayError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return match ServerFrame::from_text(&text)? {
                    ServerFrame::Hello { heartbeat_interval } => Ok(heartbeat_interval),
                    other => Err(GatewayError::Protocol(format!(
                        "expected hello as first frame, got {other:?}"
                    ))),
                };
            }
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                let code = frame.map(|frame| u16::from(frame.code));
                if code.map(close_action) == Some(CloseAction::Unauthorized) {
                    return Err(GatewayError::Unauthorized);
                }
                return Err(GatewayError::Protocol(
                    "socket closed before hello".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(GatewayError::Protocol(
                    "received non-text frame before hello".to_string(),
                ));
            }
            Some(Err(err)) => return Err(GatewayError::WebSocket(err)),
            None => {
                return Err(GatewayError::Protocol(
                    "socket ended before hello".to_string(),
                ));
            }
        }
    }
}

async fn send_frame(socket: &mut Socket, frame: &ClientFrame) -> Result<(), GatewayError> {
    let text = frame.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn close_socket(socket: &mut Socket, code: WsCloseCode) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(""),
    };
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, socket.close(Some(frame))).await;
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means nobody holds the connection any more.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
