//! One TCP session with the controller.
//!
//! [`Connection::connect`] opens the socket and spawns a session task that
//! exclusively owns the framed stream, flow control, the correlator and the
//! health monitor. Callers talk to it through a command channel and get
//! their response back on a oneshot, so no lock is shared with the socket.
//!
//! ```rust,ignore
//! use poolside_api::{Connection, ConnectionConfig};
//!
//! let conn = Connection::connect("10.0.0.5", 6681, ConnectionConfig::default(), None).await?;
//! let resp = conn.send_request("GetQuery", fields).await?;
//! conn.disconnect().await;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::{DEFAULT_MAX_FRAME_SIZE, MessageCodec};
use crate::error::{DispatchError, Error};
use crate::flow::{
    CorrelationPolicy, Correlator, DEFAULT_MAX_QUEUE, Dispatch, FlowControl, Outbound,
    PendingRequest, Waiter,
};
use crate::heartbeat::{
    HealthMonitor, HeartbeatAction, HeartbeatConfig, KEEPALIVE_COMMAND, keepalive_fields,
};
use crate::message::{Incoming, Notification, Params, Request, Response};

/// Default controller port for the raw TCP protocol.
pub const DEFAULT_PORT: u16 = 6681;

const COMMAND_CHANNEL_SIZE: usize = 64;

// ── ConnectionConfig ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP connect timeout. Default: 10s.
    pub connect_timeout: Duration,
    /// Per-request response timeout. Default: 30s.
    pub response_timeout: Duration,
    /// Cap on buffered unterminated input. Default: 1,000,000 bytes.
    pub max_frame_size: usize,
    /// Wait-queue capacity behind the in-flight request. Default: 100.
    pub max_queue: usize,
    pub correlation: CorrelationPolicy,
    pub heartbeat: HeartbeatConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_queue: DEFAULT_MAX_QUEUE,
            correlation: CorrelationPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_correlation(mut self, policy: CorrelationPolicy) -> Self {
        self.correlation = policy;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Abandoned requests older than this are purged from the correlator.
    fn stale_after(&self) -> Duration {
        self.response_timeout.saturating_mul(2)
    }
}

// ── Close reasons / link state ──────────────────────────────────────

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Local `disconnect()` or every handle dropped.
    Requested,
    /// The controller closed the socket.
    RemoteClosed,
    KeepaliveMissed { missed: u32 },
    IdleTimeout { idle: Duration },
    /// Oversize buffer or undecodable bytes.
    Protocol(String),
    Io(String),
    /// A notification handler failed; closing forces a clean resync.
    Dispatch(String),
}

impl CloseReason {
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Requested)
    }

    fn from_error(err: &Error) -> Self {
        match err {
            Error::Io(e) => Self::Io(e.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "closed locally"),
            Self::RemoteClosed => write!(f, "closed by controller"),
            Self::KeepaliveMissed { missed } => write!(f, "{missed} keepalives missed"),
            Self::IdleTimeout { idle } => write!(f, "no data received for {idle:?}"),
            Self::Protocol(reason) => write!(f, "protocol error: {reason}"),
            Self::Io(reason) => write!(f, "I/O error: {reason}"),
            Self::Dispatch(reason) => write!(f, "notification dispatch failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Open,
    Closed(CloseReason),
}

impl LinkState {
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Self::Open => None,
            Self::Closed(reason) => Some(reason),
        }
    }
}

// ── NotificationHandler ─────────────────────────────────────────────

/// Receives `NotifyList` pushes on the session task.
///
/// The session awaits each call before reading the next message, so a slow
/// handler applies backpressure to the socket. A handler must not issue
/// requests on the same connection from inside the call: the session cannot
/// answer them until the call returns.
pub trait NotificationHandler: Send + Sync + 'static {
    fn on_notification(&self, notification: Notification) -> BoxFuture<'_, Result<(), DispatchError>>;
}

// ── Connection ──────────────────────────────────────────────────────

enum SessionCommand {
    Request {
        command: String,
        fields: Params,
        reply: oneshot::Sender<Result<Response, Error>>,
    },
}

/// Handle to a live session. Cheaply cloneable.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    addr: String,
    config: ConnectionConfig,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<LinkState>,
    cancel: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.inner.addr)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a session. Message ids start at 1 for every new connection.
    pub async fn connect(
        host: &str,
        port: u16,
        config: ConnectionConfig,
        handler: Option<Arc<dyn NotificationHandler>>,
    ) -> Result<Self, Error> {
        let addr = format!("{host}:{port}");
        tracing::debug!(%addr, "connecting to controller");

        let stream =
            match tokio::time::timeout(config.connect_timeout, TcpStream::connect((host, port)))
                .await
            {
                Err(_) => {
                    return Err(Error::ConnectTimeout {
                        addr,
                        timeout: config.connect_timeout,
                    });
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    return Err(Error::ConnectRefused { addr });
                }
                Ok(Err(e)) => {
                    return Err(Error::Connect {
                        addr,
                        reason: e.to_string(),
                    });
                }
                Ok(Ok(stream)) => stream,
            };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "could not set TCP_NODELAY");
        }

        let framed = Framed::new(stream, MessageCodec::with_max_frame_size(config.max_frame_size));
        let (sink, frames) = framed.split();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(LinkState::Open);
        let cancel = CancellationToken::new();

        let session = Session::new(&config, sink, handler);
        tokio::spawn(run_session(
            session,
            frames,
            command_rx,
            cancel.clone(),
            state_tx,
        ));

        tracing::info!(%addr, "connected to controller");
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                addr,
                config,
                commands: command_tx,
                state: state_rx,
                cancel,
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.inner.state.borrow(), LinkState::Open)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.state.borrow().close_reason().cloned()
    }

    /// Send a request with the configured response timeout.
    pub async fn send_request(&self, command: &str, fields: Params) -> Result<Response, Error> {
        self.send_request_with_timeout(command, fields, self.inner.config.response_timeout)
            .await
    }

    /// Send a request and wait for its response.
    ///
    /// Timing out only fails this call; the session stays up.
    pub async fn send_request_with_timeout(
        &self,
        command: &str,
        fields: Params,
        timeout: Duration,
    ) -> Result<Response, Error> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(SessionCommand::Request {
                command: command.to_owned(),
                fields,
                reply,
            })
            .await
            .map_err(|_| Error::Disconnected)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                tracing::warn!(command, ?timeout, "request timed out");
                Err(Error::Timeout {
                    command: command.to_owned(),
                    timeout,
                })
            }
        }
    }

    /// Resolves once the session has ended, with the reason.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.inner.state.clone();
        let result = state
            .wait_for(|s| matches!(s, LinkState::Closed(_)))
            .await
            .map(|s| s.close_reason().cloned());
        match result {
            Ok(Some(reason)) => reason,
            // The session task is gone without publishing a reason.
            Ok(None) | Err(_) => self.close_reason().unwrap_or(CloseReason::RemoteClosed),
        }
    }

    /// Close the session and wait for it to wind down. Pending requests
    /// fail with [`Error::Disconnected`].
    pub async fn disconnect(&self) {
        self.inner.cancel.cancel();
        let reason = self.closed().await;
        tracing::debug!(addr = %self.inner.addr, %reason, "disconnected");
    }
}

// ── Session task ────────────────────────────────────────────────────

type FrameSink = SplitSink<Framed<TcpStream, MessageCodec>, Bytes>;
type FrameStream = SplitStream<Framed<TcpStream, MessageCodec>>;

struct Session {
    sink: FrameSink,
    flow: FlowControl,
    correlator: Correlator,
    monitor: HealthMonitor,
    handler: Option<Arc<dyn NotificationHandler>>,
    next_id: u64,
    max_queue: usize,
    stale_after: Duration,
}

async fn run_session(
    mut session: Session,
    mut frames: FrameStream,
    mut commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
    state: watch::Sender<LinkState>,
) {
    let tick = session.monitor.config().tick();
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break CloseReason::Requested,
            frame = frames.next() => match frame {
                Some(Ok(message)) => {
                    if let Err(reason) = session.on_message(message).await {
                        break reason;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "closing connection on framing error");
                    break CloseReason::from_error(&e);
                }
                None => break CloseReason::RemoteClosed,
            },
            command = commands.recv() => match command {
                Some(command) => {
                    if let Err(reason) = session.on_command(command).await {
                        break reason;
                    }
                }
                None => break CloseReason::Requested,
            },
            _ = ticker.tick() => {
                if let Err(reason) = session.on_tick().await {
                    break reason;
                }
            }
        }
    };

    session.shutdown(&reason).await;
    state.send_replace(LinkState::Closed(reason));
}

impl Session {
    fn new(
        config: &ConnectionConfig,
        sink: FrameSink,
        handler: Option<Arc<dyn NotificationHandler>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            sink,
            flow: FlowControl::new(config.max_queue, now),
            correlator: Correlator::new(config.correlation),
            monitor: HealthMonitor::new(config.heartbeat.clone(), now),
            handler,
            next_id: 0,
            max_queue: config.max_queue,
            stale_after: config.stale_after(),
        }
    }

    fn next_message_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    async fn on_command(&mut self, command: SessionCommand) -> Result<(), CloseReason> {
        let SessionCommand::Request {
            command,
            fields,
            reply,
        } = command;
        self.submit(command, fields, Waiter::Caller(reply))
            .await
            .map(|_| ())
    }

    /// Assign an id, serialize, and hand the request to flow control.
    ///
    /// Returns the message id if the request is now pending.
    async fn submit(
        &mut self,
        command: String,
        fields: Params,
        waiter: Waiter,
    ) -> Result<Option<String>, CloseReason> {
        let message_id = self.next_message_id();
        let request = Request {
            message_id: message_id.clone(),
            command,
            fields,
        };
        let payload = match request.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                PendingRequest {
                    message_id,
                    command: request.command,
                    created: Instant::now(),
                    waiter,
                }
                .fail(e);
                return Ok(None);
            }
        };

        let now = Instant::now();
        let pending = PendingRequest {
            message_id: message_id.clone(),
            command: request.command,
            created: now,
            waiter,
        };
        let outbound = Outbound {
            message_id: message_id.clone(),
            payload,
        };
        match self.flow.submit(outbound, now) {
            Dispatch::Write(outbound) => {
                self.correlator.register(pending);
                self.write(outbound).await?;
                Ok(Some(message_id))
            }
            Dispatch::Queued => {
                tracing::trace!(
                    message_id = %pending.message_id,
                    queued = self.flow.queued(),
                    "request queued behind in-flight request"
                );
                self.correlator.register(pending);
                Ok(Some(message_id))
            }
            Dispatch::Overflow(outbound) => {
                tracing::warn!(
                    message_id = %outbound.message_id,
                    command = %pending.command,
                    capacity = self.max_queue,
                    "request queue full, dropping request"
                );
                pending.fail(Error::QueueFull {
                    capacity: self.max_queue,
                });
                Ok(None)
            }
        }
    }

    async fn write(&mut self, outbound: Outbound) -> Result<(), CloseReason> {
        tracing::debug!(message_id = %outbound.message_id, "sending request");
        self.sink.send(outbound.payload).await.map_err(|e| {
            tracing::warn!(error = %e, "write failed");
            CloseReason::from_error(&e)
        })
    }

    async fn on_message(&mut self, message: Params) -> Result<(), CloseReason> {
        self.monitor.data_received(Instant::now());

        match Incoming::classify(message) {
            Ok(Incoming::Response(response)) => self.on_response(response).await,
            Ok(Incoming::Notification(notification)) => {
                tracing::debug!(objects = notification.objects.len(), "received NotifyList");
                if let Some(handler) = &self.handler {
                    handler
                        .on_notification(notification)
                        .await
                        .map_err(|e| CloseReason::Dispatch(e.0))?;
                }
                Ok(())
            }
            Ok(Incoming::Other { command }) => {
                tracing::debug!(%command, "ignoring unsolicited message");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed message");
                Ok(())
            }
        }
    }

    async fn on_response(&mut self, response: Response) -> Result<(), CloseReason> {
        let now = Instant::now();
        match self.correlator.resolve(&response.message_id) {
            Some(pending) => {
                tracing::debug!(
                    message_id = %pending.message_id,
                    command = %pending.command,
                    code = %response.code,
                    "received response"
                );
                match pending.waiter {
                    Waiter::Keepalive => {
                        self.monitor
                            .keepalive_answered(&pending.message_id, response.is_success());
                    }
                    Waiter::Caller(reply) => {
                        let _ = reply.send(response.into_result());
                    }
                }
            }
            None => {
                tracing::warn!(
                    message_id = %response.message_id,
                    command = %response.command,
                    "response matched no pending request"
                );
            }
        }

        // Any response frees the wire, matched or not.
        if let Some(next) = self.flow.on_response(now) {
            self.write(next).await?;
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<(), CloseReason> {
        let now = Instant::now();
        self.purge_stale(now);

        for action in self.monitor.on_tick(now, &self.flow) {
            match action {
                HeartbeatAction::SendKeepalive => {
                    tracing::debug!("sending keepalive");
                    let submitted = self
                        .submit(KEEPALIVE_COMMAND.to_owned(), keepalive_fields(), Waiter::Keepalive)
                        .await?;
                    if let Some(message_id) = submitted {
                        self.monitor.keepalive_sent(message_id, now);
                    }
                }
                HeartbeatAction::ResetFlowControl { in_flight } => {
                    tracing::warn!(
                        in_flight,
                        queued = self.flow.queued(),
                        "flow control stalled, resetting"
                    );
                    self.reset_flow(now);
                }
                HeartbeatAction::Close(reason) => {
                    tracing::warn!(%reason, "closing unhealthy connection");
                    return Err(reason);
                }
            }
        }
        Ok(())
    }

    /// Drop requests whose callers gave up long ago.
    ///
    /// Unsent requests can always go. Sent ones are only dropped under
    /// strict id matching; with oldest-pending correlation, removing the
    /// head would shift every later response onto the wrong caller.
    fn purge_stale(&mut self, now: Instant) {
        for id in self.correlator.stale_ids(now, self.stale_after) {
            let was_queued = self.flow.discard_queued(&id);
            if was_queued || self.correlator.policy() == CorrelationPolicy::StrictId {
                self.correlator.remove(&id);
                tracing::debug!(message_id = %id, was_queued, "purged stale request");
            }
        }
    }

    fn reset_flow(&mut self, now: Instant) {
        let dropped = self.flow.reset(now);
        for pending in self.correlator.drain() {
            pending.fail(Error::RequestAbandoned);
        }
        self.monitor.keepalive_abandoned();
        tracing::debug!(dropped = dropped.len(), "flow control reset");
    }

    async fn shutdown(&mut self, reason: &CloseReason) {
        let _ = self.flow.reset(Instant::now());
        let pending = self.correlator.drain();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "failing pending requests");
        }
        for request in pending {
            request.fail(Error::Disconnected);
        }
        if let Err(e) = self.sink.close().await {
            tracing::debug!(error = %e, "error closing socket");
        }
        if reason.is_requested() {
            tracing::debug!("session closed");
        } else {
            tracing::info!(%reason, "connection lost");
        }
    }
}
