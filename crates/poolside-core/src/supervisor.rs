// ── Connection supervisor ──
//
// Keeps a `Link` up: exponential backoff between failed attempts, a
// circuit breaker after a run of failures, and a debounce so a brief
// drop that heals quickly never surfaces as a disconnect. A link that
// drops soon after connecting counts as a failed attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use strum::{Display, IntoStaticStr};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::controller::Link;
use crate::error::CoreError;

const EVENT_CHANNEL_SIZE: usize = 64;

// ── Events and status ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// First successful connection.
    Started,
    /// Connection restored after a loss.
    Reconnected,
    /// The link has stayed down past the debounce window.
    Disconnected { cause: String },
    /// An attempt failed; the next one follows after `delay`.
    Retrying { delay: Duration },
    /// Too many consecutive failures; pausing for `cooldown`.
    CircuitOpen { cooldown: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Connecting,
    Connected,
    /// Lost; inside the debounce window, not yet reported.
    Disconnecting,
    /// Waiting out a backoff delay or breaker cooldown.
    Backoff,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u64,
}

// ── Supervisor ───────────────────────────────────────────────────

/// Supervises one [`Link`]. Cheaply cloneable.
pub struct Supervisor<L: Link> {
    inner: Arc<SupervisorInner<L>>,
}

impl<L: Link> Clone for Supervisor<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct SupervisorInner<L> {
    link: Arc<L>,
    config: SupervisorConfig,
    events: broadcast::Sender<SupervisorEvent>,
    status: watch::Sender<SupervisorStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<L: Link> Supervisor<L> {
    pub fn new(link: Arc<L>, config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (status, _) = watch::channel(SupervisorStatus {
            state: SupervisorState::Idle,
            consecutive_failures: 0,
            reconnect_attempts: 0,
        });
        Self {
            inner: Arc::new(SupervisorInner {
                link,
                config,
                events,
                status,
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn link(&self) -> &Arc<L> {
        &self.inner.link
    }

    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.inner.status.subscribe()
    }

    /// Make the first connection attempt.
    ///
    /// Its result is returned to the caller; either way, supervision
    /// continues in the background until [`stop()`](Self::stop).
    pub async fn start(&self) -> Result<(), CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::Stopped);
        }
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return Err(CoreError::AlreadyStarted);
        }

        let mut runner = Runner::new(self.inner.clone());
        runner.set_state(SupervisorState::Connecting);
        let first = self.inner.link.start().await;
        let next = match &first {
            Ok(()) => {
                runner.on_connected();
                Next::Watch
            }
            Err(e) => Next::Wait(runner.on_failure(e)),
        };

        *task = Some(tokio::spawn(runner.run(next)));
        first
    }

    /// Stop supervising and close the link. Terminal: no further events.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.task.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.link.stop().await;
        self.inner.status.send_modify(|s| s.state = SupervisorState::Stopped);
        info!("supervisor stopped");
    }
}

// ── Background runner ────────────────────────────────────────────

enum Next {
    /// Connected; wait for the link to drop.
    Watch,
    /// Sleep, then attempt.
    Wait(Duration),
    Attempt,
}

struct Pending {
    deadline: Instant,
    cause: String,
}

struct Runner<L> {
    inner: Arc<SupervisorInner<L>>,
    phase: SupervisorState,
    failures: u32,
    /// Failures that preceded the current connection, resumed if it
    /// proves unstable.
    carried_failures: u32,
    connected_at: Option<Instant>,
    last_failure: Option<Instant>,
    reconnect_attempts: u64,
    breaker_open: bool,
    ever_connected: bool,
    loss_observed: bool,
    debounce: Option<Pending>,
}

impl<L: Link> Runner<L> {
    fn new(inner: Arc<SupervisorInner<L>>) -> Self {
        Self {
            inner,
            phase: SupervisorState::Idle,
            failures: 0,
            carried_failures: 0,
            connected_at: None,
            last_failure: None,
            reconnect_attempts: 0,
            breaker_open: false,
            ever_connected: false,
            loss_observed: false,
            debounce: None,
        }
    }

    async fn run(mut self, mut next: Next) {
        let link = self.inner.link.clone();
        loop {
            next = match next {
                Next::Watch => match self.until_cancelled(link.lost()).await {
                    None => break,
                    Some(cause) => self.on_lost(cause),
                },
                Next::Wait(delay) => {
                    self.set_state(SupervisorState::Backoff);
                    if self
                        .until_cancelled(tokio::time::sleep(delay))
                        .await
                        .is_none()
                    {
                        break;
                    }
                    if self.breaker_open {
                        self.breaker_open = false;
                        self.failures = 0;
                        debug!("circuit breaker closed");
                    }
                    Next::Attempt
                }
                Next::Attempt => {
                    self.reconnect_attempts += 1;
                    self.set_state(SupervisorState::Connecting);
                    debug!(attempt = self.reconnect_attempts, "reconnecting");
                    match self.until_cancelled(link.start()).await {
                        None => break,
                        Some(Ok(())) => {
                            self.on_connected();
                            Next::Watch
                        }
                        Some(Err(e)) => Next::Wait(self.on_failure(&e)),
                    }
                }
            };
        }
        debug!("supervisor task exiting");
    }

    /// Await `fut`, firing a due disconnect report along the way.
    /// Returns `None` once stopped.
    async fn until_cancelled<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        let cancel = self.inner.cancel.clone();
        tokio::pin!(fut);
        loop {
            let deadline = self.debounce.as_ref().map(|p| p.deadline);
            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                out = &mut fut => return Some(out),
                () = sleep_until(deadline) => self.report_disconnect(),
            }
        }
    }

    fn on_connected(&mut self) {
        self.carried_failures = self.failures;
        self.failures = 0;
        self.last_failure = None;
        self.breaker_open = false;
        self.connected_at = Some(Instant::now());
        if self.debounce.take().is_some() {
            debug!("link restored within debounce window");
        }
        self.set_state(SupervisorState::Connected);

        if !self.ever_connected {
            self.ever_connected = true;
            info!("link started");
            self.emit(SupervisorEvent::Started);
        } else if self.loss_observed {
            info!("link reconnected");
            self.emit(SupervisorEvent::Reconnected);
        }
        self.loss_observed = false;
    }

    /// Record a loss and pick the next step. A link that was up for at
    /// least `stable_after` gets one immediate retry; a shorter-lived one
    /// resumes the failure count and backs off.
    fn on_lost(&mut self, cause: String) -> Next {
        let uptime = self
            .connected_at
            .take()
            .map_or(Duration::ZERO, |at| at.elapsed());
        warn!(%cause, uptime_secs = uptime.as_secs_f64(), "link lost");
        self.loss_observed = true;
        self.debounce = Some(Pending {
            deadline: Instant::now() + self.inner.config.disconnect_debounce,
            cause: cause.clone(),
        });
        self.set_state(SupervisorState::Disconnecting);

        if uptime < self.inner.config.stable_after {
            self.failures = self.carried_failures;
            let err = CoreError::ConnectionLost { reason: cause };
            Next::Wait(self.on_failure(&err))
        } else {
            self.carried_failures = 0;
            Next::Attempt
        }
    }

    fn report_disconnect(&mut self) {
        if let Some(pending) = self.debounce.take() {
            warn!(cause = %pending.cause, "link still down after debounce window");
            self.publish();
            self.emit(SupervisorEvent::Disconnected {
                cause: pending.cause,
            });
        }
    }

    /// Record a failed attempt and return how long to wait.
    fn on_failure(&mut self, err: &CoreError) -> Duration {
        let config = &self.inner.config;
        let now = Instant::now();
        if self
            .last_failure
            .is_some_and(|last| now.saturating_duration_since(last) > config.cooldown)
        {
            self.failures = 0;
        }
        self.failures += 1;
        self.last_failure = Some(now);

        if self.failures >= config.failure_threshold {
            let cooldown = config.cooldown;
            error!(
                error = %err,
                failures = self.failures,
                cooldown_secs = cooldown.as_secs(),
                "connection attempts failing, opening circuit breaker"
            );
            self.breaker_open = true;
            self.publish();
            self.emit(SupervisorEvent::CircuitOpen { cooldown });
            return cooldown;
        }

        let delay = config.backoff_delay(self.failures);
        error!(
            error = %err,
            failures = self.failures,
            delay_secs = delay.as_secs_f64(),
            "connection attempt failed"
        );
        self.publish();
        self.emit(SupervisorEvent::Retrying { delay });
        delay
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn set_state(&mut self, state: SupervisorState) {
        self.phase = state;
        self.publish();
    }

    /// Publish the current status. Retrying inside the debounce window
    /// still reads as `Disconnecting`.
    fn publish(&self) {
        let state = match self.phase {
            SupervisorState::Connecting | SupervisorState::Backoff if self.debounce.is_some() => {
                SupervisorState::Disconnecting
            }
            phase => phase,
        };
        self.inner.status.send_replace(SupervisorStatus {
            state,
            consecutive_failures: self.failures,
            reconnect_attempts: self.reconnect_attempts,
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
