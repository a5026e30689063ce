//! Connection health monitoring.
//!
//! The controller has no native ping/pong, so liveness is synthesized: a
//! cheap read goes out when the link is quiet, missed answers are counted,
//! stalled flow control is reset, and a silent socket is eventually closed.
//!
//! [`HealthMonitor`] is pure bookkeeping driven by the connection's tick.
//! It never touches the socket itself; it returns [`HeartbeatAction`]s.

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use crate::connection::CloseReason;
use crate::flow::FlowControl;
use crate::message::Params;

/// Command used for keepalive reads.
pub const KEEPALIVE_COMMAND: &str = "GetParamList";

// ── HeartbeatConfig ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often the monitor runs. Default: 30s.
    pub tick_interval: Duration,
    /// Quiet period after which a keepalive is sent. Default: 90s.
    pub keepalive_interval: Duration,
    /// How long a keepalive may go unanswered before it counts as missed.
    /// Default: 10s.
    pub keepalive_timeout: Duration,
    /// Consecutive missed keepalives that close the connection. Default: 3.
    pub max_missed_keepalives: u32,
    /// Requests pending with no flow-control activity for this long are
    /// force-reset. Default: 45s.
    pub deadlock_window: Duration,
    /// No inbound data for this long closes the connection. Default: 300s.
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(90),
            keepalive_timeout: Duration::from_secs(10),
            max_missed_keepalives: 3,
            deadlock_window: Duration::from_secs(45),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Floor for the monitor tick. A zero period cannot drive an interval.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

impl HeartbeatConfig {
    /// The tick period actually used, never below [`MIN_TICK_INTERVAL`].
    pub fn tick(&self) -> Duration {
        self.tick_interval.max(MIN_TICK_INTERVAL)
    }
}

/// Fields of the keepalive request: the system object's `MODE`, which is
/// always present.
pub fn keepalive_fields() -> Params {
    let mut fields = Params::new();
    fields.insert("condition".into(), json!("OBJTYP=SYSTEM"));
    fields.insert(
        "objectList".into(),
        json!([{"objnam": "INCR", "keys": ["MODE"]}]),
    );
    fields
}

// ── HealthMonitor ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendKeepalive,
    ResetFlowControl { in_flight: usize },
    Close(CloseReason),
}

#[derive(Debug)]
pub struct HealthMonitor {
    config: HeartbeatConfig,
    last_data: Instant,
    last_keepalive: Instant,
    outstanding: Option<(String, Instant)>,
    missed: u32,
}

impl HealthMonitor {
    pub fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_data: now,
            last_keepalive: now,
            outstanding: None,
            missed: 0,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn data_received(&mut self, now: Instant) {
        self.last_data = now;
    }

    pub fn keepalive_sent(&mut self, message_id: String, now: Instant) {
        self.last_keepalive = now;
        self.outstanding = Some((message_id, now));
    }

    /// A keepalive response came back.
    ///
    /// Answers to keepalives already written off as missed are ignored.
    pub fn keepalive_answered(&mut self, message_id: &str, success: bool) {
        let matches = self
            .outstanding
            .as_ref()
            .is_some_and(|(id, _)| id == message_id);
        if !matches {
            return;
        }
        self.outstanding = None;
        if success {
            self.missed = 0;
        } else {
            self.missed += 1;
            tracing::warn!(missed = self.missed, "keepalive answered with an error code");
        }
    }

    /// Forget the outstanding keepalive (its request was discarded).
    pub fn keepalive_abandoned(&mut self) {
        self.outstanding = None;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    pub fn keepalive_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Run one monitor pass.
    pub fn on_tick(&mut self, now: Instant, flow: &FlowControl) -> Vec<HeartbeatAction> {
        let idle = now.saturating_duration_since(self.last_data);
        if idle > self.config.idle_timeout {
            return vec![HeartbeatAction::Close(CloseReason::IdleTimeout { idle })];
        }

        if let Some((id, sent)) = &self.outstanding {
            if now.saturating_duration_since(*sent) >= self.config.keepalive_timeout {
                self.missed += 1;
                tracing::warn!(
                    message_id = %id,
                    missed = self.missed,
                    max = self.config.max_missed_keepalives,
                    "keepalive response missed"
                );
                self.outstanding = None;
            }
        }

        if self.missed >= self.config.max_missed_keepalives {
            return vec![HeartbeatAction::Close(CloseReason::KeepaliveMissed {
                missed: self.missed,
            })];
        }

        let mut actions = Vec::new();

        if flow.is_stalled(now, self.config.deadlock_window) {
            actions.push(HeartbeatAction::ResetFlowControl {
                in_flight: flow.in_flight(),
            });
        }

        let quiet_since = self.last_keepalive.max(self.last_data);
        if self.outstanding.is_none()
            && now.saturating_duration_since(quiet_since) >= self.config.keepalive_interval
        {
            actions.push(HeartbeatAction::SendKeepalive);
        }

        actions
    }
}
